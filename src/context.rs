// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The context (spec.md §3 "Context", §4.1, §9): a single cooperative
//! event loop thread owns every socket, session and endpoint. Everything
//! else talks to it by posting a [`Job`] onto one of two priority queues;
//! `call` blocks the caller until the job has actually run on the context
//! thread, unless the caller *is* the context thread, in which case it
//! would deadlock and returns `StatusCode::DeadLock` instead (spec.md §8
//! edge case "Reentrant synchronous call").
//!
//! This is also where wire frames meet the object model: binding/connecting
//! sockets, accepting sessions, routing inbound frames to the right object's
//! `dispatch_*`, and the core's own handling of subscribe and sideband
//! traffic all live here, since all of it has to run single-threaded against
//! the same `mio::Poll`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

use crate::endpoint::{Endpoint, EndpointRole};
use crate::error::{FdbError, FdbResult, StatusCode};
use crate::global::{
    EndpointId, EventCode, IdSequence, MsgCode, MsgSn, ObjectId, SessionId, SocketId,
    ADDRESS_BIND_RETRY_INTERVAL_MS, ADDRESS_CONNECT_RETRY_INTERVAL_MS, OBJECT_MAIN,
};
use crate::header::{MessageHeader, MessageType, MsgFlags};
use crate::message::{Message, MessageKind};
use crate::session::{Inbound, Session};
use crate::sideband;
use crate::socket::{ClientSocket, ServerSocket};
use crate::subscription::{self, SubscribeItem};

type BoxedJob = Box<dyn FnOnce(&mut Context) + Send>;

struct CompletionSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    fn new() -> Arc<CompletionSignal> {
        Arc::new(CompletionSignal { done: Mutex::new(false), condvar: Condvar::new() })
    }

    fn signal(&self) {
        *self.done.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let guard = self.done.lock().unwrap();
        let _ = self.condvar.wait_while(guard, |done| !*done).unwrap();
    }
}

/// A unit of work run on the context thread. Synchronous callers wrap their
/// closure so it signals a [`CompletionSignal`] when done, rather than the
/// queue itself tracking completion.
struct Job {
    run: BoxedJob,
}

/// Two priority classes (spec.md §4.1 "Urgent jobs"): kicks, teardown and
/// timeouts jump the line ahead of ordinary request/response traffic so a
/// dying session can't be starved behind a backlog of application messages.
struct JobQueue {
    urgent_tx: Sender<Job>,
    urgent_rx: Receiver<Job>,
    normal_tx: Sender<Job>,
    normal_rx: Receiver<Job>,
}

impl JobQueue {
    fn new() -> JobQueue {
        let (urgent_tx, urgent_rx) = unbounded();
        let (normal_tx, normal_rx) = unbounded();
        JobQueue { urgent_tx, urgent_rx, normal_tx, normal_rx }
    }

    fn pop(&self) -> Option<Job> {
        if let Ok(job) = self.urgent_rx.try_recv() {
            return Some(job);
        }
        self.normal_rx.try_recv().ok()
    }
}

/// A cloneable, thread-safe way to reach the context from any thread.
#[derive(Clone)]
pub struct ContextHandle {
    urgent_tx: Sender<Job>,
    normal_tx: Sender<Job>,
    owner_thread: ThreadId,
}

impl ContextHandle {
    /// Fire-and-forget: queues `f` and returns immediately.
    pub fn post<F>(&self, urgent: bool, f: F)
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        let job = Job { run: Box::new(f) };
        let tx = if urgent { &self.urgent_tx } else { &self.normal_tx };
        let _ = tx.send(job);
    }

    /// Blocks until `f` has run on the context thread. Returns
    /// `StatusCode::DeadLock` immediately, without queuing anything, if
    /// called from the context thread itself.
    pub fn call<F>(&self, urgent: bool, f: F) -> FdbResult<()>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        if thread::current().id() == self.owner_thread {
            return Err(FdbError::StatusWithReason(StatusCode::DeadLock, "synchronous call from the context thread".into()));
        }
        let signal = CompletionSignal::new();
        let signal2 = signal.clone();
        let job = Job {
            run: Box::new(move |ctx| {
                f(ctx);
                signal2.signal();
            }),
        };
        let tx = if urgent { &self.urgent_tx } else { &self.normal_tx };
        tx.send(job).map_err(|_| FdbError::StatusWithReason(StatusCode::InternalFail, "context thread is gone".into()))?;
        signal.wait();
        Ok(())
    }
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

struct Timer {
    id: u64,
    fires_at: Instant,
    period: Option<Duration>,
    callback: Box<dyn FnMut(&mut Context) + Send>,
}

/// The event loop state. Lives entirely on the context thread; reached
/// from elsewhere only through a [`ContextHandle`].
pub struct Context {
    poll: Poll,
    jobs: JobQueue,
    endpoints: HashMap<EndpointId, Endpoint>,
    endpoint_ids: IdSequence,
    sessions: HashMap<SessionId, Session>,
    session_ids: IdSequence,
    socket_ids: IdSequence,
    timers: Vec<Timer>,
    running: bool,
    next_token: usize,
    listener_tokens: HashMap<Token, (EndpointId, SocketId)>,
    session_tokens: HashMap<Token, SessionId>,
    session_token_rev: HashMap<SessionId, Token>,
    session_owner: HashMap<SessionId, EndpointId>,
    watchdog_kicks: HashMap<(SessionId, MsgSn), (EndpointId, ObjectId)>,
    /// A handle to this same context, so inbound requests can be armed with
    /// a reply route (spec.md §4.3) before being dispatched to an object.
    self_handle: Option<ContextHandle>,
}

impl Context {
    fn new() -> io::Result<Context> {
        Ok(Context {
            poll: Poll::new()?,
            jobs: JobQueue::new(),
            endpoints: HashMap::new(),
            endpoint_ids: IdSequence::new(),
            sessions: HashMap::new(),
            session_ids: IdSequence::new(),
            socket_ids: IdSequence::new(),
            timers: Vec::new(),
            running: true,
            next_token: 0,
            listener_tokens: HashMap::new(),
            session_tokens: HashMap::new(),
            session_token_rev: HashMap::new(),
            session_owner: HashMap::new(),
            watchdog_kicks: HashMap::new(),
            self_handle: None,
        })
    }

    /// Spawns the context thread and returns a handle to it.
    pub fn spawn() -> io::Result<ContextHandle> {
        let mut ctx = Context::new()?;
        let urgent_tx = ctx.jobs.urgent_tx.clone();
        let normal_tx = ctx.jobs.normal_tx.clone();
        let (tid_tx, tid_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let owner_thread = thread::current().id();
            let _ = tid_tx.send(owner_thread);
            ctx.self_handle = Some(ContextHandle { urgent_tx: ctx.jobs.urgent_tx.clone(), normal_tx: ctx.jobs.normal_tx.clone(), owner_thread });
            ctx.run();
        });
        let owner_thread = tid_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "context thread failed to start"))?;
        Ok(ContextHandle { urgent_tx, normal_tx, owner_thread })
    }

    pub fn register_endpoint(&mut self, name: impl Into<String>, role: EndpointRole) -> EndpointId {
        let id = self.endpoint_ids.next() as EndpointId;
        self.endpoints.insert(id, Endpoint::new(id, name, role));
        id
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&id)
    }

    /// Tears down every session owned by `id`, then drops the endpoint
    /// itself (spec.md §4.1 "Endpoint lifecycle").
    pub fn destroy_endpoint(&mut self, id: EndpointId) {
        let sessions: Vec<SessionId> = self.session_owner.iter().filter(|(_, &e)| e == id).map(|(&s, _)| s).collect();
        for session_id in sessions {
            self.teardown_session(session_id, "endpoint destroyed");
        }
        self.listener_tokens.retain(|_, (ep, _)| *ep != id);
        self.endpoints.remove(&id);
    }

    pub fn next_socket_id(&self) -> SocketId {
        self.socket_ids.next()
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Drops a session and runs its teardown sequence: every outstanding
    /// invoke on it is terminated with `PEER_VANISH` by `Session::teardown`
    /// and routed to its owning object's `on_status`/`on_reply` just like a
    /// normal reply or timeout would be (spec.md §8 "Each invoke's `onReply`
    /// fires with status `PEER_VANISH`"), then the endpoint is told the peer
    /// is offline. `endpoint` is passed in explicitly because by the time
    /// this runs, `teardown_session` has already removed `id` from
    /// `session_owner`.
    pub fn drop_session(&mut self, id: SessionId, endpoint: EndpointId) {
        if let Some(mut session) = self.sessions.remove(&id) {
            let drained = session.teardown();
            for msg in drained {
                self.dispatch_terminal_to(endpoint, id, msg);
            }
        }
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.notify_offline(id);
        }
    }

    pub fn schedule_timer<F>(&mut self, delay: Duration, period: Option<Duration>, callback: F) -> u64
    where
        F: FnMut(&mut Context) + Send + 'static,
    {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        self.timers.push(Timer { id, fires_at: Instant::now() + delay, period, callback: Box::new(callback) });
        id
    }

    pub fn cancel_timer(&mut self, id: u64) {
        self.timers.retain(|t| t.id != id);
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timers.iter().map(|t| t.fires_at).min().map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<u64> = self.timers.iter().filter(|t| t.fires_at <= now).map(|t| t.id).collect();
        for id in due {
            let Some(idx) = self.timers.iter().position(|t| t.id == id) else { continue };
            let mut timer = self.timers.remove(idx);
            (timer.callback)(self);
            if let Some(period) = timer.period {
                timer.fires_at = Instant::now() + period;
                self.timers.push(timer);
            }
        }
    }

    fn drain_jobs(&mut self) {
        while let Some(job) = self.jobs.pop() {
            (job.run)(self);
        }
    }

    /// Runs until `shutdown` is posted. Each iteration drains every pending
    /// job, fires due timers, then polls I/O readiness for whatever time
    /// remains until the next timer.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(256);
        while self.running {
            self.drain_jobs();
            self.fire_due_timers();
            let timeout = self.next_deadline().unwrap_or(Duration::from_millis(100));
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::warn!("poll failed: {e}");
                }
                continue;
            }
            let ready: Vec<(Token, bool, bool)> = events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            for (token, readable, writable) in ready {
                self.dispatch_event(token, readable, writable);
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.running = false;
    }

    // ---- binding / connecting --------------------------------------

    pub fn bind(&mut self, endpoint_id: EndpointId, url: impl Into<String>) -> FdbResult<SocketId> {
        if !self.endpoints.contains_key(&endpoint_id) {
            return Err(FdbError::Status(StatusCode::NonExist));
        }
        let url = url.into();
        let socket_id = self.next_socket_id();
        let mut socket = ServerSocket::new(socket_id, url.clone());
        let result = socket.bind();
        self.endpoints.get_mut(&endpoint_id).unwrap().add_server_socket(socket);
        match result {
            Ok(()) => {
                self.register_listener(endpoint_id, socket_id);
            }
            Err(e) => {
                log::debug!("bind to {url} failed, will retry: {e}");
                self.schedule_bind_retry(endpoint_id, socket_id);
            }
        }
        Ok(socket_id)
    }

    fn register_listener(&mut self, endpoint_id: EndpointId, socket_id: SocketId) {
        let token = self.alloc_token();
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
        let Some(socket) = ep.server_socket_mut(socket_id) else { return };
        let Some(listener) = socket.listener_mut() else { return };
        if let Err(e) = listener.register(self.poll.registry(), token, Interest::READABLE) {
            log::warn!("failed to register listener: {e}");
            return;
        }
        self.listener_tokens.insert(token, (endpoint_id, socket_id));
    }

    fn schedule_bind_retry(&mut self, endpoint_id: EndpointId, socket_id: SocketId) {
        self.schedule_timer(Duration::from_millis(ADDRESS_BIND_RETRY_INTERVAL_MS), None, move |ctx| {
            ctx.retry_bind(endpoint_id, socket_id);
        });
    }

    fn retry_bind(&mut self, endpoint_id: EndpointId, socket_id: SocketId) {
        let result;
        let should_retry;
        {
            let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
            let Some(socket) = ep.server_socket_mut(socket_id) else { return };
            if socket.is_bound() {
                return;
            }
            result = socket.bind();
            should_retry = socket.next_bind_retry().is_some();
        }
        match result {
            Ok(()) => self.register_listener(endpoint_id, socket_id),
            Err(e) => {
                if should_retry {
                    self.schedule_bind_retry(endpoint_id, socket_id);
                } else {
                    log::warn!("giving up binding socket {socket_id}: {e}");
                }
            }
        }
    }

    /// `enable_reconnect` keeps retrying forever past the bounded retry
    /// count, the behavior a name proxy wants for its link to the name
    /// server (spec.md §4.5 "Name proxy reconnection").
    pub fn connect(&mut self, endpoint_id: EndpointId, url: impl Into<String>, enable_reconnect: bool) -> FdbResult<SocketId> {
        if !self.endpoints.contains_key(&endpoint_id) {
            return Err(FdbError::Status(StatusCode::NonExist));
        }
        let url = url.into();
        let socket_id = self.next_socket_id();
        let mut socket = ClientSocket::new(socket_id, url.clone());
        socket.set_enable_reconnect(enable_reconnect);
        let result = socket.connect();
        self.endpoints.get_mut(&endpoint_id).unwrap().add_client_socket(socket);
        match result {
            Ok(()) => self.finish_client_connect(endpoint_id, socket_id),
            Err(e) => {
                log::debug!("connect to {url} failed, will retry: {e}");
                self.schedule_connect_retry(endpoint_id, socket_id, 1);
            }
        }
        Ok(socket_id)
    }

    fn finish_client_connect(&mut self, endpoint_id: EndpointId, socket_id: SocketId) {
        let conn = {
            let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
            let Some(socket) = ep.client_socket_mut(socket_id) else { return };
            match socket.take_connection() {
                Some(c) => c,
                None => return,
            }
        };
        let mut conn = conn;
        let session_id = self.session_ids.next();
        let token = self.alloc_token();
        if let Err(e) = conn.register(self.poll.registry(), token, Interest::READABLE | Interest::WRITABLE) {
            log::warn!("failed to register client session: {e}");
            return;
        }
        let session = Session::new(session_id, socket_id, conn);
        self.sessions.insert(session_id, session);
        self.session_tokens.insert(token, session_id);
        self.session_token_rev.insert(session_id, token);
        self.session_owner.insert(session_id, endpoint_id);

        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
        ep.session_opened();
        if let Some(socket) = ep.client_socket_mut(socket_id) {
            socket.set_session_id(Some(session_id));
        }
        let is_first = ep.session_count() == 1;
        if let Some(main) = ep.object_mut(OBJECT_MAIN) {
            main.dispatch_online(session_id, is_first);
        }
    }

    fn schedule_connect_retry(&mut self, endpoint_id: EndpointId, socket_id: SocketId, attempt: u32) {
        self.schedule_timer(Duration::from_millis(ADDRESS_CONNECT_RETRY_INTERVAL_MS), None, move |ctx| {
            ctx.retry_connect(endpoint_id, socket_id, attempt);
        });
    }

    fn retry_connect(&mut self, endpoint_id: EndpointId, socket_id: SocketId, attempt: u32) {
        let result;
        let should_retry;
        {
            let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
            let Some(socket) = ep.client_socket_mut(socket_id) else { return };
            if socket.is_connected() {
                return;
            }
            result = socket.connect();
            should_retry = socket.next_connect_retry().is_some();
        }
        match result {
            Ok(()) => self.finish_client_connect(endpoint_id, socket_id),
            Err(e) => {
                if should_retry {
                    self.schedule_connect_retry(endpoint_id, socket_id, attempt + 1);
                } else {
                    log::warn!("giving up connecting socket {socket_id} after {attempt} attempts: {e}");
                }
            }
        }
    }

    // ---- accept / read / write --------------------------------------

    fn dispatch_event(&mut self, token: Token, readable: bool, writable: bool) {
        if let Some(&(endpoint_id, socket_id)) = self.listener_tokens.get(&token) {
            if readable {
                self.handle_listener_readable(endpoint_id, socket_id);
            }
            return;
        }
        if let Some(&session_id) = self.session_tokens.get(&token) {
            self.handle_session_io(session_id, readable, writable);
        }
    }

    fn handle_listener_readable(&mut self, endpoint_id: EndpointId, socket_id: SocketId) {
        let accepted = {
            let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
            let Some(socket) = ep.server_socket_mut(socket_id) else { return };
            match socket.accept_all() {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("accept failed on socket {socket_id}: {e}");
                    return;
                }
            }
        };
        for (conn, is_first) in accepted {
            self.accept_session(endpoint_id, socket_id, conn, is_first);
        }
    }

    fn accept_session(&mut self, endpoint_id: EndpointId, socket_id: SocketId, mut conn: Box<dyn crate::transport::Connection>, is_first: bool) {
        let session_id = self.session_ids.next();
        let token = self.alloc_token();
        if let Err(e) = conn.register(self.poll.registry(), token, Interest::READABLE | Interest::WRITABLE) {
            log::warn!("failed to register accepted session: {e}");
            return;
        }
        let session = Session::new(session_id, socket_id, conn);
        self.sessions.insert(session_id, session);
        self.session_tokens.insert(token, session_id);
        self.session_token_rev.insert(session_id, token);
        self.session_owner.insert(session_id, endpoint_id);
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
        ep.session_opened();
        if let Some(main) = ep.object_mut(OBJECT_MAIN) {
            main.dispatch_online(session_id, is_first);
        }
    }

    fn handle_session_io(&mut self, session_id: SessionId, readable: bool, writable: bool) {
        if writable {
            let flushed = {
                let Some(session) = self.sessions.get_mut(&session_id) else { return };
                session.pipe_mut().flush()
            };
            if let Err(e) = flushed {
                self.teardown_session(session_id, &e.to_string());
                return;
            }
        }
        if readable {
            let frames = {
                let Some(session) = self.sessions.get_mut(&session_id) else { return };
                session.read_frames()
            };
            let frames = match frames {
                Ok(f) => f,
                Err(e) => {
                    self.teardown_session(session_id, &e.to_string());
                    return;
                }
            };
            for inbound in frames {
                self.route_inbound(session_id, inbound);
            }
        }
    }

    fn teardown_session(&mut self, session_id: SessionId, reason: &str) {
        log::debug!("session {session_id} torn down: {reason}");
        let Some(endpoint_id) = self.session_owner.remove(&session_id) else { return };
        if let Some(token) = self.session_token_rev.remove(&session_id) {
            self.session_tokens.remove(&token);
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            let _ = session.pipe_mut().connection_mut().deregister(self.poll.registry());
        }
        self.drop_session(session_id, endpoint_id);

        let mut reconnect_socket = None;
        if let Some(ep) = self.endpoints.get_mut(&endpoint_id) {
            for socket_id in ep.socket_ids() {
                if let Some(client) = ep.client_socket_mut(socket_id) {
                    if client.session_id() == Some(session_id) {
                        client.on_disconnected();
                        if client.enable_reconnect() {
                            reconnect_socket = Some(socket_id);
                        }
                    }
                }
            }
        }
        if let Some(socket_id) = reconnect_socket {
            self.schedule_connect_retry(endpoint_id, socket_id, 1);
        }
    }

    // ---- routing ------------------------------------------------------

    fn route_inbound(&mut self, session_id: SessionId, inbound: Inbound) {
        match inbound {
            Inbound::Unmatched(sn) => {
                log::warn!("session {session_id}: reply for unknown serial number {sn}");
            }
            Inbound::Reply(msg) => self.dispatch_terminal(session_id, msg),
            Inbound::New(msg) => self.route_new_message(session_id, msg),
        }
    }

    fn dispatch_terminal(&mut self, session_id: SessionId, msg: Message) {
        let Some(&endpoint_id) = self.session_owner.get(&session_id) else { return };
        self.dispatch_terminal_to(endpoint_id, session_id, msg);
    }

    /// Same as [`Context::dispatch_terminal`] but with the owning endpoint
    /// passed in rather than looked up from `session_owner`, for the
    /// teardown path where the session's entry there is already gone by the
    /// time its drained pending invokes need to be delivered.
    fn dispatch_terminal_to(&mut self, endpoint_id: EndpointId, session_id: SessionId, msg: Message) {
        let sn = msg.sn();
        if let Some((endpoint_id, object_id)) = self.watchdog_kicks.remove(&(session_id, sn)) {
            if let Some(ep) = self.endpoints.get_mut(&endpoint_id) {
                if let Some(obj) = ep.object_mut(object_id) {
                    if let Some(wd) = obj.watchdog_mut() {
                        wd.kick();
                    }
                }
            }
            return;
        }
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
        let Some(obj) = ep.object_mut(msg.object_id()) else { return };
        if msg.is_status() {
            obj.dispatch_status(msg);
        } else {
            obj.dispatch_reply(msg);
        }
    }

    fn route_new_message(&mut self, session_id: SessionId, msg: Message) {
        let Some(&endpoint_id) = self.session_owner.get(&session_id) else { return };
        match msg.kind() {
            MessageKind::SubscribeReq => self.handle_subscribe(endpoint_id, session_id, msg),
            MessageKind::SidebandRequest => self.handle_sideband(endpoint_id, session_id, msg),
            MessageKind::Broadcast => {
                if let Some(ep) = self.endpoints.get_mut(&endpoint_id) {
                    if let Some(obj) = ep.object_mut(msg.object_id()) {
                        obj.dispatch_broadcast(msg);
                    }
                }
            }
            MessageKind::Request => self.handle_request(endpoint_id, session_id, msg),
            _ => {}
        }
    }

    fn handle_request(&mut self, endpoint_id: EndpointId, session_id: SessionId, msg: Message) {
        let object_id = msg.object_id();
        let exists = self.endpoints.get(&endpoint_id).map(|e| e.has_object(object_id)).unwrap_or(false);
        if !exists {
            if let Some(ep) = self.endpoints.get_mut(&endpoint_id) {
                ep.try_create_object(&msg);
            }
        }
        let exists = self.endpoints.get(&endpoint_id).map(|e| e.has_object(object_id)).unwrap_or(false);
        if !exists {
            self.auto_status(session_id, &msg, StatusCode::ObjectNotFound);
            return;
        }

        if msg.flags().contains(MsgFlags::GET_EVENT) {
            let cached = {
                let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
                let Some(obj) = ep.object_mut(object_id) else { return };
                obj.dispatch_get_event(msg.clone());
                obj.cached_event(msg.code(), msg.topic()).map(|b| b.to_vec())
            };
            match cached {
                Some(bytes) => {
                    let _ = self.reply(session_id, &msg, bytes);
                }
                None => self.auto_status(session_id, &msg, StatusCode::NotAvailable),
            }
            return;
        }

        if let Some(handle) = self.self_handle.clone() {
            msg.attach_reply_handle(handle);
        }
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
        let Some(obj) = ep.object_mut(object_id) else { return };
        obj.dispatch_invoke(msg);
    }

    fn handle_subscribe(&mut self, endpoint_id: EndpointId, session_id: SessionId, msg: Message) {
        let items = match subscription::decode_subscribe_list(&msg.payload()) {
            Ok(v) => v,
            Err(_) => {
                self.auto_status(session_id, &msg, StatusCode::MsgDecodeFail);
                return;
            }
        };
        let object_id = msg.object_id();
        let exists = self.endpoints.get(&endpoint_id).map(|e| e.has_object(object_id)).unwrap_or(false);
        if !exists {
            if let Some(ep) = self.endpoints.get_mut(&endpoint_id) {
                ep.try_create_object(&msg);
            }
        }

        let replay: Vec<(EventCode, Option<String>, Vec<u8>)> = {
            let Some(ep) = self.endpoints.get_mut(&endpoint_id) else {
                self.auto_status(session_id, &msg, StatusCode::NonExist);
                return;
            };
            let Some(obj) = ep.object_mut(object_id) else {
                drop(ep);
                self.auto_status(session_id, &msg, StatusCode::ObjectNotFound);
                return;
            };
            obj.subscribe(session_id, &msg, &items);
            obj.cache_entries_in_order()
                .into_iter()
                .filter(|(code, topic, _)| items.iter().any(|it| subscription::item_matches(it, *code, topic.as_deref())))
                .map(|(code, topic, bytes)| (code, topic, bytes.to_vec()))
                .collect()
        };

        for (code, topic, bytes) in replay {
            let mut header = MessageHeader::new(MessageType::Broadcast, object_id, code, 0);
            header.topic = topic;
            header.flags |= MsgFlags::INITIAL_RESPONSE;
            let _ = self.send_frame(session_id, &header, &bytes);
        }
        self.auto_status(session_id, &msg, StatusCode::SubscribeOk);
    }

    fn handle_sideband(&mut self, endpoint_id: EndpointId, session_id: SessionId, msg: Message) {
        let code = msg.code();
        let reply_payload = match code {
            sideband::AUTHENTICATION => {
                let token = sideband::decode_auth_token(&msg.payload());
                let level = self
                    .endpoints
                    .get(&endpoint_id)
                    .and_then(|e| e.token_list().iter().position(|t| t == &token))
                    .map(|i| i as i32 + 1)
                    .unwrap_or(0);
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.set_security_level(level);
                }
                Vec::new()
            }
            sideband::SESSION_INFO => {
                if let Ok((name, _pid, _udp_port)) = sideband::decode_session_info(&msg.payload()) {
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.set_sender_name(name);
                    }
                }
                Vec::new()
            }
            sideband::WATCHDOG => Vec::new(),
            sideband::QUERY_CLIENT => {
                let names: Vec<String> = self
                    .session_owner
                    .iter()
                    .filter(|(_, &e)| e == endpoint_id)
                    .filter_map(|(s, _)| self.sessions.get(s).and_then(|sess| sess.sender_name().map(str::to_owned)))
                    .collect();
                names.join(",").into_bytes()
            }
            sideband::QUERY_EVENT_CACHE => {
                let entries = self
                    .endpoints
                    .get_mut(&endpoint_id)
                    .and_then(|ep| ep.object_mut(msg.object_id()))
                    .map(|obj| obj.cache_entries_in_order().into_iter().map(|(c, t, b)| (c, t, b.to_vec())).collect::<Vec<_>>())
                    .unwrap_or_default();
                sideband::encode_event_cache(&entries).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        let header = MessageHeader::new(MessageType::SidebandReply, msg.object_id(), code, msg.sn());
        let _ = self.send_frame(session_id, &header, &reply_payload);
    }

    // ---- outbound API ---------------------------------------------------

    fn wire_type_for(kind: MessageKind) -> MessageType {
        match kind {
            MessageKind::Request => MessageType::Request,
            MessageKind::SubscribeReq => MessageType::SubscribeReq,
            MessageKind::SidebandRequest => MessageType::SidebandRequest,
            MessageKind::Broadcast => MessageType::Broadcast,
            _ => MessageType::Request,
        }
    }

    fn send_request_message(&mut self, session_id: SessionId, msg: Message, expect_reply: bool) -> FdbResult<()> {
        let sn = {
            let session = self.sessions.get_mut(&session_id).ok_or(FdbError::Status(StatusCode::NonExist))?;
            session.alloc_sn()
        };
        msg.set_sn(sn);
        msg.set_session_id(session_id);
        let mut header = MessageHeader::new(Self::wire_type_for(msg.kind()), msg.object_id(), msg.code(), sn);
        header.flags = msg.flags();
        header.topic = msg.topic().map(str::to_owned);

        let session = self.sessions.get_mut(&session_id).ok_or(FdbError::Status(StatusCode::NonExist))?;
        if expect_reply && !msg.no_reply_expected() {
            session.register_pending(sn, msg.clone());
        }
        let frame = crate::header::encode_frame(&header, &msg.payload()).map_err(FdbError::from)?;
        session.pipe_mut().queue_frame(frame);
        session.pipe_mut().flush().map_err(FdbError::from)
    }

    fn send_frame(&mut self, session_id: SessionId, header: &MessageHeader, payload: &[u8]) -> FdbResult<()> {
        let session = self.sessions.get_mut(&session_id).ok_or(FdbError::Status(StatusCode::NonExist))?;
        let frame = crate::header::encode_frame(header, payload).map_err(FdbError::from)?;
        session.pipe_mut().queue_frame(frame);
        session.pipe_mut().flush().map_err(FdbError::from)
    }

    /// Issues a request that expects a reply; arms a timeout timer when
    /// `timeout_ms > 0` (spec.md §4.3 "Timeout").
    pub fn invoke(&mut self, session_id: SessionId, object_id: ObjectId, code: MsgCode, payload: Vec<u8>, timeout_ms: u64) -> FdbResult<Message> {
        let msg = Message::new_request(object_id, code, payload);
        self.send_request_message(session_id, msg.clone(), true)?;
        self.arm_timeout(session_id, &msg, timeout_ms);
        Ok(msg)
    }

    /// A request with `NOREPLY_EXPECTED` set; no pending entry, no timeout.
    pub fn send(&mut self, session_id: SessionId, object_id: ObjectId, code: MsgCode, payload: Vec<u8>) -> FdbResult<()> {
        let msg = Message::new_send(object_id, code, payload);
        self.send_request_message(session_id, msg, false)
    }

    /// `get` (spec.md §4.3 "Publish/Get"): a request flagged `GET_EVENT`
    /// that the receiving side answers from its cache instead of invoking
    /// user code.
    pub fn get_event(&mut self, session_id: SessionId, object_id: ObjectId, event_code: EventCode, topic: Option<String>, timeout_ms: u64) -> FdbResult<Message> {
        let msg = Message::new_request_with_topic(object_id, event_code, Vec::new(), topic);
        msg.set_flag(MsgFlags::GET_EVENT);
        self.send_request_message(session_id, msg.clone(), true)?;
        self.arm_timeout(session_id, &msg, timeout_ms);
        Ok(msg)
    }

    pub fn subscribe(&mut self, session_id: SessionId, object_id: ObjectId, items: Vec<SubscribeItem>, timeout_ms: u64) -> FdbResult<Message> {
        let payload = subscription::encode_subscribe_list(&items).map_err(FdbError::from)?;
        let msg = Message::new_subscribe(object_id, payload);
        self.send_request_message(session_id, msg.clone(), true)?;
        self.arm_timeout(session_id, &msg, timeout_ms);
        Ok(msg)
    }

    fn arm_timeout(&mut self, session_id: SessionId, msg: &Message, timeout_ms: u64) {
        if timeout_ms == 0 {
            return;
        }
        let sn = msg.sn();
        self.schedule_timer(Duration::from_millis(timeout_ms), None, move |ctx| {
            ctx.timeout_pending(session_id, sn);
        });
    }

    fn timeout_pending(&mut self, session_id: SessionId, sn: MsgSn) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let Some(msg) = session.take_pending(sn) {
                msg.terminate_with_timeout();
                self.dispatch_terminal(session_id, msg);
            }
        }
    }

    /// Spontaneous broadcast (spec.md §4.4 "Broadcast"): fans out to every
    /// normal-type subscriber of `event_code`/`topic`, applying the event
    /// cache's suppress-unchanged rule first when the object has it enabled.
    pub fn broadcast(&mut self, endpoint_id: EndpointId, object_id: ObjectId, event_code: EventCode, topic: Option<String>, payload: Vec<u8>, force_update: bool) -> FdbResult<()> {
        let targets = {
            let ep = self.endpoints.get_mut(&endpoint_id).ok_or(FdbError::Status(StatusCode::NonExist))?;
            let obj = ep.object_mut(object_id).ok_or(FdbError::Status(StatusCode::ObjectNotFound))?;
            if !obj.should_broadcast(event_code, topic.as_deref(), &payload, force_update) {
                return Ok(());
            }
            obj.subscriptions_mut().subscribers_for(event_code, topic.as_deref())
        };
        let mut header = MessageHeader::new(MessageType::Broadcast, object_id, event_code, 0);
        header.topic = topic;
        if force_update {
            header.flags |= MsgFlags::FORCE_UPDATE;
        }
        let frame = crate::header::encode_frame(&header, &payload).map_err(FdbError::from)?;
        for session_id in targets {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.pipe_mut().queue_frame(frame.clone());
                let _ = session.pipe_mut().flush();
            }
        }
        Ok(())
    }

    pub fn reply(&mut self, session_id: SessionId, request: &Message, payload: Vec<u8>) -> FdbResult<()> {
        if request.no_reply_expected() {
            return Ok(());
        }
        let header = MessageHeader::new(MessageType::Reply, request.object_id(), request.code(), request.sn());
        self.send_frame(session_id, &header, &payload)
    }

    pub fn reply_status(&mut self, session_id: SessionId, request: &Message, status: StatusCode, description: &str) -> FdbResult<()> {
        if request.no_reply_expected() {
            return Ok(());
        }
        let mut header = MessageHeader::new(MessageType::Status, request.object_id(), request.code(), request.sn());
        header.flags |= MsgFlags::STATUS;
        if status.is_error() {
            header.flags |= MsgFlags::ERROR;
        }
        let payload = crate::error::encode_status_payload(status, description);
        self.send_frame(session_id, &header, &payload)
    }

    fn auto_status(&mut self, session_id: SessionId, request: &Message, status: StatusCode) {
        let _ = self.reply_status(session_id, request, status, "");
    }

    // ---- watchdog -------------------------------------------------------

    /// Starts a periodic kick/ack cycle against every session of
    /// `endpoint_id` on behalf of `object_id` (spec.md §4.4 "Watchdog").
    pub fn enable_watchdog(&mut self, endpoint_id: EndpointId, object_id: ObjectId, interval: Duration, max_retries: u32) -> FdbResult<()> {
        {
            let ep = self.endpoints.get_mut(&endpoint_id).ok_or(FdbError::Status(StatusCode::NonExist))?;
            let obj = ep.object_mut(object_id).ok_or(FdbError::Status(StatusCode::ObjectNotFound))?;
            obj.enable_watchdog(interval, max_retries);
        }
        self.schedule_timer(interval, Some(interval), move |ctx| ctx.watchdog_tick(endpoint_id, object_id));
        Ok(())
    }

    fn watchdog_tick(&mut self, endpoint_id: EndpointId, object_id: ObjectId) {
        let barked = {
            let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { return };
            let Some(obj) = ep.object_mut(object_id) else { return };
            match obj.watchdog_mut() {
                Some(wd) => wd.on_timer_tick(),
                None => return,
            }
        };
        let sessions: Vec<SessionId> = self.session_owner.iter().filter(|(_, &e)| e == endpoint_id).map(|(&s, _)| s).collect();
        for session_id in &sessions {
            if let Ok(sn) = self.send_sideband(*session_id, object_id, sideband::WATCHDOG, Vec::new()) {
                self.watchdog_kicks.insert((*session_id, sn), (endpoint_id, object_id));
            }
        }
        if barked {
            for session_id in sessions {
                let Some(ep) = self.endpoints.get_mut(&endpoint_id) else { continue };
                let Some(obj) = ep.object_mut(object_id) else { continue };
                obj.dispatch_bark(session_id);
            }
        }
    }

    fn send_sideband(&mut self, session_id: SessionId, object_id: ObjectId, code: MsgCode, payload: Vec<u8>) -> FdbResult<MsgSn> {
        let sn = {
            let session = self.sessions.get_mut(&session_id).ok_or(FdbError::Status(StatusCode::NonExist))?;
            session.alloc_sn()
        };
        let msg = Message::new_sideband_request(object_id, code, payload);
        msg.set_sn(sn);
        let header = MessageHeader::new(MessageType::SidebandRequest, object_id, code, sn);
        let session = self.sessions.get_mut(&session_id).ok_or(FdbError::Status(StatusCode::NonExist))?;
        session.register_pending(sn, msg.clone());
        let frame = crate::header::encode_frame(&header, &msg.payload()).map_err(FdbError::from)?;
        session.pipe_mut().queue_frame(frame);
        session.pipe_mut().flush().map_err(FdbError::from)?;
        Ok(sn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn post_runs_on_the_context_thread() {
        let handle = Context::spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        handle.post(false, move |ctx| {
            let id = ctx.register_endpoint("probe", EndpointRole::Client);
            let _ = tx.send(id);
        });
        let id = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, 0);
        handle.post(true, |ctx| ctx.shutdown());
    }

    #[test]
    fn call_blocks_until_the_job_has_run() {
        let handle = Context::spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        handle
            .call(false, move |ctx| {
                let id = ctx.register_endpoint("probe", EndpointRole::Client);
                let _ = tx.send(id);
            })
            .unwrap();
        assert!(rx.try_recv().is_ok());
        handle.post(true, |ctx| ctx.shutdown());
    }

    #[test]
    fn bind_on_an_unknown_endpoint_fails() {
        let handle = Context::spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        handle.post(false, move |ctx| {
            let result = ctx.bind(999, "ipc:///tmp/does-not-exist-endpoint");
            let _ = tx.send(result.is_err());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        handle.post(true, |ctx| ctx.shutdown());
    }
}
