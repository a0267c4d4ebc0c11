// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! fdbus: a distributed IPC/RPC bus. Processes expose named services and
//! connect to them as clients over Unix-domain sockets (same host) or TCP
//! (across hosts), exchanging request/reply, broadcast/subscribe and
//! publish/get-event messages. A name server resolves service names to
//! transport addresses; an optional host server federates name servers
//! across machines.
//!
//! The entry point is [`Runtime`]: it owns the single cooperative context
//! thread (spec.md §4.1, §9 "global singletons") that every endpoint,
//! session and object in the process is ultimately driven by.

pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod global;
pub mod header;
pub mod host_proxy;
pub mod host_server;
pub mod logger;
pub mod message;
pub mod name_proxy;
pub mod name_server;
pub mod object;
pub mod pipe;
pub mod session;
pub mod sideband;
pub mod socket;
pub mod subscription;
pub mod transport;
pub mod watchdog;
pub mod worker;

use std::sync::mpsc;
use std::time::Duration;

pub use crate::context::{Context, ContextHandle};
pub use crate::endpoint::EndpointRole;
pub use crate::error::{FdbError, FdbResult, StatusCode};
pub use crate::global::{EndpointId, EventCode, MsgCode, ObjectId, SessionId};
pub use crate::message::{Message, MessageKind};
pub use crate::object::{FdbusObject, ObjectFlags};
pub use crate::subscription::{SubscribeItem, SubscriptionType};

use crate::global::make_event_code;

/// Process-wide handle to the single context thread (spec.md §9 "global
/// singletons": `FDB_CONTEXT` becomes this explicit value passed around
/// instead of a static). Cloning a `Runtime` is cheap; every clone reaches
/// the same context.
#[derive(Clone)]
pub struct Runtime {
    handle: ContextHandle,
}

impl Runtime {
    /// Spawns the context thread and returns a handle to it. Call once per
    /// process; every endpoint created from the result shares the same
    /// event loop.
    pub fn start() -> std::io::Result<Runtime> {
        Ok(Runtime { handle: Context::spawn()? })
    }

    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// Registers a new endpoint and returns a handle to it. Blocks until
    /// the registration has actually run on the context thread.
    pub fn create_endpoint(&self, name: impl Into<String>, role: EndpointRole) -> FdbResult<Endpoint> {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        self.handle.post(false, move |ctx| {
            let id = ctx.register_endpoint(name, role);
            let _ = tx.send(id);
        });
        let id = rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))?;
        Ok(Endpoint { runtime: self.clone(), id })
    }
}

/// A user-facing handle to one registered endpoint. Every mutating call
/// round-trips through the context thread; read-only accessors that don't
/// need a precise snapshot are avoided here on purpose (spec.md §5
/// "Shared resources": state is touched only on the context thread).
#[derive(Clone)]
pub struct Endpoint {
    runtime: Runtime,
    id: EndpointId,
}

impl Endpoint {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    fn handle(&self) -> &ContextHandle {
        self.runtime.handle()
    }

    pub fn set_main_object(&self, callback: Box<dyn FdbusObject>, flags: ObjectFlags) -> FdbResult<()> {
        let id = self.id;
        self.handle().call(false, move |ctx| {
            if let Some(ep) = ctx.endpoint_mut(id) {
                ep.set_main_object(callback, flags);
            }
        })
    }

    pub fn add_object(&self, callback: Box<dyn FdbusObject>, flags: ObjectFlags) -> FdbResult<ObjectId> {
        let id = self.id;
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let object_id = ctx.endpoint_mut(id).map(|ep| ep.add_object(callback, flags));
            let _ = tx.send(object_id);
        });
        rx.recv()
            .map_err(|_| FdbError::Status(StatusCode::InternalFail))?
            .ok_or(FdbError::Status(StatusCode::NonExist))
    }

    pub fn bind(&self, url: impl Into<String>) -> FdbResult<()> {
        let id = self.id;
        let url = url.into();
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.bind(id, url));
        });
        rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))?.map(|_| ())
    }

    pub fn connect(&self, url: impl Into<String>, enable_reconnect: bool) -> FdbResult<()> {
        let id = self.id;
        let url = url.into();
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.connect(id, url, enable_reconnect));
        });
        rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))?.map(|_| ())
    }

    pub fn destroy(&self) -> FdbResult<()> {
        let id = self.id;
        self.handle().call(false, move |ctx| ctx.destroy_endpoint(id))
    }

    pub fn enable_watchdog(&self, object_id: ObjectId, interval: Duration, max_retries: u32) -> FdbResult<()> {
        let id = self.id;
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.enable_watchdog(id, object_id, interval, max_retries));
        });
        rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))?
    }

    /// Spontaneous broadcast of `(event_code, topic)` (spec.md §4.3
    /// "Broadcast"). `publish` is the same call with event-cache-enabled
    /// objects, since caching is a per-object flag, not a separate verb.
    pub fn broadcast(&self, object_id: ObjectId, event_code: EventCode, topic: Option<String>, payload: Vec<u8>, force_update: bool) -> FdbResult<()> {
        let id = self.id;
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.broadcast(id, object_id, event_code, topic, payload, force_update));
        });
        rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))?
    }

    /// Asynchronous, non-blocking invoke: returns a live [`Message`] the
    /// caller can attach an `on_terminate` callback to, or block on via
    /// [`Message::wait`] from any thread other than the context's own.
    pub fn invoke_async(&self, session_id: SessionId, object_id: ObjectId, code: MsgCode, payload: Vec<u8>, timeout_ms: u64) -> FdbResult<Message> {
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.invoke(session_id, object_id, code, payload, timeout_ms));
        });
        rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))?
    }

    /// Blocking invoke (spec.md §4.3 "Sync invoke"): never call this from
    /// the context thread itself, a job posted from it, or a callback
    /// dispatched without a worker — `Message::wait` would deadlock exactly
    /// the way a synchronous `ContextHandle::call` would.
    pub fn invoke(&self, session_id: SessionId, object_id: ObjectId, code: MsgCode, payload: Vec<u8>, timeout_ms: u64) -> FdbResult<Message> {
        let msg = self.invoke_async(session_id, object_id, code, payload, timeout_ms)?;
        msg.wait(if timeout_ms == 0 { None } else { Some(Duration::from_millis(timeout_ms)) });
        Ok(msg)
    }

    pub fn send(&self, session_id: SessionId, object_id: ObjectId, code: MsgCode, payload: Vec<u8>) -> FdbResult<()> {
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.send(session_id, object_id, code, payload));
        });
        rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))?
    }

    pub fn get_event(&self, session_id: SessionId, object_id: ObjectId, event_code: EventCode, topic: Option<String>, timeout_ms: u64) -> FdbResult<Message> {
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.get_event(session_id, object_id, event_code, topic, timeout_ms));
        });
        let msg = rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))??;
        msg.wait(if timeout_ms == 0 { None } else { Some(Duration::from_millis(timeout_ms)) });
        Ok(msg)
    }

    pub fn subscribe(&self, session_id: SessionId, object_id: ObjectId, items: Vec<SubscribeItem>, timeout_ms: u64) -> FdbResult<Message> {
        let (tx, rx) = mpsc::channel();
        self.handle().post(false, move |ctx| {
            let _ = tx.send(ctx.subscribe(session_id, object_id, items, timeout_ms));
        });
        let msg = rx.recv().map_err(|_| FdbError::Status(StatusCode::InternalFail))??;
        msg.wait(if timeout_ms == 0 { None } else { Some(Duration::from_millis(timeout_ms)) });
        Ok(msg)
    }
}

/// `fdbMakeEventCode` (spec.md §4.4 "Group semantics"), re-exported at crate
/// root since user object implementations need it as often as the wire
/// types themselves.
pub fn make_event(group: u8, event: EventCode) -> EventCode {
    make_event_code(group, event)
}
