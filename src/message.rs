// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The ref-counted message job and its request/reply state machine
//! (spec.md §3 "Message", §4.3).
//!
//! A [`Message`] has exactly three terminal states: replied,
//! status-returned, timed-out. `terminate_*` enforces at-most-once
//! termination (spec.md §8 property 2): once one of them succeeds every
//! later call is a silent no-op that returns `false`.
//!
//! The design notes (spec.md §9) call for "a single-owner Message ... or
//! an explicit Arc-equivalent when the pending-reply table and the waker
//! both need a handle". That's exactly our situation: the session's
//! pending-reply table holds a handle to route the eventual reply frame,
//! and a synchronous caller blocks on the very same handle's condvar, so
//! `Message` is `Arc`-backed.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::context::ContextHandle;
use crate::error::StatusCode;
use crate::global::{EventCode, MsgCode, MsgSn, ObjectId, SessionId, INVALID_ID};
use crate::header::{MsgFlags, MsgMetadata};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Reply,
    SubscribeReq,
    Broadcast,
    SidebandRequest,
    SidebandReply,
    Status,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TerminalState {
    Pending,
    Replied,
    StatusReturned,
    TimedOut,
}

struct Shared {
    kind: MessageKind,
    code: MsgCode,
    sn: Mutex<MsgSn>,
    object_id: ObjectId,
    session_id: Mutex<SessionId>,
    topic: Option<String>,
    flags: Mutex<MsgFlags>,
    payload: Mutex<Vec<u8>>,
    state: Mutex<TerminalState>,
    status: Mutex<Option<(StatusCode, String)>>,
    condvar: Condvar,
    metadata: Mutex<MsgMetadata>,
    /// Invoked exactly once, at termination, on whichever thread terminates
    /// the message (the session on the context thread, or a worker). Async
    /// callers install this; sync callers leave it empty and block on
    /// `condvar` instead.
    on_terminate: Mutex<Option<Box<dyn FnOnce(Message) + Send>>>,
    /// Set on inbound requests right before they are dispatched to an
    /// object's `on_invoke`/`on_get_event`, so the callback can answer
    /// through [`Message::reply`]/[`Message::reply_status`] from whatever
    /// thread it runs on (spec.md §4.3 "request/reply").
    reply_handle: Mutex<Option<ContextHandle>>,
}

/// A ref-counted, shareable handle to one in-flight or completed message.
#[derive(Clone)]
pub struct Message(Arc<Shared>);

impl Message {
    fn new(kind: MessageKind, object_id: ObjectId, code: MsgCode, payload: Vec<u8>, topic: Option<String>) -> Message {
        Message(Arc::new(Shared {
            kind,
            code,
            sn: Mutex::new(0),
            object_id,
            session_id: Mutex::new(INVALID_ID),
            topic,
            flags: Mutex::new(MsgFlags::empty()),
            payload: Mutex::new(payload),
            state: Mutex::new(TerminalState::Pending),
            status: Mutex::new(None),
            condvar: Condvar::new(),
            metadata: Mutex::new(MsgMetadata::default()),
            on_terminate: Mutex::new(None),
            reply_handle: Mutex::new(None),
        }))
    }

    pub fn new_request(object_id: ObjectId, code: MsgCode, payload: Vec<u8>) -> Message {
        Message::new(MessageKind::Request, object_id, code, payload, None)
    }

    /// A request carrying a topic, used by `get` (spec.md §4.3 "Publish/Get":
    /// the `GET_EVENT` flag turns this into a cache lookup keyed by
    /// `(code, topic)` instead of an ordinary invoke).
    pub fn new_request_with_topic(object_id: ObjectId, code: MsgCode, payload: Vec<u8>, topic: Option<String>) -> Message {
        Message::new(MessageKind::Request, object_id, code, payload, topic)
    }

    pub fn new_send(object_id: ObjectId, code: MsgCode, payload: Vec<u8>) -> Message {
        let msg = Message::new(MessageKind::Request, object_id, code, payload, None);
        *msg.0.flags.lock().unwrap() |= MsgFlags::NOREPLY_EXPECTED;
        msg
    }

    pub fn new_broadcast(object_id: ObjectId, code: EventCode, topic: String, payload: Vec<u8>) -> Message {
        Message::new(MessageKind::Broadcast, object_id, code, payload, Some(topic))
    }

    pub fn new_subscribe(object_id: ObjectId, payload: Vec<u8>) -> Message {
        Message::new(MessageKind::SubscribeReq, object_id, 0, payload, None)
    }

    pub fn new_sideband_request(object_id: ObjectId, code: MsgCode, payload: Vec<u8>) -> Message {
        Message::new(MessageKind::SidebandRequest, object_id, code, payload, None)
    }

    pub fn kind(&self) -> MessageKind {
        self.0.kind
    }

    pub fn code(&self) -> MsgCode {
        self.0.code
    }

    pub fn object_id(&self) -> ObjectId {
        self.0.object_id
    }

    pub fn topic(&self) -> Option<&str> {
        self.0.topic.as_deref()
    }

    pub fn sn(&self) -> MsgSn {
        *self.0.sn.lock().unwrap()
    }

    pub fn set_sn(&self, sn: MsgSn) {
        *self.0.sn.lock().unwrap() = sn;
    }

    pub fn session_id(&self) -> SessionId {
        *self.0.session_id.lock().unwrap()
    }

    pub fn set_session_id(&self, id: SessionId) {
        *self.0.session_id.lock().unwrap() = id;
    }

    pub fn flags(&self) -> MsgFlags {
        *self.0.flags.lock().unwrap()
    }

    pub fn set_flag(&self, flag: MsgFlags) {
        *self.0.flags.lock().unwrap() |= flag;
    }

    pub fn no_reply_expected(&self) -> bool {
        self.flags().contains(MsgFlags::NOREPLY_EXPECTED)
    }

    pub fn payload(&self) -> Vec<u8> {
        self.0.payload.lock().unwrap().clone()
    }

    pub fn set_payload(&self, payload: Vec<u8>) {
        *self.0.payload.lock().unwrap() = payload;
    }

    pub fn metadata(&self) -> MsgMetadata {
        *self.0.metadata.lock().unwrap()
    }

    pub fn stamp_send(&self, now_ms: u64) {
        self.0.metadata.lock().unwrap().send_time = now_ms;
    }

    pub fn stamp_arrive(&self, now_ms: u64) {
        self.0.metadata.lock().unwrap().arrive_time = now_ms;
    }

    pub fn stamp_reply(&self, now_ms: u64) {
        self.0.metadata.lock().unwrap().reply_time = now_ms;
    }

    pub fn stamp_receive(&self, now_ms: u64) {
        self.0.metadata.lock().unwrap().receive_time = now_ms;
    }

    /// Installs the callback run on termination for an asynchronous invoke.
    /// Must be set before the message can be terminated from another thread.
    pub fn set_on_terminate<F>(&self, f: F)
    where
        F: FnOnce(Message) + Send + 'static,
    {
        *self.0.on_terminate.lock().unwrap() = Some(Box::new(f));
    }

    /// Arms this inbound request with a route back to the context thread.
    /// Called by `Context` right before handing the request to an object.
    pub fn attach_reply_handle(&self, handle: ContextHandle) {
        *self.0.reply_handle.lock().unwrap() = Some(handle);
    }

    /// Sends `payload` back to the peer as this request's reply. A no-op
    /// (returns `false`) for anything other than an inbound request still
    /// carrying its reply route, which covers both `NOREPLY_EXPECTED` sends
    /// and replies already sent for this request.
    pub fn reply(&self, payload: Vec<u8>) -> bool {
        let Some(handle) = self.0.reply_handle.lock().unwrap().take() else { return false };
        let session_id = self.session_id();
        let msg = self.clone();
        handle.post(false, move |ctx| {
            let _ = ctx.reply(session_id, &msg, payload);
        });
        true
    }

    /// Sends a status/error reply back to the peer for this request.
    pub fn reply_status(&self, status: StatusCode, description: impl Into<String>) -> bool {
        let Some(handle) = self.0.reply_handle.lock().unwrap().take() else { return false };
        let session_id = self.session_id();
        let msg = self.clone();
        let description = description.into();
        handle.post(false, move |ctx| {
            let _ = ctx.reply_status(session_id, &msg, status, &description);
        });
        true
    }

    fn terminate(&self, state: TerminalState, status: Option<(StatusCode, String)>) -> bool {
        {
            let mut guard = self.0.state.lock().unwrap();
            if *guard != TerminalState::Pending {
                return false;
            }
            *guard = state;
        }
        *self.0.status.lock().unwrap() = status;
        self.0.condvar.notify_all();
        if let Some(cb) = self.0.on_terminate.lock().unwrap().take() {
            cb(self.clone());
        }
        true
    }

    /// Terminates the message with a successful reply payload. Returns
    /// `false` if the message was already terminated (at-most-once, spec.md
    /// §8 property 2).
    pub fn terminate_with_reply(&self, payload: Vec<u8>) -> bool {
        self.set_payload(payload);
        self.terminate(TerminalState::Replied, None)
    }

    /// Terminates the message with a status/error reply.
    pub fn terminate_with_status(&self, status: StatusCode, description: impl Into<String>) -> bool {
        self.set_flag(MsgFlags::STATUS);
        if status.is_error() {
            self.set_flag(MsgFlags::ERROR);
        }
        self.terminate(TerminalState::StatusReturned, Some((status, description.into())))
    }

    /// Terminates the message because its timeout elapsed without a reply.
    pub fn terminate_with_timeout(&self) -> bool {
        self.set_flag(MsgFlags::STATUS);
        self.set_flag(MsgFlags::ERROR);
        self.terminate(TerminalState::TimedOut, Some((StatusCode::Timeout, "timed out".into())))
    }

    pub fn is_terminated(&self) -> bool {
        *self.0.state.lock().unwrap() != TerminalState::Pending
    }

    pub fn is_status(&self) -> bool {
        self.flags().contains(MsgFlags::STATUS)
    }

    pub fn is_error(&self) -> bool {
        self.flags().contains(MsgFlags::ERROR)
    }

    pub fn decode_status(&self) -> Option<(StatusCode, String)> {
        self.0.status.lock().unwrap().clone()
    }

    /// Blocks the calling thread until the message terminates, or `timeout`
    /// elapses (`None` means wait forever). Used by synchronous invokes;
    /// callers must never call this from the context thread (spec.md §4.1,
    /// §4.3 "Sync invoke").
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = self.0.state.lock().unwrap();
        let (guard, _) = match timeout {
            None => (
                self.0
                    .condvar
                    .wait_while(guard, |s| *s == TerminalState::Pending)
                    .unwrap(),
                (),
            ),
            Some(d) => {
                let (g, timeout_result) = self
                    .0
                    .condvar
                    .wait_timeout_while(guard, d, |s| *s == TerminalState::Pending)
                    .unwrap();
                if timeout_result.timed_out() && *g == TerminalState::Pending {
                    return false;
                }
                (g, ())
            }
        };
        *guard != TerminalState::Pending
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.0.kind)
            .field("code", &self.0.code)
            .field("sn", &self.sn())
            .field("object_id", &self.0.object_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn reply_terminates_a_pending_message_once() {
        let msg = Message::new_request(1, 7, vec![]);
        assert!(msg.terminate_with_reply(b"hello".to_vec()));
        assert!(!msg.is_status());
        assert_eq!(msg.payload(), b"hello");

        // second termination attempt is a no-op
        assert!(!msg.terminate_with_status(StatusCode::Timeout, "late"));
        assert_eq!(msg.payload(), b"hello");
    }

    #[test]
    fn timeout_after_reply_is_a_no_op() {
        let msg = Message::new_request(1, 7, vec![]);
        assert!(msg.terminate_with_reply(b"ok".to_vec()));
        assert!(!msg.terminate_with_timeout());
        assert!(!msg.is_error());
    }

    #[test]
    fn status_sets_error_flag_for_error_codes_only() {
        let msg = Message::new_request(1, 1, vec![]);
        assert!(msg.terminate_with_status(StatusCode::Timeout, "timed out"));
        assert!(msg.is_status());
        assert!(msg.is_error());

        let msg2 = Message::new_request(1, 1, vec![]);
        assert!(msg2.terminate_with_status(StatusCode::AutoReplyOk, ""));
        assert!(msg2.is_status());
        assert!(!msg2.is_error());
    }

    #[test]
    fn sync_wait_wakes_up_on_termination() {
        let msg = Message::new_request(1, 1, vec![]);
        let msg2 = msg.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();

        let handle = thread::spawn(move || {
            let woke = msg2.wait(Some(Duration::from_secs(5)));
            done2.store(woke, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(msg.terminate_with_reply(b"x".to_vec()));
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn sync_wait_times_out_if_never_terminated() {
        let msg = Message::new_request(1, 1, vec![]);
        assert!(!msg.wait(Some(Duration::from_millis(20))));
    }

    #[test]
    fn on_terminate_callback_fires_exactly_once() {
        let msg = Message::new_request(1, 1, vec![]);
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        msg.set_on_terminate(move |_| {
            *count2.lock().unwrap() += 1;
        });
        assert!(msg.terminate_with_reply(vec![]));
        assert!(!msg.terminate_with_timeout());
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
