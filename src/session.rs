// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! One connected peer (spec.md §4.1, §4.2): framing is `Pipe`'s job, a
//! `Session` owns everything above that — the pending-reply table, peer
//! identity, and the teardown sequence that fires when the connection dies.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::global::{MsgSn, SecurityLevel, SessionId, SocketId, SECURITY_LEVEL_NONE};
use crate::header::{MessageHeader, MessageType, MsgFlags};
use crate::message::{Message, MessageKind};
use crate::pipe::Pipe;
use crate::transport::{Connection, PeerCredentials};

/// What a completed inbound frame means for the caller dispatching it.
pub enum Inbound {
    /// A reply, status or timeout-worthy response matched against a pending
    /// invoke; the pending entry has already been removed.
    Reply(Message),
    /// A request, send, broadcast, subscribe or sideband frame that still
    /// needs routing to an object.
    New(Message),
    /// A frame referencing a serial number with no matching pending entry
    /// (already timed out locally, or a protocol violation by the peer).
    Unmatched(MsgSn),
}

pub struct Session {
    id: SessionId,
    socket_id: SocketId,
    pipe: Pipe,
    peer_credentials: Option<PeerCredentials>,
    security_level: SecurityLevel,
    sender_name: Option<String>,
    udp_addr: Option<SocketAddr>,
    pending: HashMap<MsgSn, Message>,
    next_sn: MsgSn,
}

impl Session {
    pub fn new(id: SessionId, socket_id: SocketId, conn: Box<dyn Connection>) -> Session {
        let peer_credentials = conn.peer_credentials();
        Session {
            id,
            socket_id,
            pipe: Pipe::new(conn),
            peer_credentials,
            security_level: SECURITY_LEVEL_NONE,
            sender_name: None,
            udp_addr: None,
            pending: HashMap::new(),
            next_sn: 0,
        }
    }

    /// Hands out the next serial number for an outbound request on this
    /// session (spec.md §3 "message serial number").
    pub fn alloc_sn(&mut self) -> MsgSn {
        let sn = self.next_sn;
        self.next_sn = self.next_sn.wrapping_add(1);
        sn
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.peer_credentials
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn set_security_level(&mut self, level: SecurityLevel) {
        self.security_level = level;
    }

    pub fn sender_name(&self) -> Option<&str> {
        self.sender_name.as_deref()
    }

    pub fn set_sender_name(&mut self, name: String) {
        self.sender_name = Some(name);
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn set_udp_addr(&mut self, addr: SocketAddr) {
        self.udp_addr = Some(addr);
    }

    pub fn pipe_mut(&mut self) -> &mut Pipe {
        &mut self.pipe
    }

    /// Registers an outgoing invoke so its eventual reply (or a local
    /// timeout) can find it again by serial number.
    pub fn register_pending(&mut self, sn: MsgSn, message: Message) {
        self.pending.insert(sn, message);
    }

    pub fn take_pending(&mut self, sn: MsgSn) -> Option<Message> {
        self.pending.remove(&sn)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Frames a message and queues it for write; `flush` or the next
    /// writable-readiness event drains the queue.
    pub fn queue_outbound(&mut self, header: &MessageHeader, message: &Message) -> std::io::Result<()> {
        let frame = crate::header::encode_frame(header, &message.payload())?;
        self.pipe.queue_frame(frame);
        Ok(())
    }

    /// Drains the pipe's read buffer, matching finished request/reply pairs
    /// against the pending table and classifying everything else as a new
    /// inbound message for the caller to route to an object.
    pub fn read_frames(&mut self) -> std::io::Result<Vec<Inbound>> {
        let frames = self.pipe.read_frames()?;
        let mut out = Vec::with_capacity(frames.len());
        for (header, payload) in frames {
            out.push(self.classify(header, payload));
        }
        Ok(out)
    }

    fn classify(&mut self, header: MessageHeader, payload: Vec<u8>) -> Inbound {
        match header.msg_type {
            MessageType::Reply | MessageType::Status | MessageType::SidebandReply => {
                match self.pending.remove(&header.serial_number) {
                    Some(msg) => {
                        if header.flags.contains(MsgFlags::STATUS) {
                            let (code, description) = crate::error::decode_status_payload(&payload);
                            msg.terminate_with_status(code, description);
                        } else {
                            msg.terminate_with_reply(payload);
                        }
                        Inbound::Reply(msg)
                    }
                    None => Inbound::Unmatched(header.serial_number),
                }
            }
            MessageType::Request => {
                let msg = Message::new_request_with_topic(header.object_id, header.code, payload, header.topic.clone());
                msg.set_sn(header.serial_number);
                msg.set_session_id(self.id);
                if header.flags.contains(MsgFlags::NOREPLY_EXPECTED) {
                    msg.set_flag(MsgFlags::NOREPLY_EXPECTED);
                }
                if header.flags.contains(MsgFlags::GET_EVENT) {
                    msg.set_flag(MsgFlags::GET_EVENT);
                }
                Inbound::New(msg)
            }
            MessageType::Broadcast => {
                let msg = Message::new_broadcast(header.object_id, header.code, header.topic.clone().unwrap_or_default(), payload);
                msg.set_sn(header.serial_number);
                msg.set_session_id(self.id);
                Inbound::New(msg)
            }
            MessageType::SubscribeReq => {
                let msg = Message::new_subscribe(header.object_id, payload);
                msg.set_sn(header.serial_number);
                msg.set_session_id(self.id);
                Inbound::New(msg)
            }
            MessageType::SidebandRequest => {
                let msg = Message::new_sideband_request(header.object_id, header.code, payload);
                msg.set_sn(header.serial_number);
                msg.set_session_id(self.id);
                Inbound::New(msg)
            }
        }
    }

    /// Terminates every outstanding invoke with `PEER_VANISH` and returns
    /// the drained pending table so the caller can run any other teardown
    /// steps (unsubscribe bookkeeping, `on_offline`) with it in hand.
    pub fn teardown(&mut self) -> Vec<Message> {
        let pending: Vec<Message> = self.pending.drain().map(|(_, m)| m).collect();
        for msg in &pending {
            msg.terminate_with_status(crate::error::StatusCode::PeerVanish, "peer vanish");
        }
        pending
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("socket_id", &self.socket_id)
            .field("sender_name", &self.sender_name)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MessageType;
    use crate::transport::Connection;
    use mio::event::Source;
    use mio::{Interest, Registry, Token};
    use std::collections::VecDeque;
    use std::io;

    struct FakeConn {
        inbound: VecDeque<u8>,
    }

    impl Connection for FakeConn {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            if self.inbound.is_empty() {
                return Ok(None);
            }
            let n = buf.len().min(self.inbound.len());
            for b in buf.iter_mut().take(n) {
                *b = self.inbound.pop_front().unwrap();
            }
            Ok(Some(n))
        }
        fn try_write(&mut self, _buf: &[u8]) -> io::Result<Option<usize>> {
            Ok(Some(_buf.len()))
        }
    }

    impl Source for FakeConn {
        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    fn session_with_frame(header: MessageHeader, payload: &[u8]) -> Session {
        let frame = crate::header::encode_frame(&header, payload).unwrap();
        let conn = FakeConn { inbound: frame.into_iter().collect() };
        Session::new(1, 1, Box::new(conn))
    }

    #[test]
    fn reply_is_matched_against_pending_invoke() {
        let mut session = session_with_frame(MessageHeader::new(MessageType::Reply, 5, 0, 42), b"ack");
        let invoke = Message::new_request(5, 9, vec![]);
        invoke.set_sn(42);
        session.register_pending(42, invoke.clone());

        let inbound = session.read_frames().unwrap();
        assert_eq!(inbound.len(), 1);
        match &inbound[0] {
            Inbound::Reply(m) => assert_eq!(m.payload(), b"ack"),
            _ => panic!("expected a reply"),
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn reply_with_no_pending_entry_is_unmatched() {
        let mut session = session_with_frame(MessageHeader::new(MessageType::Reply, 5, 0, 99), b"");
        let inbound = session.read_frames().unwrap();
        match &inbound[0] {
            Inbound::Unmatched(sn) => assert_eq!(*sn, 99),
            _ => panic!("expected unmatched"),
        }
    }

    #[test]
    fn request_frame_is_classified_as_new() {
        let mut session = session_with_frame(MessageHeader::new(MessageType::Request, 5, 7, 1), b"hi");
        let inbound = session.read_frames().unwrap();
        match &inbound[0] {
            Inbound::New(m) => assert_eq!(m.kind(), MessageKind::Request),
            _ => panic!("expected new request"),
        }
    }

    #[test]
    fn reply_without_status_flag_terminates_with_the_payload() {
        let mut session = session_with_frame(MessageHeader::new(MessageType::Reply, 5, 0, 42), b"ack");
        let invoke = Message::new_request(5, 9, vec![]);
        session.register_pending(42, invoke.clone());
        let _ = session.read_frames().unwrap();
        assert!(invoke.is_terminated());
        assert!(!invoke.is_status());
        assert_eq!(invoke.payload(), b"ack");
    }

    #[test]
    fn sn_allocator_hands_out_increasing_values() {
        let conn = FakeConn { inbound: VecDeque::new() };
        let mut session = Session::new(1, 1, Box::new(conn));
        assert_eq!(session.alloc_sn(), 0);
        assert_eq!(session.alloc_sn(), 1);
    }

    #[test]
    fn teardown_terminates_all_pending_with_peer_vanish() {
        let conn = FakeConn { inbound: VecDeque::new() };
        let mut session = Session::new(1, 1, Box::new(conn));
        let a = Message::new_request(1, 1, vec![]);
        let b = Message::new_request(1, 2, vec![]);
        session.register_pending(1, a.clone());
        session.register_pending(2, b.clone());

        let drained = session.teardown();
        assert_eq!(drained.len(), 2);
        assert!(a.is_terminated());
        assert!(b.is_terminated());
        assert_eq!(a.decode_status().unwrap().0, crate::error::StatusCode::PeerVanish);
    }
}
