// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! A pipe frames and transfers raw messages over one [`Connection`]
//! according to the connection's readiness, non-blocking (spec.md §4.2
//! "Framing", "Session read loop", "Write path").

use std::collections::VecDeque;
use std::io;

use crate::header::{decode_prefix, MessageHeader, PREFIX_SIZE};
use crate::transport::Connection;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvStep {
    Prefix,
    Head,
    Payload,
}

/// Incremental, resumable read of one frame: prefix, then head, then payload.
struct RecvOperation {
    step: RecvStep,
    read: usize,
    prefix: [u8; PREFIX_SIZE],
    total_length: u32,
    head_buf: Vec<u8>,
    payload_buf: Vec<u8>,
}

impl RecvOperation {
    fn new() -> RecvOperation {
        RecvOperation {
            step: RecvStep::Prefix,
            read: 0,
            prefix: [0u8; PREFIX_SIZE],
            total_length: 0,
            head_buf: Vec::new(),
            payload_buf: Vec::new(),
        }
    }

    /// Drives the state machine as far as currently-available bytes allow.
    /// Returns `Some((header, payload))` once a full frame has been read.
    fn recv(&mut self, conn: &mut dyn Connection) -> io::Result<Option<(MessageHeader, Vec<u8>)>> {
        if self.step == RecvStep::Prefix {
            self.read += recv_into(conn, &mut self.prefix[self.read..])?;
            if self.read < PREFIX_SIZE {
                return Ok(None);
            }
            let (total_length, head_length) = decode_prefix(&self.prefix)?;
            if (head_length as usize) + PREFIX_SIZE > total_length as usize {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "head_length exceeds total_length"));
            }
            self.total_length = total_length;
            self.head_buf = vec![0u8; head_length as usize];
            self.step = RecvStep::Head;
            self.read = 0;
        }

        if self.step == RecvStep::Head {
            self.read += recv_into(conn, &mut self.head_buf[self.read..])?;
            if self.read < self.head_buf.len() {
                return Ok(None);
            }
            let payload_len = self.total_length as usize - PREFIX_SIZE - self.head_buf.len();
            self.payload_buf = vec![0u8; payload_len];
            self.step = RecvStep::Payload;
            self.read = 0;
        }

        if self.step == RecvStep::Payload {
            self.read += recv_into(conn, &mut self.payload_buf[self.read..])?;
            if self.read < self.payload_buf.len() {
                return Ok(None);
            }
            let header = MessageHeader::deserialize(&self.head_buf)?;
            let payload = std::mem::take(&mut self.payload_buf);
            *self = RecvOperation::new();
            return Ok(Some((header, payload)));
        }

        Ok(None)
    }
}

fn recv_into(conn: &mut dyn Connection, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    Ok(conn.try_read(buf)?.unwrap_or(0))
}

/// Outbound bytes not yet accepted by the kernel buffer (spec.md §4.2
/// "Write path"): unbounded, a slow peer grows this until HUP.
struct SendQueue {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
}

impl SendQueue {
    fn new() -> SendQueue {
        SendQueue { chunks: VecDeque::new(), offset: 0 }
    }

    fn push(&mut self, frame: Vec<u8>) {
        self.chunks.push_back(frame);
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Tries to flush as much as the connection will currently accept.
    fn flush(&mut self, conn: &mut dyn Connection) -> io::Result<()> {
        while let Some(chunk) = self.chunks.front() {
            match conn.try_write(&chunk[self.offset..])? {
                Some(0) | None => return Ok(()),
                Some(n) => {
                    self.offset += n;
                    if self.offset >= chunk.len() {
                        self.chunks.pop_front();
                        self.offset = 0;
                    }
                }
            }
        }
        Ok(())
    }
}

/// A framed, non-blocking duplex pipe over one [`Connection`].
pub struct Pipe {
    conn: Box<dyn Connection>,
    recv_op: RecvOperation,
    send_queue: SendQueue,
}

impl Pipe {
    pub fn new(conn: Box<dyn Connection>) -> Pipe {
        Pipe { conn, recv_op: RecvOperation::new(), send_queue: SendQueue::new() }
    }

    pub fn connection(&self) -> &dyn Connection {
        &*self.conn
    }

    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        &mut *self.conn
    }

    /// Call when the socket is readable. Drains as many complete frames as
    /// are currently buffered.
    pub fn read_frames(&mut self) -> io::Result<Vec<(MessageHeader, Vec<u8>)>> {
        let mut frames = Vec::new();
        loop {
            match self.recv_op.recv(&mut *self.conn)? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    pub fn queue_frame(&mut self, frame: Vec<u8>) {
        self.send_queue.push(frame);
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Call when the socket is writable, or right after queuing a frame.
    pub fn flush(&mut self) -> io::Result<()> {
        self.send_queue.flush(&mut *self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{encode_frame, MessageHeader, MessageType};
    use mio::event::Source;
    use mio::{Interest, Registry, Token};
    use std::collections::VecDeque as Deque;

    struct FakeConn {
        inbound: Deque<u8>,
        outbound: Vec<u8>,
        chunked: bool,
    }

    impl Connection for FakeConn {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            if self.inbound.is_empty() {
                return Ok(None);
            }
            let want = if self.chunked { 1.min(buf.len()) } else { buf.len() };
            let n = want.min(self.inbound.len());
            for b in buf.iter_mut().take(n) {
                *b = self.inbound.pop_front().unwrap();
            }
            Ok(Some(n))
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
            self.outbound.extend_from_slice(buf);
            Ok(Some(buf.len()))
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

    fn sample_frame() -> Vec<u8> {
        let header = MessageHeader::new(MessageType::Request, 1, 7, 42);
        encode_frame(&header, b"hello").unwrap()
    }

    #[test]
    fn reads_one_frame_delivered_in_a_single_chunk() {
        let frame = sample_frame();
        let conn = FakeConn { inbound: frame.into_iter().collect(), outbound: vec![], chunked: false };
        let mut pipe = Pipe::new(Box::new(conn));

        let frames = pipe.read_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, b"hello");
    }

    #[test]
    fn reads_one_frame_delivered_byte_by_byte() {
        let frame = sample_frame();
        let conn = FakeConn { inbound: frame.into_iter().collect(), outbound: vec![], chunked: true };
        let mut pipe = Pipe::new(Box::new(conn));

        let mut all = Vec::new();
        for _ in 0..200 {
            all.extend(pipe.read_frames().unwrap());
            if !all.is_empty() {
                break;
            }
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, b"hello");
    }

    #[test]
    fn queued_frame_is_flushed_to_the_connection() {
        let conn = FakeConn { inbound: Deque::new(), outbound: vec![], chunked: false };
        let mut pipe = Pipe::new(Box::new(conn));
        let frame = sample_frame();
        pipe.queue_frame(frame.clone());
        assert!(pipe.has_pending_send());
        pipe.flush().unwrap();
        assert!(!pipe.has_pending_send());
    }
}
