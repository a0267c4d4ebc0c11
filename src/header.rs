// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Wire framing (spec.md §4.2, §6):
//!
//! ```text
//! prefix (8 bytes): total_length (u32 LE) || head_length (u32 LE)
//! head   (head_length bytes): MessageHeader
//! payload(total_length - head_length - 8 bytes): opaque
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::global::{EventCode, MsgCode, MsgSn, ObjectId};

pub const PREFIX_SIZE: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Reply = 2,
    SubscribeReq = 3,
    Broadcast = 4,
    SidebandRequest = 5,
    SidebandReply = 6,
    Status = 7,
}

impl MessageType {
    pub fn from_u8(v: u8) -> io::Result<MessageType> {
        Ok(match v {
            1 => MessageType::Request,
            2 => MessageType::Reply,
            3 => MessageType::SubscribeReq,
            4 => MessageType::Broadcast,
            5 => MessageType::SidebandRequest,
            6 => MessageType::SidebandReply,
            7 => MessageType::Status,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown message type")),
        })
    }
}

bitflags::bitflags! {
    /// Header flag bits. `NOREPLY_EXPECTED`/`SYNC_REPLY`/etc. are wire flags;
    /// the option bits that gate optional header fields live in [`HeaderOptions`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        const NOREPLY_EXPECTED = 1 << 0;
        const SYNC_REPLY       = 1 << 1;
        const ERROR            = 1 << 2;
        const STATUS           = 1 << 3;
        const INITIAL_RESPONSE = 1 << 4;
        const GET_EVENT        = 1 << 5;
        const FORCE_UPDATE     = 1 << 6;
        const MANUAL_UPDATE    = 1 << 7;
        const LOG_ENABLED      = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Header option bitmap (spec.md §6): bit 1 broadcast-topic, bit 2
    /// send-or-arrive time, bit 3 reply time. Unknown bits reject the frame.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct HeaderOptions: u8 {
        const TOPIC      = 1 << 0;
        const SEND_ARRIVE_TIME = 1 << 1;
        const REPLY_TIME = 1 << 2;
    }
}

const KNOWN_OPTION_BITS: u8 = HeaderOptions::TOPIC.bits()
    | HeaderOptions::SEND_ARRIVE_TIME.bits()
    | HeaderOptions::REPLY_TIME.bits();

/// Timestamps carried optionally in the header (spec.md §4.3).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MsgMetadata {
    pub send_time: u64,
    pub arrive_time: u64,
    pub reply_time: u64,
    pub receive_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub serial_number: MsgSn,
    pub code: MsgCode,
    pub flags: MsgFlags,
    pub object_id: ObjectId,
    pub payload_size: u32,
    pub topic: Option<String>,
    pub send_time: Option<u64>,
    pub arrive_time: Option<u64>,
    pub reply_time: Option<u64>,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, object_id: ObjectId, code: MsgCode, sn: MsgSn) -> MessageHeader {
        MessageHeader {
            msg_type,
            serial_number: sn,
            code,
            flags: MsgFlags::empty(),
            object_id,
            payload_size: 0,
            topic: None,
            send_time: None,
            arrive_time: None,
            reply_time: None,
        }
    }

    pub fn event_code(&self) -> EventCode {
        self.code
    }

    fn options(&self) -> HeaderOptions {
        let mut opts = HeaderOptions::empty();
        if self.topic.is_some() {
            opts |= HeaderOptions::TOPIC;
        }
        if self.send_time.is_some() || self.arrive_time.is_some() {
            opts |= HeaderOptions::SEND_ARRIVE_TIME;
        }
        if self.reply_time.is_some() {
            opts |= HeaderOptions::REPLY_TIME;
        }
        opts
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        buf.write_u8(self.msg_type as u8)?;
        buf.write_u32::<LittleEndian>(self.serial_number)?;
        buf.write_i32::<LittleEndian>(self.code)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_u32::<LittleEndian>(self.object_id)?;
        buf.write_u32::<LittleEndian>(self.payload_size)?;
        let opts = self.options();
        buf.write_u8(opts.bits())?;
        if opts.contains(HeaderOptions::TOPIC) {
            let topic = self.topic.as_deref().unwrap_or("");
            buf.write_u16::<LittleEndian>(topic.len() as u16)?;
            buf.write_all(topic.as_bytes())?;
        }
        if opts.contains(HeaderOptions::SEND_ARRIVE_TIME) {
            buf.write_u64::<LittleEndian>(self.send_time.unwrap_or(0))?;
            buf.write_u64::<LittleEndian>(self.arrive_time.unwrap_or(0))?;
        }
        if opts.contains(HeaderOptions::REPLY_TIME) {
            buf.write_u64::<LittleEndian>(self.reply_time.unwrap_or(0))?;
        }
        Ok(buf)
    }

    pub fn deserialize(bytes: &[u8]) -> io::Result<MessageHeader> {
        let mut cur = Cursor::new(bytes);
        let msg_type = MessageType::from_u8(cur.read_u8()?)?;
        let serial_number = cur.read_u32::<LittleEndian>()?;
        let code = cur.read_i32::<LittleEndian>()?;
        let flags = MsgFlags::from_bits_truncate(cur.read_u32::<LittleEndian>()?);
        let object_id = cur.read_u32::<LittleEndian>()?;
        let payload_size = cur.read_u32::<LittleEndian>()?;
        let opt_bits = cur.read_u8()?;
        if opt_bits & !KNOWN_OPTION_BITS != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown header option bit"));
        }
        let opts = HeaderOptions::from_bits_truncate(opt_bits);

        let mut topic = None;
        if opts.contains(HeaderOptions::TOPIC) {
            let len = cur.read_u16::<LittleEndian>()? as usize;
            let mut s = vec![0u8; len];
            cur.read_exact(&mut s)?;
            topic = Some(String::from_utf8(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 topic"))?);
        }
        let mut send_time = None;
        let mut arrive_time = None;
        if opts.contains(HeaderOptions::SEND_ARRIVE_TIME) {
            send_time = Some(cur.read_u64::<LittleEndian>()?);
            arrive_time = Some(cur.read_u64::<LittleEndian>()?);
        }
        let mut reply_time = None;
        if opts.contains(HeaderOptions::REPLY_TIME) {
            reply_time = Some(cur.read_u64::<LittleEndian>()?);
        }

        Ok(MessageHeader {
            msg_type,
            serial_number,
            code,
            flags,
            object_id,
            payload_size,
            topic,
            send_time,
            arrive_time,
            reply_time,
        })
    }
}

/// Encode a complete frame: prefix + header + payload.
pub fn encode_frame(header: &MessageHeader, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut header = header.clone();
    header.payload_size = payload.len() as u32;
    let head_bytes = header.serialize()?;
    let total_length = (PREFIX_SIZE + head_bytes.len() + payload.len()) as u32;

    let mut buf = Vec::with_capacity(total_length as usize);
    buf.write_u32::<LittleEndian>(total_length)?;
    buf.write_u32::<LittleEndian>(head_bytes.len() as u32)?;
    buf.write_all(&head_bytes)?;
    buf.write_all(payload)?;
    Ok(buf)
}

pub fn decode_prefix(bytes: &[u8; PREFIX_SIZE]) -> io::Result<(u32, u32)> {
    let mut cur = Cursor::new(&bytes[..]);
    let total_length = cur.read_u32::<LittleEndian>()?;
    let head_length = cur.read_u32::<LittleEndian>()?;
    Ok((total_length, head_length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_preserves_header_and_payload() {
        let mut header = MessageHeader::new(MessageType::Request, 0x0001_0002, 7, 42);
        header.flags = MsgFlags::SYNC_REPLY;
        header.topic = Some("t".into());
        header.send_time = Some(100);
        header.arrive_time = Some(110);
        header.reply_time = Some(120);

        let payload = vec![1u8, 2, 3, 4, 5];
        let frame = encode_frame(&header, &payload).unwrap();

        let prefix: [u8; PREFIX_SIZE] = frame[0..PREFIX_SIZE].try_into().unwrap();
        let (total_length, head_length) = decode_prefix(&prefix).unwrap();
        assert_eq!(total_length as usize, frame.len());

        let head_bytes = &frame[PREFIX_SIZE..PREFIX_SIZE + head_length as usize];
        let decoded = MessageHeader::deserialize(head_bytes).unwrap();
        let decoded_payload = &frame[PREFIX_SIZE + head_length as usize..];

        assert_eq!(decoded.msg_type, header.msg_type);
        assert_eq!(decoded.serial_number, header.serial_number);
        assert_eq!(decoded.code, header.code);
        assert_eq!(decoded.flags, header.flags);
        assert_eq!(decoded.object_id, header.object_id);
        assert_eq!(decoded.payload_size as usize, payload.len());
        assert_eq!(decoded.topic, header.topic);
        assert_eq!(decoded.send_time, header.send_time);
        assert_eq!(decoded.arrive_time, header.arrive_time);
        assert_eq!(decoded.reply_time, header.reply_time);
        assert_eq!(decoded_payload, &payload[..]);
    }

    #[test]
    fn frame_without_optional_fields_has_minimal_header() {
        let header = MessageHeader::new(MessageType::Reply, 0, 0, 1);
        let frame = encode_frame(&header, &[]).unwrap();
        let prefix: [u8; PREFIX_SIZE] = frame[0..PREFIX_SIZE].try_into().unwrap();
        let (_, head_length) = decode_prefix(&prefix).unwrap();
        let decoded = MessageHeader::deserialize(&frame[PREFIX_SIZE..PREFIX_SIZE + head_length as usize]).unwrap();
        assert_eq!(decoded.topic, None);
        assert_eq!(decoded.send_time, None);
        assert_eq!(decoded.reply_time, None);
    }

    #[test]
    fn unknown_option_bit_is_rejected() {
        let header = MessageHeader::new(MessageType::Request, 0, 0, 1);
        let mut bytes = header.serialize().unwrap();
        let opt_byte_idx = 1 + 4 + 4 + 4 + 4 + 4; // msg_type + sn + code + flags + object_id + payload_size
        bytes[opt_byte_idx] |= 0x80;
        assert!(MessageHeader::deserialize(&bytes).is_err());
    }
}
