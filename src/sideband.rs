// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Sideband message codes (spec.md §4.2 "Sideband channel"): codes below
//! 4096 are reserved for the bus itself, everything from 4096 up is free
//! for user objects to define their own out-of-band exchanges on.

use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::global::{EventCode, MsgCode};

pub const AUTHENTICATION: MsgCode = 0;
pub const WATCHDOG: MsgCode = 1;
pub const SESSION_INFO: MsgCode = 2;
pub const QUERY_CLIENT: MsgCode = 3;
pub const QUERY_EVENT_CACHE: MsgCode = 4;

/// First code available for user-defined sideband messages.
pub const USER_SIDEBAND_BASE: MsgCode = 4096;

pub fn is_reserved(code: MsgCode) -> bool {
    (0..USER_SIDEBAND_BASE).contains(&code)
}

pub fn is_user_defined(code: MsgCode) -> bool {
    code >= USER_SIDEBAND_BASE
}

/// Wire body for an `AUTHENTICATION` sideband request: just the token bytes
/// as sent by the peer, looked up against the receiving endpoint's token
/// list to derive a security level (spec.md §4.5 "Token levels").
pub fn encode_auth_token(token: &str) -> Vec<u8> {
    token.as_bytes().to_vec()
}

pub fn decode_auth_token(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Wire body for a `SESSION_INFO` sideband request, exchanged right after a
/// session is established (spec.md §4.2 "Session handshake"): `pid: u32`,
/// `udp_port: u16`, then the sender's name.
pub fn encode_session_info(sender_name: &str, pid: u32, udp_port: u16) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(6 + sender_name.len());
    buf.write_u32::<LittleEndian>(pid)?;
    buf.write_u16::<LittleEndian>(udp_port)?;
    buf.extend_from_slice(sender_name.as_bytes());
    Ok(buf)
}

pub fn decode_session_info(bytes: &[u8]) -> io::Result<(String, u32, u16)> {
    let mut cur = io::Cursor::new(bytes);
    let pid = cur.read_u32::<LittleEndian>()?;
    let udp_port = cur.read_u16::<LittleEndian>()?;
    let mut name_bytes = Vec::new();
    io::Read::read_to_end(&mut cur, &mut name_bytes)?;
    Ok((String::from_utf8_lossy(&name_bytes).into_owned(), pid, udp_port))
}

/// Wire body for a `QUERY_EVENT_CACHE` sideband reply: every cached event on
/// the queried object, in insertion order (spec.md §4.4 "Event cache",
/// supplemented by the original `FdbMsgEventCache` parcelable: a count
/// followed by `(event: u32, topic, payload)` entries).
pub fn encode_event_cache(entries: &[(EventCode, Option<String>, Vec<u8>)]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(entries.len() as u32)?;
    for (event, topic, payload) in entries {
        buf.write_u32::<LittleEndian>(*event as u32)?;
        let topic_bytes = topic.as_deref().unwrap_or("").as_bytes();
        buf.write_u16::<LittleEndian>(topic_bytes.len() as u16)?;
        buf.extend_from_slice(topic_bytes);
        buf.write_u32::<LittleEndian>(payload.len() as u32)?;
        buf.extend_from_slice(payload);
    }
    Ok(buf)
}

pub fn decode_event_cache(bytes: &[u8]) -> io::Result<Vec<(EventCode, Option<String>, Vec<u8>)>> {
    let mut cur = io::Cursor::new(bytes);
    let count = cur.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let event = cur.read_u32::<LittleEndian>()?;
        let topic_len = cur.read_u16::<LittleEndian>()? as usize;
        let mut topic_bytes = vec![0u8; topic_len];
        io::Read::read_exact(&mut cur, &mut topic_bytes)?;
        let topic = String::from_utf8_lossy(&topic_bytes).into_owned();
        let payload_len = cur.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; payload_len];
        io::Read::read_exact(&mut cur, &mut payload)?;
        out.push((event as EventCode, if topic.is_empty() { None } else { Some(topic) }, payload));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_codes_are_below_the_user_base() {
        assert!(is_reserved(AUTHENTICATION));
        assert!(is_reserved(QUERY_EVENT_CACHE));
        assert!(!is_reserved(USER_SIDEBAND_BASE));
    }

    #[test]
    fn user_codes_start_at_the_reserved_boundary() {
        assert!(is_user_defined(USER_SIDEBAND_BASE));
        assert!(is_user_defined(5000));
        assert!(!is_user_defined(4095));
    }

    #[test]
    fn auth_token_round_trips() {
        let encoded = encode_auth_token("t0ken");
        assert_eq!(decode_auth_token(&encoded), "t0ken");
    }

    #[test]
    fn session_info_round_trips() {
        let encoded = encode_session_info("my-client", 4242, 9000).unwrap();
        let (name, pid, udp_port) = decode_session_info(&encoded).unwrap();
        assert_eq!(name, "my-client");
        assert_eq!(pid, 4242);
        assert_eq!(udp_port, 9000);
    }

    #[test]
    fn event_cache_round_trips() {
        let entries = vec![(10u32, Some("topic-a".to_string()), b"v1".to_vec()), (11u32, None, b"".to_vec())];
        let encoded = encode_event_cache(&entries).unwrap();
        let decoded = decode_event_cache(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }
}
