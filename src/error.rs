// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Reserved status codes (spec.md §6) and the error type the public API
//! surfaces them through.

use std::fmt;

/// Reserved status codes. Negative, as on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    AutoReplyOk = -11,
    SubscribeOk = -12,
    SubscribeFail = -13,
    UnsubscribeOk = -14,
    Timeout = -16,
    InvalidId = -17,
    PeerVanish = -18,
    DeadLock = -19,
    UnableToSend = -20,
    NonExist = -21,
    AlreadyExist = -22,
    MsgDecodeFail = -23,
    BadParameter = -24,
    NotAvailable = -25,
    InternalFail = -26,
    OutOfMemory = -27,
    NotImplemented = -28,
    ObjectNotFound = -29,
    AuthenticationFail = -30,
    Unknown = -128,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> StatusCode {
        match code {
            0 => StatusCode::Ok,
            -11 => StatusCode::AutoReplyOk,
            -12 => StatusCode::SubscribeOk,
            -13 => StatusCode::SubscribeFail,
            -14 => StatusCode::UnsubscribeOk,
            -16 => StatusCode::Timeout,
            -17 => StatusCode::InvalidId,
            -18 => StatusCode::PeerVanish,
            -19 => StatusCode::DeadLock,
            -20 => StatusCode::UnableToSend,
            -21 => StatusCode::NonExist,
            -22 => StatusCode::AlreadyExist,
            -23 => StatusCode::MsgDecodeFail,
            -24 => StatusCode::BadParameter,
            -25 => StatusCode::NotAvailable,
            -26 => StatusCode::InternalFail,
            -27 => StatusCode::OutOfMemory,
            -28 => StatusCode::NotImplemented,
            -29 => StatusCode::ObjectNotFound,
            -30 => StatusCode::AuthenticationFail,
            _ => StatusCode::Unknown,
        }
    }

    /// Subscribe-family codes set the subscribe bit on the wire so clients
    /// can route them distinctly from ordinary replies (spec.md §4.3, §7).
    pub fn is_subscribe(self) -> bool {
        matches!(self, StatusCode::SubscribeOk | StatusCode::SubscribeFail | StatusCode::UnsubscribeOk)
    }

    pub fn is_error(self) -> bool {
        !matches!(self, StatusCode::Ok | StatusCode::AutoReplyOk | StatusCode::SubscribeOk | StatusCode::UnsubscribeOk)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FdbError {
    #[error("{0}")]
    Status(StatusCode),
    #[error("{0}: {1}")]
    StatusWithReason(StatusCode, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

impl FdbError {
    pub fn status(&self) -> StatusCode {
        match self {
            FdbError::Status(s) | FdbError::StatusWithReason(s, _) => *s,
            FdbError::Io(_) => StatusCode::UnableToSend,
            FdbError::Decode(_) => StatusCode::MsgDecodeFail,
        }
    }
}

pub type FdbResult<T> = Result<T, FdbError>;

/// Wire encoding for a status/error reply's payload: `code (i32 LE)` followed
/// by a UTF-8 description (spec.md §7 "Propagation": "Errors are carried as
/// status messages with negative code and optional description string").
pub fn encode_status_payload(code: StatusCode, description: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + description.len());
    buf.extend_from_slice(&code.code().to_le_bytes());
    buf.extend_from_slice(description.as_bytes());
    buf
}

pub fn decode_status_payload(bytes: &[u8]) -> (StatusCode, String) {
    if bytes.len() < 4 {
        return (StatusCode::Unknown, String::new());
    }
    let mut code_bytes = [0u8; 4];
    code_bytes.copy_from_slice(&bytes[0..4]);
    let code = StatusCode::from_code(i32::from_le_bytes(code_bytes));
    let description = String::from_utf8_lossy(&bytes[4..]).into_owned();
    (code, description)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_reserved_code() {
        let codes = [
            StatusCode::Ok, StatusCode::AutoReplyOk, StatusCode::SubscribeOk, StatusCode::SubscribeFail,
            StatusCode::UnsubscribeOk, StatusCode::Timeout, StatusCode::InvalidId, StatusCode::PeerVanish,
            StatusCode::DeadLock, StatusCode::UnableToSend, StatusCode::NonExist, StatusCode::AlreadyExist,
            StatusCode::MsgDecodeFail, StatusCode::BadParameter, StatusCode::NotAvailable, StatusCode::InternalFail,
            StatusCode::OutOfMemory, StatusCode::NotImplemented, StatusCode::ObjectNotFound,
            StatusCode::AuthenticationFail, StatusCode::Unknown,
        ];
        for c in codes {
            assert_eq!(StatusCode::from_code(c.code()), c);
        }
    }

    #[test]
    fn unknown_numeric_code_maps_to_unknown() {
        assert_eq!(StatusCode::from_code(-999), StatusCode::Unknown);
    }

    #[test]
    fn subscribe_family_is_tagged() {
        assert!(StatusCode::SubscribeOk.is_subscribe());
        assert!(StatusCode::SubscribeFail.is_subscribe());
        assert!(StatusCode::UnsubscribeOk.is_subscribe());
        assert!(!StatusCode::Timeout.is_subscribe());
    }

    #[test]
    fn status_payload_round_trips_code_and_description() {
        let bytes = encode_status_payload(StatusCode::Timeout, "timed out");
        assert_eq!(decode_status_payload(&bytes), (StatusCode::Timeout, "timed out".to_string()));
    }

    #[test]
    fn ok_family_is_not_an_error() {
        assert!(!StatusCode::Ok.is_error());
        assert!(!StatusCode::AutoReplyOk.is_error());
        assert!(!StatusCode::UnsubscribeOk.is_error());
        assert!(StatusCode::Timeout.is_error());
        assert!(StatusCode::SubscribeFail.is_error());
    }
}
