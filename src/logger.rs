// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The log server (spec.md §4.7 "Logging"): a plain fdbus service that
//! collects one-way log lines from any endpoint willing to send them, and
//! a small client helper to send them. Lines travel as ordinary `send`
//! messages (`MsgFlags::NOREPLY_EXPECTED`, spec.md §4.3) on a well-known
//! service, not as a special wire feature — logging is just another object
//! on the bus, the way the teacher's own `debug!`/`trace!` plumbing is just
//! another `log` call.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::global::{MsgCode, SessionId};
use crate::message::Message;
use crate::object::{FdbusObject, ObjectFlags};
use crate::{Endpoint, EndpointRole, FdbResult, Runtime};

pub const FDB_LOG_SERVER_NAME: &str = crate::global::FDB_LOG_SERVER_NAME;

/// The single message code log lines travel on.
pub const LOG_LINE: MsgCode = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub tag: String,
    pub level: log::Level,
    pub text: String,
}

fn level_to_byte(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 0,
        log::Level::Warn => 1,
        log::Level::Info => 2,
        log::Level::Debug => 3,
        log::Level::Trace => 4,
    }
}

fn byte_to_level(byte: u8) -> log::Level {
    match byte {
        0 => log::Level::Error,
        1 => log::Level::Warn,
        2 => log::Level::Info,
        3 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    buf.write_u16::<LittleEndian>(s.len() as u16)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_string(cur: &mut io::Cursor<&[u8]>) -> io::Result<String> {
    let len = cur.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    io::Read::read_exact(cur, &mut bytes)?;
    String::from_utf8(bytes).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 string"))
}

impl LogEntry {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_string(&mut buf, &self.tag)?;
        buf.write_u8(level_to_byte(self.level))?;
        write_string(&mut buf, &self.text)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<LogEntry> {
        let mut cur = io::Cursor::new(bytes);
        let tag = read_string(&mut cur)?;
        let level = byte_to_level(cur.read_u8()?);
        let text = read_string(&mut cur)?;
        Ok(LogEntry { tag, level, text })
    }
}

/// Main object of `org.fdbus.log-server`: writes every entry it receives to
/// `output` (or stdout, `fdb_log_server --output` unset), one line per
/// entry in the style of `env_logger`'s default formatter.
pub struct LogServer {
    output: Box<dyn Write + Send>,
}

impl LogServer {
    pub fn new(output: Option<&Path>) -> io::Result<LogServer> {
        let output: Box<dyn Write + Send> = match output {
            Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
            None => Box::new(io::stdout()),
        };
        Ok(LogServer { output })
    }

    pub fn with_writer(output: Box<dyn Write + Send>) -> LogServer {
        LogServer { output }
    }
}

impl FdbusObject for LogServer {
    fn on_invoke(&mut self, msg: &Message) {
        if msg.code() as MsgCode != LOG_LINE {
            return;
        }
        let Ok(entry) = LogEntry::decode(&msg.payload()) else { return };
        let _ = writeln!(self.output, "[{}] {}: {}", entry.level, entry.tag, entry.text);
    }
}

/// Tracks the session id handed to the client's main object by
/// `on_online`, so `LogClient::log` has something to address a `send` to
/// (spec.md §4.1 "a session id arrives asynchronously via `on_online`").
struct SessionTracker(Arc<Mutex<Option<SessionId>>>);

impl FdbusObject for SessionTracker {
    fn on_online(&mut self, session: SessionId, _is_first: bool) {
        *self.0.lock().unwrap() = Some(session);
    }

    fn on_offline(&mut self, _session: SessionId) {
        *self.0.lock().unwrap() = None;
    }
}

/// Client-side helper: connects to the log server and fires one-way `send`
/// messages. Cheap to clone; every clone shares the same endpoint.
#[derive(Clone)]
pub struct LogClient {
    endpoint: Endpoint,
    session: Arc<Mutex<Option<SessionId>>>,
    tag: String,
}

impl LogClient {
    pub fn connect(runtime: &Runtime, url: impl Into<String>, tag: impl Into<String>) -> FdbResult<LogClient> {
        let endpoint = runtime.create_endpoint("fdb_log_client", EndpointRole::Client)?;
        let session = Arc::new(Mutex::new(None));
        endpoint.set_main_object(Box::new(SessionTracker(session.clone())), ObjectFlags::empty())?;
        endpoint.connect(url, true)?;
        Ok(LogClient { endpoint, session, tag: tag.into() })
    }

    /// Blocks up to `timeout_ms` for the connection to the log server to
    /// come online, so callers that need to know whether [`LogClient::log`]
    /// will actually send anything (rather than silently no-op) can wait
    /// first — `fdb_log_client` uses this before its one-shot send.
    pub fn wait_ready(&self, timeout_ms: u64) -> FdbResult<()> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms.max(1));
        loop {
            if self.session.lock().unwrap().is_some() {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(crate::FdbError::Status(crate::StatusCode::Timeout));
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    /// Sends one log line. A no-op until the connection to the log server
    /// has actually come online.
    pub fn log(&self, level: log::Level, text: impl Into<String>) -> FdbResult<()> {
        let Some(session) = *self.session.lock().unwrap() else { return Ok(()) };
        let entry = LogEntry { tag: self.tag.clone(), level, text: text.into() };
        let payload = entry
            .encode()
            .map_err(|_| crate::FdbError::Status(crate::StatusCode::InternalFail))?;
        self.endpoint.send(session, crate::global::OBJECT_MAIN, LOG_LINE, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_round_trips() {
        let entry = LogEntry { tag: "demo".into(), level: log::Level::Warn, text: "something happened".into() };
        let encoded = entry.encode().unwrap();
        assert_eq!(LogEntry::decode(&encoded).unwrap(), entry);
    }
}
