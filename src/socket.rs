// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The two socket roles an endpoint can open (spec.md §4.1, §4.2): a
//! [`ServerSocket`] listens and accepts, a [`ClientSocket`] connects with
//! bounded retries. Both dispatch their url's scheme to `transport::{bind,
//! connect}`; `svc://` is resolved to a concrete url one layer up, by the
//! name proxy, before either of these ever sees it.

use std::io;

use crate::global::{SessionId, SocketId, ADDRESS_BIND_RETRY_CNT, ADDRESS_BIND_RETRY_INTERVAL_MS, ADDRESS_CONNECT_RETRY_CNT, ADDRESS_CONNECT_RETRY_INTERVAL_MS};
use crate::transport::{self, Connection, Listener};

/// A listening socket. `is_first` on the resulting `on_online` notice
/// (spec.md §4.1 "Endpoint lifecycle") is true exactly for the first
/// session accepted after a (re)bind, which is how a server object learns
/// whether it just gained its very first client.
pub struct ServerSocket {
    id: SocketId,
    url: String,
    listener: Option<Box<dyn Listener>>,
    accepted_since_bind: u32,
    bind_attempt: u32,
}

impl ServerSocket {
    pub fn new(id: SocketId, url: String) -> ServerSocket {
        ServerSocket { id, url, listener: None, accepted_since_bind: 0, bind_attempt: 0 }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    pub fn bind(&mut self) -> io::Result<()> {
        self.bind_attempt += 1;
        let listener = transport::bind(&self.url)?;
        self.listener = Some(listener);
        self.accepted_since_bind = 0;
        Ok(())
    }

    /// Whether a retry is still owed after a failed bind, and the backoff
    /// to wait before trying it (spec.md §4.2 "Bind retry").
    pub fn next_bind_retry(&self) -> Option<u64> {
        if self.bind_attempt < ADDRESS_BIND_RETRY_CNT {
            Some(ADDRESS_BIND_RETRY_INTERVAL_MS)
        } else {
            None
        }
    }

    pub fn listener_mut(&mut self) -> Option<&mut dyn Listener> {
        self.listener.as_deref_mut()
    }

    /// Accepts every connection currently queued, tagging each with whether
    /// it is the first accepted since the last (re)bind.
    pub fn accept_all(&mut self) -> io::Result<Vec<(Box<dyn Connection>, bool)>> {
        let mut out = Vec::new();
        let Some(listener) = self.listener.as_mut() else {
            return Ok(out);
        };
        loop {
            match listener.accept()? {
                Some(conn) => {
                    let is_first = self.accepted_since_bind == 0;
                    self.accepted_since_bind += 1;
                    out.push((conn, is_first));
                }
                None => break,
            }
        }
        Ok(out)
    }

    pub fn unbind(&mut self) {
        self.listener = None;
    }
}

/// An outbound connection with bounded, backed-off retries (spec.md §4.2
/// "Connect retry", default 5 attempts / 200ms per the original).
pub struct ClientSocket {
    id: SocketId,
    url: String,
    connection: Option<Box<dyn Connection>>,
    session: Option<SessionId>,
    attempt: u32,
    enable_reconnect: bool,
}

impl ClientSocket {
    pub fn new(id: SocketId, url: String) -> ClientSocket {
        ClientSocket { id, url, connection: None, session: None, attempt: 0, enable_reconnect: false }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// A session exists only once the transport connection has been handed
    /// off to a `Session` (see `Context::connect`); until then the socket
    /// merely holds the freshly-established `Connection`.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    pub fn set_session_id(&mut self, id: Option<SessionId>) {
        self.session = id;
    }

    pub fn set_enable_reconnect(&mut self, enable: bool) {
        self.enable_reconnect = enable;
    }

    pub fn enable_reconnect(&self) -> bool {
        self.enable_reconnect
    }

    pub fn connect(&mut self) -> io::Result<()> {
        self.attempt += 1;
        let conn = transport::connect(&self.url)?;
        self.connection = Some(conn);
        Ok(())
    }

    pub fn next_connect_retry(&self) -> Option<u64> {
        if self.attempt < ADDRESS_CONNECT_RETRY_CNT || self.enable_reconnect {
            Some(ADDRESS_CONNECT_RETRY_INTERVAL_MS)
        } else {
            None
        }
    }

    pub fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
        self.connection.take()
    }

    pub fn on_disconnected(&mut self) {
        self.connection = None;
        self.session = None;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_socket_starts_unbound() {
        let s = ServerSocket::new(1, "ipc:///tmp/does-not-matter".into());
        assert!(!s.is_bound());
    }

    #[test]
    fn client_socket_exhausts_retries_after_the_configured_count() {
        let mut c = ClientSocket::new(1, "tcp://127.0.0.1:1".into());
        for _ in 0..ADDRESS_CONNECT_RETRY_CNT {
            assert!(c.next_connect_retry().is_some());
            c.attempt += 1;
        }
        assert!(c.next_connect_retry().is_none());
    }

    #[test]
    fn bind_to_an_invalid_scheme_fails() {
        let mut s = ServerSocket::new(1, "bogus://x".into());
        assert!(s.bind().is_err());
    }
}
