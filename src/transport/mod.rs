// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Pluggable transports (spec.md §4.2): `tcp://`, `ipc://`, `udp://`.
//! `svc://` is resolved one layer up, by the name proxy, into a concrete
//! `tcp://`/`ipc://` url before it ever reaches this module.

pub mod ipc;
pub mod tcp;
pub mod udp;

use std::io;

use mio::event::Source;

/// A connected byte-stream peer: IPC or TCP. Framing lives in `pipe.rs`;
/// this trait only knows how to move bytes and how to register with mio.
pub trait Connection: Source + Send {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>>;
    fn peer_credentials(&self) -> Option<PeerCredentials> {
        None
    }
}

/// A bound listener accepting new peers.
pub trait Listener: Source + Send {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Connection>>>;
}

#[derive(Debug, Copy, Clone, Default)]
pub struct PeerCredentials {
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// `scheme://rest` split, e.g. `tcp://127.0.0.1:60001` -> `("tcp", "127.0.0.1:60001")`.
pub fn split_url(url: &str) -> io::Result<(&str, &str)> {
    url.split_once("://")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "malformed url, expected scheme://address"))
}

pub fn connect(url: &str) -> io::Result<Box<dyn Connection>> {
    let (scheme, addr) = split_url(url)?;
    match scheme {
        "tcp" => tcp::connect(addr),
        "ipc" => ipc::connect(addr),
        other => Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported transport for connect: {other}"))),
    }
}

pub fn bind(url: &str) -> io::Result<Box<dyn Listener>> {
    let (scheme, addr) = split_url(url)?;
    match scheme {
        "tcp" => tcp::bind(addr),
        "ipc" => ipc::bind(addr),
        other => Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported transport for bind: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scheme_from_address() {
        assert_eq!(split_url("tcp://host:1234").unwrap(), ("tcp", "host:1234"));
        assert_eq!(split_url("ipc:///tmp/fdb-ns").unwrap(), ("ipc", "/tmp/fdb-ns"));
    }

    #[test]
    fn rejects_urls_without_scheme_separator() {
        assert!(split_url("host:1234").is_err());
    }
}
