// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! `ipc://` transport: a Unix-domain socket at the given filesystem path.

use std::io::{self, Read, Write};

use mio::event::Source;
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};

use super::{Connection, Listener, PeerCredentials};

pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    pub fn new(stream: UnixStream) -> IpcConnection {
        IpcConnection { stream }
    }
}

impl Connection for IpcConnection {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self.stream.write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn peer_credentials(&self) -> Option<PeerCredentials> {
        peer_cred(&self.stream)
    }
}

impl Source for IpcConnection {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }
    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

pub struct IpcBoundListener {
    listener: UnixListener,
    path: String,
}

impl Listener for IpcBoundListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Connection>>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some(Box::new(IpcConnection::new(stream)))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Source for IpcBoundListener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.listener.register(registry, token, interests)
    }
    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.listener.reregister(registry, token, interests)
    }
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.listener.deregister(registry)
    }
}

impl Drop for IpcBoundListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn connect(path: &str) -> io::Result<Box<dyn Connection>> {
    let stream = UnixStream::connect(path)?;
    Ok(Box::new(IpcConnection::new(stream)))
}

pub fn bind(path: &str) -> io::Result<Box<dyn Listener>> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    Ok(Box::new(IpcBoundListener { listener, path: path.to_owned() }))
}

#[cfg(unix)]
fn peer_cred(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    unsafe {
        let mut ucred: libc_ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc_ucred>() as u32;
        let ret = getsockopt_peercred(fd, &mut ucred as *mut _ as *mut libc::c_void, &mut len);
        if ret == 0 {
            Some(PeerCredentials { pid: Some(ucred.pid as u32), uid: Some(ucred.uid), gid: Some(ucred.gid) })
        } else {
            None
        }
    }
}

#[cfg(unix)]
#[repr(C)]
struct libc_ucred {
    pid: libc::pid_t,
    uid: libc::uid_t,
    gid: libc::gid_t,
}

#[cfg(unix)]
unsafe fn getsockopt_peercred(fd: std::os::unix::io::RawFd, value: *mut libc::c_void, len: *mut u32) -> i32 {
    libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_PEERCRED, value, len as *mut libc::socklen_t)
}
