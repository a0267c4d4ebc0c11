// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The name server (spec.md §4.5 "Service discovery"): resolves service
//! names to transport addresses. A server endpoint allocates an address,
//! binds it, then registers the bound url; a client endpoint queries a
//! name and, if it isn't registered yet, subscribes to be told the moment
//! it comes online.
//!
//! Message codes and parcelable shapes below are grounded in the original
//! `FdbNsMsgCode` enum and `FdbMsgAddressList`/`FdbMsgAddrBindResults`
//! (CFdbIfNameServer.h): this module reimplements their wire meaning with
//! hand-rolled little-endian codecs in the style of `subscription.rs` and
//! `sideband.rs`, rather than the original's parcelable framework.

use std::collections::HashMap;
use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::StatusCode;
use crate::global::{
    EventCode, MsgCode, SessionId, DEFAULT_IPC_PREFIX, DYNAMIC_TCP_PORT_MAX, DYNAMIC_TCP_PORT_MIN,
};
use crate::message::Message;
use crate::object::FdbusObject;
use crate::subscription::SubscribeItem;
use crate::Endpoint;

/// `FdbNsMsgCode` (CFdbIfNameServer.h).
pub mod msg {
    use crate::global::MsgCode;

    pub const REQ_ALLOC_SERVICE_ADDRESS: MsgCode = 0;
    pub const REQ_REGISTER_SERVICE: MsgCode = 1;
    pub const REQ_UNREGISTER_SERVICE: MsgCode = 2;
    pub const REQ_QUERY_SERVICE: MsgCode = 3;
    pub const REQ_QUERY_SERVICE_INTER_MACHINE: MsgCode = 4;
    pub const REQ_QUERY_HOST_LOCAL: MsgCode = 5;
    pub const NTF_SERVICE_ONLINE: MsgCode = 6;
    pub const NTF_SERVICE_ONLINE_INTER_MACHINE: MsgCode = 7;
    pub const NTF_MORE_ADDRESS: MsgCode = 8;
    pub const NTF_SERVICE_ONLINE_MONITOR: MsgCode = 9;
    pub const NTF_SERVICE_ONLINE_MONITOR_INTER_MACHINE: MsgCode = 10;
    pub const NTF_HOST_ONLINE_LOCAL: MsgCode = 11;
    pub const NTF_HOST_INFO: MsgCode = 12;
}

/// `FdbMsgAddressList`: a service name, the host that offers it, and the
/// transport urls it is reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressList {
    pub service_name: String,
    pub host_name: String,
    pub is_local: bool,
    pub addresses: Vec<String>,
    pub tokens: Vec<String>,
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

fn write_string_list(buf: &mut Vec<u8>, items: &[String]) -> io::Result<()> {
    buf.write_u16::<LittleEndian>(items.len() as u16)?;
    for item in items {
        write_string(buf, item)?;
    }
    Ok(())
}

fn read_string_list(cur: &mut io::Cursor<&[u8]>) -> io::Result<Vec<String>> {
    let count = cur.read_u16::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_string(cur)?);
    }
    Ok(out)
}

impl AddressList {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_string(&mut buf, &self.service_name)?;
        write_string(&mut buf, &self.host_name)?;
        buf.write_u8(self.is_local as u8)?;
        write_string_list(&mut buf, &self.addresses)?;
        write_string_list(&mut buf, &self.tokens)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<AddressList> {
        let mut cur = io::Cursor::new(bytes);
        Ok(AddressList {
            service_name: read_string(&mut cur)?,
            host_name: read_string(&mut cur)?,
            is_local: cur.read_u8()? != 0,
            addresses: read_string_list(&mut cur)?,
            tokens: read_string_list(&mut cur)?,
        })
    }
}

/// `FdbAddrBindStatus`/`FdbMsgAddrBindResults`: the reply to
/// `REQ_ALLOC_SERVICE_ADDRESS`, one `(requested, allocated)` pair per
/// transport the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddrBindResults {
    pub service_name: String,
    pub results: Vec<(String, String)>,
}

impl AddrBindResults {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_string(&mut buf, &self.service_name)?;
        buf.write_u16::<LittleEndian>(self.results.len() as u16)?;
        for (requested, allocated) in &self.results {
            write_string(&mut buf, requested)?;
            write_string(&mut buf, allocated)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<AddrBindResults> {
        let mut cur = io::Cursor::new(bytes);
        let service_name = read_string(&mut cur)?;
        let count = cur.read_u16::<LittleEndian>()?;
        let mut results = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let requested = read_string(&mut cur)?;
            let allocated = read_string(&mut cur)?;
            results.push((requested, allocated));
        }
        Ok(AddrBindResults { service_name, results })
    }
}

/// A request for `REQ_ALLOC_SERVICE_ADDRESS`: which transports a server
/// wants an address allocated on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocRequest {
    pub service_name: String,
    pub want_tcp: bool,
    pub want_ipc: bool,
}

impl AllocRequest {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_string(&mut buf, &self.service_name)?;
        buf.write_u8(self.want_tcp as u8)?;
        buf.write_u8(self.want_ipc as u8)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<AllocRequest> {
        let mut cur = io::Cursor::new(bytes);
        Ok(AllocRequest {
            service_name: read_string(&mut cur)?,
            want_tcp: cur.read_u8()? != 0,
            want_ipc: cur.read_u8()? != 0,
        })
    }
}

/// Derives a stable event code for a service name (spec.md §4.4 "Group
/// semantics" reused here: every service gets its own broadcast key, so
/// `NTF_SERVICE_ONLINE` rides the same subscribe/cache machinery as any
/// other event instead of a bespoke notification path).
pub fn service_event_code(service_name: &str) -> EventCode {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in service_name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    crate::global::make_event_code(0, (hash & 0x00FF_FFFF) as i32)
}

struct ServiceEntry {
    session_id: SessionId,
    addresses: Vec<String>,
    tokens: Vec<String>,
}

/// `CNameServer` (server/CNameServer.h): the registry table plus the two
/// dynamic address allocators. Runs as the main object of a dedicated
/// endpoint bound at `ipc:///tmp/fdb-ns` (and, if reachable, the well-known
/// name-server TCP port).
pub struct NameServer {
    endpoint: Endpoint,
    host_name: String,
    registry: HashMap<String, ServiceEntry>,
    tcp_port_allocator: u16,
    ipc_allocator: u32,
}

impl NameServer {
    pub fn new(endpoint: Endpoint, host_name: impl Into<String>) -> NameServer {
        NameServer {
            endpoint,
            host_name: host_name.into(),
            registry: HashMap::new(),
            tcp_port_allocator: DYNAMIC_TCP_PORT_MIN,
            ipc_allocator: 0,
        }
    }

    fn next_tcp_port(&mut self) -> u16 {
        let port = self.tcp_port_allocator;
        self.tcp_port_allocator = if port >= DYNAMIC_TCP_PORT_MAX { DYNAMIC_TCP_PORT_MIN } else { port + 1 };
        port
    }

    fn next_ipc_path(&mut self, service_name: &str) -> String {
        let id = self.ipc_allocator;
        self.ipc_allocator = self.ipc_allocator.wrapping_add(1);
        format!("ipc://{DEFAULT_IPC_PREFIX}-{service_name}-{id}")
    }

    fn handle_alloc(&mut self, msg: &Message) {
        let Ok(req) = AllocRequest::decode(&msg.payload()) else {
            msg.reply_status(StatusCode::MsgDecodeFail, "bad alloc request");
            return;
        };
        let mut results = Vec::new();
        if req.want_tcp {
            let port = self.next_tcp_port();
            results.push(("tcp".to_string(), format!("tcp://0.0.0.0:{port}")));
        }
        if req.want_ipc {
            let path = self.next_ipc_path(&req.service_name);
            results.push(("ipc".to_string(), path));
        }
        let reply = AddrBindResults { service_name: req.service_name, results };
        match reply.encode() {
            Ok(bytes) => {
                msg.reply(bytes);
            }
            Err(_) => {
                msg.reply_status(StatusCode::InternalFail, "failed to encode address allocation");
            }
        }
    }

    fn handle_register(&mut self, session_id: SessionId, msg: &Message) {
        let Ok(list) = AddressList::decode(&msg.payload()) else {
            msg.reply_status(StatusCode::MsgDecodeFail, "bad register request");
            return;
        };
        let event_code = service_event_code(&list.service_name);
        self.registry.insert(
            list.service_name.clone(),
            ServiceEntry { session_id, addresses: list.addresses.clone(), tokens: list.tokens.clone() },
        );
        msg.reply_status(StatusCode::AutoReplyOk, "");

        let broadcast = AddressList {
            service_name: list.service_name.clone(),
            host_name: self.host_name.clone(),
            is_local: true,
            addresses: list.addresses,
            tokens: list.tokens,
        };
        if let Ok(bytes) = broadcast.encode() {
            let _ = self.endpoint.broadcast(crate::global::OBJECT_MAIN, event_code, Some(list.service_name), bytes, false);
        }
    }

    fn handle_unregister(&mut self, msg: &Message) {
        let service_name = String::from_utf8_lossy(&msg.payload()).into_owned();
        self.registry.remove(&service_name);
        msg.reply_status(StatusCode::Ok, "");
    }

    fn handle_query(&mut self, msg: &Message) {
        let service_name = String::from_utf8_lossy(&msg.payload()).into_owned();
        match self.registry.get(&service_name) {
            Some(entry) => {
                let list = AddressList {
                    service_name,
                    host_name: self.host_name.clone(),
                    is_local: true,
                    addresses: entry.addresses.clone(),
                    tokens: entry.tokens.clone(),
                };
                match list.encode() {
                    Ok(bytes) => {
                        msg.reply(bytes);
                    }
                    Err(_) => {
                        msg.reply_status(StatusCode::InternalFail, "failed to encode address list");
                    }
                }
            }
            None => {
                msg.reply_status(StatusCode::NotAvailable, "service not registered");
            }
        }
    }
}

impl FdbusObject for NameServer {
    fn on_invoke(&mut self, msg: &Message) {
        match msg.code() as MsgCode {
            msg::REQ_ALLOC_SERVICE_ADDRESS => self.handle_alloc(msg),
            msg::REQ_REGISTER_SERVICE => self.handle_register(msg.session_id(), msg),
            msg::REQ_UNREGISTER_SERVICE => self.handle_unregister(msg),
            msg::REQ_QUERY_SERVICE | msg::REQ_QUERY_SERVICE_INTER_MACHINE => self.handle_query(msg),
            msg::REQ_QUERY_HOST_LOCAL => {
                msg.reply(self.host_name.clone().into_bytes());
            }
            _ => {
                msg.reply_status(StatusCode::NotImplemented, "unknown name server request");
            }
        }
    }

    fn on_subscribe(&mut self, _msg: &Message, _items: &[SubscribeItem]) {
        // Replay of the last known address list for a newly subscribed
        // service is handled generically by the event-cache machinery
        // (Context::handle_subscribe), since this object runs with
        // ObjectFlags::EVENT_CACHE_ENABLED.
    }

    fn on_offline(&mut self, session: SessionId) {
        self.registry.retain(|_, entry| entry.session_id != session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_list_round_trips() {
        let list = AddressList {
            service_name: "org.fdbus.example".into(),
            host_name: "localhost".into(),
            is_local: true,
            addresses: vec!["tcp://0.0.0.0:60010".into(), "ipc:///tmp/fdb-ipc-example".into()],
            tokens: vec!["t1".into()],
        };
        let encoded = list.encode().unwrap();
        assert_eq!(AddressList::decode(&encoded).unwrap(), list);
    }

    #[test]
    fn alloc_request_round_trips() {
        let req = AllocRequest { service_name: "svc".into(), want_tcp: true, want_ipc: false };
        let encoded = req.encode().unwrap();
        assert_eq!(AllocRequest::decode(&encoded).unwrap(), req);
    }

    #[test]
    fn bind_results_round_trip() {
        let results = AddrBindResults {
            service_name: "svc".into(),
            results: vec![("tcp".into(), "tcp://0.0.0.0:60010".into())],
        };
        let encoded = results.encode().unwrap();
        assert_eq!(AddrBindResults::decode(&encoded).unwrap(), results);
    }

    #[test]
    fn service_event_codes_are_stable_and_distinct() {
        let a = service_event_code("org.fdbus.alpha");
        let b = service_event_code("org.fdbus.beta");
        assert_eq!(a, service_event_code("org.fdbus.alpha"));
        assert_ne!(a, b);
    }
}
