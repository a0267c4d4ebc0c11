// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The client side of host federation (spec.md §4.6 "Federation"): a name
//! server's connection to the host server, used to announce itself, answer
//! heartbeats, and learn about the other hosts in the domain. Grounded in
//! `CHostProxy` (original_source/client/CHostProxy.h/.cpp): one connection
//! per name server, reconnected automatically like [`crate::name_proxy`],
//! that reacts to `NTF_HOST_ONLINE` by re-querying the host list and
//! spinning up an inter-host [`crate::name_proxy::NameProxy`] for every
//! newly-seen remote name server.
//!
//! `HostServer` (host_server.rs) doesn't relay individual service addresses
//! between hosts — only host identity and liveness — so unlike the name
//! proxy's per-service cache, this module's job is purely topology:
//! maintaining the set of reachable remote name-server urls and handing
//! each one off to a `NameProxy` that does the actual service-address work
//! (see DESIGN.md for the inter-machine lookup scope this implies).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::StatusCode;
use crate::global::SessionId;
use crate::host_server::{self, msg, HostAddress};
use crate::message::Message;
use crate::name_proxy::NameProxy;
use crate::object::{FdbusObject, ObjectFlags};
use crate::subscription::SubscribeItem;
use crate::{Endpoint, EndpointRole, FdbError, FdbResult, Runtime};

/// Url the host server listens on by default.
pub fn default_url() -> String {
    format!("ipc://{}", crate::global::DEFAULT_HS_IPC_PATH)
}

struct RemoteHost {
    ns_url: String,
    proxy: NameProxy,
}

struct Shared {
    session: Mutex<Option<SessionId>>,
    self_host: HostAddress,
    runtime: Runtime,
    /// host_name -> (ns url, name proxy connected to it). Entries are added
    /// and removed as `NTF_HOST_ONLINE` re-queries reveal the host list has
    /// changed (spec.md §4.6 "Federation": "drops ones no longer present").
    remotes: Mutex<HashMap<String, RemoteHost>>,
}

struct ProxyObject {
    shared: Arc<Shared>,
    endpoint: Endpoint,
}

impl ProxyObject {
    fn refresh_remotes(&self, timeout_ms: u64) {
        let Some(session) = *self.shared.session.lock().unwrap() else { return };
        let Ok(reply) = self.endpoint.invoke(session, crate::global::OBJECT_MAIN, msg::REQ_QUERY_HOST, Vec::new(), timeout_ms) else {
            return;
        };
        if !reply.is_terminated() || reply.is_status() {
            return;
        }
        let Ok(hosts) = decode_host_list(&reply.payload()) else { return };

        let mut remotes = self.shared.remotes.lock().unwrap();
        let seen: Vec<String> = hosts.iter().map(|h| h.host_name.clone()).collect();
        remotes.retain(|name, _| seen.contains(name) || *name == self.shared.self_host.host_name);

        for host in hosts {
            if host.host_name == self.shared.self_host.host_name {
                continue;
            }
            if remotes.contains_key(&host.host_name) {
                continue;
            }
            match NameProxy::connect(&self.shared.runtime, Some(host.ns_url.clone())) {
                Ok(proxy) => {
                    remotes.insert(host.host_name.clone(), RemoteHost { ns_url: host.ns_url, proxy });
                }
                Err(_) => {
                    // Unreachable right now; the next NTF_HOST_ONLINE retries.
                }
            }
        }
    }
}

impl FdbusObject for ProxyObject {
    fn on_online(&mut self, session: SessionId, _is_first: bool) {
        *self.shared.session.lock().unwrap() = Some(session);
        let _ = self.endpoint.send(
            session,
            crate::global::OBJECT_MAIN,
            msg::REQ_REGISTER_HOST,
            self.shared.self_host.encode().unwrap_or_default(),
        );
        let item = SubscribeItem::new(host_server::host_online_event(), None);
        let _ = self.endpoint.subscribe(session, crate::global::OBJECT_MAIN, vec![item], 1000);
    }

    fn on_offline(&mut self, _session: SessionId) {
        *self.shared.session.lock().unwrap() = None;
        self.shared.remotes.lock().unwrap().retain(|name, _| *name == self.shared.self_host.host_name);
    }

    fn on_broadcast(&mut self, msg: &Message) {
        if msg.code() != host_server::host_online_event() {
            return;
        }
        if let Some(session) = *self.shared.session.lock().unwrap() {
            let _ = self.endpoint.send(session, crate::global::OBJECT_MAIN, msg::REQ_HEARTBEAT_OK, Vec::new());
        }
        self.refresh_remotes(1000);
    }
}

fn decode_host_list(bytes: &[u8]) -> std::io::Result<Vec<HostAddress>> {
    use byteorder::{LittleEndian, ReadBytesExt};
    let mut cur = std::io::Cursor::new(bytes);
    let count = cur.read_u16::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = cur.read_u16::<LittleEndian>()? as usize;
        let mut buf = vec![0u8; len];
        std::io::Read::read_exact(&mut cur, &mut buf)?;
        out.push(HostAddress::decode(&buf)?);
    }
    Ok(out)
}

/// A name server's connection to the host server (spec.md §4.6): announces
/// `self_host`, keeps it alive against the heartbeat, and maintains a
/// [`NameProxy`] per remote name server discovered through the host
/// registry. Cheap to clone; clones share the same connection and table.
#[derive(Clone)]
pub struct HostProxy {
    endpoint: Endpoint,
    shared: Arc<Shared>,
}

impl HostProxy {
    /// Connects to the local host server at `url` (or [`default_url`]) and
    /// announces `self_host` once the session is up.
    pub fn connect(runtime: &Runtime, url: Option<String>, self_host: HostAddress) -> FdbResult<HostProxy> {
        let endpoint = runtime.create_endpoint("fdb_host_proxy", EndpointRole::Client)?;
        let shared = Arc::new(Shared {
            session: Mutex::new(None),
            self_host,
            runtime: runtime.clone(),
            remotes: Mutex::new(HashMap::new()),
        });
        let object = ProxyObject { shared: shared.clone(), endpoint: endpoint.clone() };
        endpoint.set_main_object(Box::new(object), ObjectFlags::empty())?;
        endpoint.connect(url.unwrap_or_else(default_url), true)?;
        Ok(HostProxy { endpoint, shared })
    }

    fn wait_for_session(&self, timeout_ms: u64) -> FdbResult<SessionId> {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms.max(1));
        loop {
            if let Some(session) = *self.shared.session.lock().unwrap() {
                return Ok(session);
            }
            if std::time::Instant::now() >= deadline {
                return Err(FdbError::Status(StatusCode::Timeout));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Blocks until the host server has acknowledged `REQ_REGISTER_HOST`
    /// (i.e. there's a live session to it). Useful right after
    /// [`HostProxy::connect`] before relying on [`HostProxy::remote_hosts`].
    pub fn wait_ready(&self, timeout_ms: u64) -> FdbResult<()> {
        self.wait_for_session(timeout_ms).map(|_| ())
    }

    /// Names of every remote host currently known to be reachable, each
    /// backed by a live [`NameProxy`] connected to that host's name server.
    pub fn remote_hosts(&self) -> Vec<String> {
        self.shared.remotes.lock().unwrap().keys().cloned().collect()
    }

    /// The [`NameProxy`] connected to `host_name`'s name server, if that
    /// host is currently known (spec.md §4.6 "service resolution for local
    /// clients then unions local and remote results").
    pub fn remote_name_proxy(&self, host_name: &str) -> Option<NameProxy> {
        self.shared.remotes.lock().unwrap().get(host_name).map(|r| r.proxy.clone())
    }

    /// Forces an immediate re-query of the host list rather than waiting
    /// for the next heartbeat broadcast.
    pub fn refresh(&self, timeout_ms: u64) {
        let object = ProxyObject { shared: self.shared.clone(), endpoint: self.endpoint.clone() };
        object.refresh_remotes(timeout_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_empty_host_list() {
        let bytes = 0u16.to_le_bytes();
        let hosts = decode_host_list(&bytes).unwrap();
        assert!(hosts.is_empty());
    }

    #[test]
    fn decodes_host_list_round_trip_with_query_handler_format() {
        let a = HostAddress { ip_address: "10.0.0.1".into(), ns_url: "tcp://10.0.0.1:60001".into(), host_name: "host-a".into() };
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_le_bytes());
        let encoded = a.encode().unwrap();
        buf.extend_from_slice(&(encoded.len() as u16).to_le_bytes());
        buf.extend_from_slice(&encoded);
        let hosts = decode_host_list(&buf).unwrap();
        assert_eq!(hosts, vec![a]);
    }
}
