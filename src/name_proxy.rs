// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! The client side of service discovery (spec.md §4.5 "Service discovery"):
//! resolves a `svc://<name>` url to a concrete transport address by talking
//! to the name server, and lets a server register the address it bound.
//! Grounded in `CNameProxy` (original_source/client/CNameProxy.h/.cpp):
//! a single connection to the name server per process, reconnected on drop
//! at `NS_RECONNECT_INTERVAL_MS`, multiplexing every local endpoint's
//! lookups and registrations over it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::StatusCode;
use crate::global::SessionId;
use crate::message::Message;
use crate::name_server::{self, msg, AddressList, AllocRequest};
use crate::object::{FdbusObject, ObjectFlags};
use crate::subscription::SubscribeItem;
use crate::{Endpoint, EndpointRole, FdbError, FdbResult, Runtime};

/// Url the name server listens on by default — same host, over the
/// well-known ipc path (spec.md §4.5).
pub fn default_url() -> String {
    format!("ipc://{}", crate::global::DEFAULT_NS_IPC_PATH)
}

/// Turns a finished invoke into its payload, or the status it failed with
/// — every call site below needs this, so it isn't worth a `Message`
/// method used by nothing else in the crate.
fn finished_payload(msg: Message) -> FdbResult<Vec<u8>> {
    if !msg.is_terminated() {
        return Err(FdbError::Status(StatusCode::Timeout));
    }
    if msg.is_status() {
        let (status, description) = msg.decode_status().unwrap_or((StatusCode::Unknown, String::new()));
        if status == StatusCode::Ok || status == StatusCode::AutoReplyOk {
            return Ok(Vec::new());
        }
        return Err(FdbError::StatusWithReason(status, description));
    }
    Ok(msg.payload())
}

struct Shared {
    session: Mutex<Option<SessionId>>,
    /// Service name -> most recently known address list, kept so a second
    /// lookup for a name already being waited on doesn't need another
    /// round trip (refreshed on every `NTF_SERVICE_ONLINE` broadcast).
    known: Mutex<HashMap<String, AddressList>>,
}

struct ProxyObject(Arc<Shared>);

impl FdbusObject for ProxyObject {
    fn on_online(&mut self, session: SessionId, _is_first: bool) {
        *self.0.session.lock().unwrap() = Some(session);
    }

    fn on_offline(&mut self, _session: SessionId) {
        *self.0.session.lock().unwrap() = None;
    }

    fn on_broadcast(&mut self, msg: &Message) {
        if msg.code() != msg::NTF_SERVICE_ONLINE {
            return;
        }
        if let Ok(list) = AddressList::decode(&msg.payload()) {
            self.0.known.lock().unwrap().insert(list.service_name.clone(), list);
        }
    }
}

/// A connection to the name server, reconnected automatically (spec.md
/// §4.2 "Reconnect") until dropped. Cheap to clone; clones share the same
/// connection and cache.
#[derive(Clone)]
pub struct NameProxy {
    endpoint: Endpoint,
    shared: Arc<Shared>,
}

impl NameProxy {
    /// Connects to the local name server at `url` (or [`default_url`]).
    pub fn connect(runtime: &Runtime, url: Option<String>) -> FdbResult<NameProxy> {
        let endpoint = runtime.create_endpoint("fdb_name_proxy", EndpointRole::Client)?;
        let shared = Arc::new(Shared { session: Mutex::new(None), known: Mutex::new(HashMap::new()) });
        endpoint.set_main_object(Box::new(ProxyObject(shared.clone())), ObjectFlags::empty())?;
        endpoint.connect(url.unwrap_or_else(default_url), true)?;
        Ok(NameProxy { endpoint, shared })
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

    /// Asks the name server to allocate a fresh address for `service_name`
    /// (`REQ_ALLOC_SERVICE_ADDRESS`). The caller binds each returned url
    /// itself, then calls [`NameProxy::register`] with the bound urls.
    pub fn allocate(&self, service_name: &str, want_tcp: bool, want_ipc: bool, timeout_ms: u64) -> FdbResult<Vec<(String, String)>> {
        let session = self.wait_for_session(timeout_ms)?;
        let req = AllocRequest { service_name: service_name.to_string(), want_tcp, want_ipc };
        let payload = req.encode().map_err(|_| FdbError::Status(StatusCode::InternalFail))?;
        let reply = self.endpoint.invoke(session, crate::global::OBJECT_MAIN, msg::REQ_ALLOC_SERVICE_ADDRESS, payload, timeout_ms)?;
        finished_payload(reply).and_then(|bytes| {
            name_server::AddrBindResults::decode(&bytes)
                .map(|r| r.results)
                .map_err(|_| FdbError::Status(StatusCode::MsgDecodeFail))
        })
    }

    /// Registers the addresses a server endpoint bound, making the service
    /// visible to `lookup`/`subscribe_online` callers.
    pub fn register(&self, service_name: &str, addresses: Vec<String>, tokens: Vec<String>, host_name: &str, timeout_ms: u64) -> FdbResult<()> {
        let session = self.wait_for_session(timeout_ms)?;
        let list = AddressList { service_name: service_name.to_string(), host_name: host_name.to_string(), is_local: true, addresses, tokens };
        let payload = list.encode().map_err(|_| FdbError::Status(StatusCode::InternalFail))?;
        let reply = self.endpoint.invoke(session, crate::global::OBJECT_MAIN, msg::REQ_REGISTER_SERVICE, payload, timeout_ms)?;
        finished_payload(reply).map(|_| ())
    }

    pub fn unregister(&self, service_name: &str) -> FdbResult<()> {
        let session = *self.shared.session.lock().unwrap();
        let Some(session) = session else { return Ok(()) };
        self.endpoint.send(session, crate::global::OBJECT_MAIN, msg::REQ_UNREGISTER_SERVICE, service_name.as_bytes().to_vec())
    }

    /// Resolves `service_name` to its currently registered addresses, or
    /// `NotAvailable` if nobody has registered it yet — callers that want
    /// to wait should pair this with [`NameProxy::subscribe_online`].
    pub fn lookup(&self, service_name: &str, timeout_ms: u64) -> FdbResult<AddressList> {
        if let Some(list) = self.shared.known.lock().unwrap().get(service_name).cloned() {
            return Ok(list);
        }
        let session = self.wait_for_session(timeout_ms)?;
        let reply = self.endpoint.invoke(session, crate::global::OBJECT_MAIN, msg::REQ_QUERY_SERVICE, service_name.as_bytes().to_vec(), timeout_ms)?;
        let bytes = finished_payload(reply)?;
        let list = AddressList::decode(&bytes).map_err(|_| FdbError::Status(StatusCode::MsgDecodeFail))?;
        self.shared.known.lock().unwrap().insert(service_name.to_string(), list.clone());
        Ok(list)
    }

    /// Subscribes to `NTF_SERVICE_ONLINE` for `service_name`, so the proxy's
    /// cache (and, via `on_broadcast`, anyone polling [`NameProxy::lookup`])
    /// picks up the address the moment the service registers — the event
    /// cache on the name server replays the last known value immediately if
    /// it's already online, so this also resolves the race with `lookup`.
    pub fn subscribe_online(&self, service_name: &str, timeout_ms: u64) -> FdbResult<()> {
        let session = self.wait_for_session(timeout_ms)?;
        let event_code = name_server::service_event_code(service_name);
        let item = SubscribeItem::new(event_code, Some(service_name.to_string()));
        self.endpoint.subscribe(session, crate::global::OBJECT_MAIN, vec![item], timeout_ms)?;
        Ok(())
    }
}
