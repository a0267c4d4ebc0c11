// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! An endpoint (spec.md §3 "Endpoint", §4.1): a named participant on the
//! bus that owns one or more sockets and one or more objects, registered
//! synchronously with the context before it does anything else.

use std::collections::HashMap;

use crate::global::{make_object_id, EndpointId, IdSequence, ObjectId, SecurityLevel, SessionId, SocketId, OBJECT_MAIN};
use crate::message::Message;
use crate::object::{FdbusObject, Object, ObjectFlags};
use crate::socket::{ClientSocket, ServerSocket};

/// Invoked at most once per inbound message addressed to an object id that
/// doesn't exist yet (spec.md §4.4 "Object creation on demand", §9 open
/// question): runs synchronously on the context thread so the object is
/// bound before the message is routed a second time.
pub type CreateObjectHook = Box<dyn FnMut(&mut Endpoint, &Message) + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointRole {
    Server,
    Client,
    NameServer,
    HostServer,
    Unknown,
}

enum SocketHandle {
    Server(ServerSocket),
    Client(ClientSocket),
}

impl SocketHandle {
    fn id(&self) -> SocketId {
        match self {
            SocketHandle::Server(s) => s.id(),
            SocketHandle::Client(c) => c.id(),
        }
    }
}

/// A named bus participant. Object ids handed out by an endpoint encode
/// the endpoint's own id sequence as the high bits so two endpoints never
/// collide on an object id (spec.md §6 "Object id").
pub struct Endpoint {
    id: EndpointId,
    name: String,
    role: EndpointRole,
    sockets: HashMap<SocketId, SocketHandle>,
    objects: HashMap<ObjectId, Object>,
    object_sn: IdSequence,
    token_list: Vec<String>,
    session_count: u32,
    create_object_hook: Option<CreateObjectHook>,
}

impl Endpoint {
    pub fn new(id: EndpointId, name: impl Into<String>, role: EndpointRole) -> Endpoint {
        let mut ep = Endpoint {
            id,
            name: name.into(),
            role,
            sockets: HashMap::new(),
            objects: HashMap::new(),
            object_sn: IdSequence::new(),
            token_list: Vec::new(),
            session_count: 0,
            create_object_hook: None,
        };
        ep.object_sn.next(); // sn 0 is reserved for OBJECT_MAIN
        ep
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    pub fn token_list(&self) -> &[String] {
        &self.token_list
    }

    pub fn set_token_list(&mut self, tokens: Vec<String>) {
        self.token_list = tokens;
    }

    /// Current security level is simply the number of tokens handed out by
    /// the name server for this endpoint (spec.md §4.5 "Token levels").
    pub fn security_level(&self) -> SecurityLevel {
        self.token_list.len() as SecurityLevel
    }

    /// Registers a new non-main object, returning its freshly minted id.
    pub fn add_object(&mut self, callback: Box<dyn FdbusObject>, flags: ObjectFlags) -> ObjectId {
        let sn = self.object_sn.next();
        let id = make_object_id(sn, self.id);
        self.objects.insert(id, Object::new(id, callback, flags));
        id
    }

    /// Registers the endpoint's single main object under `OBJECT_MAIN`.
    pub fn set_main_object(&mut self, callback: Box<dyn FdbusObject>, flags: ObjectFlags) {
        self.objects.insert(OBJECT_MAIN, Object::new(OBJECT_MAIN, callback, flags));
    }

    /// Registers an object at a caller-chosen id, used by `on_create_object`
    /// to bind an object at the exact id an inbound message named.
    pub fn bind_object(&mut self, id: ObjectId, callback: Box<dyn FdbusObject>, flags: ObjectFlags) {
        self.objects.insert(id, Object::new(id, callback, flags));
    }

    pub fn set_create_object_hook(&mut self, hook: CreateObjectHook) {
        self.create_object_hook = Some(hook);
    }

    /// Runs the on-demand creation hook for `msg`, if one is installed. The
    /// hook, if present, is expected to call `bind_object` synchronously.
    pub fn try_create_object(&mut self, msg: &Message) {
        if let Some(mut hook) = self.create_object_hook.take() {
            hook(self, msg);
            self.create_object_hook = Some(hook);
        }
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn has_object(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn remove_object(&mut self, id: ObjectId) -> Option<Object> {
        self.objects.remove(&id)
    }

    pub fn objects_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.objects.values_mut()
    }

    pub fn add_server_socket(&mut self, socket: ServerSocket) {
        self.sockets.insert(socket.id(), SocketHandle::Server(socket));
    }

    pub fn add_client_socket(&mut self, socket: ClientSocket) {
        self.sockets.insert(socket.id(), SocketHandle::Client(socket));
    }

    pub fn server_socket_mut(&mut self, id: SocketId) -> Option<&mut ServerSocket> {
        match self.sockets.get_mut(&id) {
            Some(SocketHandle::Server(s)) => Some(s),
            _ => None,
        }
    }

    pub fn client_socket_mut(&mut self, id: SocketId) -> Option<&mut ClientSocket> {
        match self.sockets.get_mut(&id) {
            Some(SocketHandle::Client(c)) => Some(c),
            _ => None,
        }
    }

    pub fn socket_ids(&self) -> Vec<SocketId> {
        self.sockets.keys().copied().collect()
    }

    pub fn session_opened(&mut self) {
        self.session_count += 1;
    }

    pub fn session_closed(&mut self) {
        self.session_count = self.session_count.saturating_sub(1);
    }

    pub fn session_count(&self) -> u32 {
        self.session_count
    }

    /// A peer vanished (spec.md §4.1 "Teardown"): every object gets
    /// `on_offline` so it can drop whatever state it held for that session.
    pub fn notify_offline(&mut self, session: SessionId) {
        for object in self.objects.values_mut() {
            object.dispatch_offline(session);
        }
        self.session_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    struct Noop;
    impl FdbusObject for Noop {}

    #[test]
    fn main_object_id_is_class_zero() {
        let mut ep = Endpoint::new(3, "svc", EndpointRole::Server);
        ep.set_main_object(Box::new(Noop), ObjectFlags::empty());
        assert!(ep.object_mut(OBJECT_MAIN).is_some());
    }

    #[test]
    fn additional_objects_get_distinct_ids() {
        let mut ep = Endpoint::new(3, "svc", EndpointRole::Server);
        let a = ep.add_object(Box::new(Noop), ObjectFlags::empty());
        let b = ep.add_object(Box::new(Noop), ObjectFlags::empty());
        assert_ne!(a, b);
    }

    #[test]
    fn security_level_tracks_token_count() {
        let mut ep = Endpoint::new(3, "svc", EndpointRole::Client);
        assert_eq!(ep.security_level(), 0);
        ep.set_token_list(vec!["t1".into(), "t2".into()]);
        assert_eq!(ep.security_level(), 2);
    }

    #[test]
    fn offline_dispatches_to_every_object() {
        let mut ep = Endpoint::new(3, "svc", EndpointRole::Server);
        ep.set_main_object(Box::new(Noop), ObjectFlags::empty());
        ep.session_opened();
        ep.notify_offline(1);
        assert_eq!(ep.session_count(), 0);
        let _ = Message::new_request(0, 0, vec![]);
    }
}
