// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! A logical endpoint sub-address (spec.md §3 "Object", §4.1, §4.4):
//! messages are addressed to `(endpoint, object_id)`; an endpoint always
//! has a main object (`OBJECT_MAIN`) and may register more, each
//! multiplexing its own request/reply, broadcast/subscribe and sideband
//! traffic behind a [`FdbusObject`] callback implementation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::global::{ObjectId, SessionId};
use crate::message::Message;
use crate::subscription::{EventCache, SubscribeItem, SubscriptionTable};
use crate::watchdog::Watchdog;
use crate::worker::Worker;

bitflags::bitflags! {
    /// Per-object behavior switches (spec.md §4.4 "Object flags").
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        const MIGRATE_ENABLED    = 1 << 0;
        const EVENT_CACHE_ENABLED = 1 << 1;
        const TIMESTAMP_ENABLED  = 1 << 2;
        const EVENT_ROUTE_ENABLED = 1 << 3;
        const WATCHDOG_ENABLED   = 1 << 4;
        const LOG_ENABLED        = 1 << 5;
        const AUTO_REMOVE        = 1 << 6;
    }
}

/// The user-supplied behavior of one object. Every method has a no-op
/// default so an implementer only overrides what their object actually
/// uses (spec.md §9 "Object" design notes).
pub trait FdbusObject: Send {
    fn on_invoke(&mut self, _msg: &Message) {}
    fn on_reply(&mut self, _msg: &Message) {}
    fn on_broadcast(&mut self, _msg: &Message) {}
    fn on_subscribe(&mut self, _msg: &Message, _items: &[SubscribeItem]) {}
    fn on_online(&mut self, _session: SessionId, _is_first: bool) {}
    fn on_offline(&mut self, _session: SessionId) {}
    fn on_get_event(&mut self, _msg: &Message) {}
    fn on_status(&mut self, _msg: &Message) {}
    fn on_bark(&mut self, _session: SessionId) {}
}

/// An object's callback is `Arc<Mutex<_>>`-backed rather than plain `Box`,
/// so `dispatch_*` can hand a clone of the `Arc` to a [`Worker`]'s queue
/// instead of running the callback on the context thread (spec.md §4.1
/// "If no worker is set, callbacks execute on the context thread").
type Callback = Arc<Mutex<Box<dyn FdbusObject>>>;

pub struct Object {
    id: ObjectId,
    flags: ObjectFlags,
    callback: Callback,
    worker: Option<Arc<Worker>>,
    subscriptions: SubscriptionTable,
    cache: EventCache,
    watchdog: Option<Watchdog>,
}

impl Object {
    pub fn new(id: ObjectId, callback: Box<dyn FdbusObject>, flags: ObjectFlags) -> Object {
        Object {
            id,
            flags,
            callback: Arc::new(Mutex::new(callback)),
            worker: None,
            subscriptions: SubscriptionTable::new(),
            cache: EventCache::new(),
            watchdog: None,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    /// Binds this object's callbacks to `worker`: every subsequent dispatch
    /// runs there instead of on the context thread.
    pub fn set_worker(&mut self, worker: Arc<Worker>) {
        self.worker = Some(worker);
    }

    pub fn enable_watchdog(&mut self, interval: Duration, max_retries: u32) {
        self.watchdog = Some(Watchdog::new(interval, max_retries));
        self.flags |= ObjectFlags::WATCHDOG_ENABLED;
    }

    pub fn watchdog_mut(&mut self) -> Option<&mut Watchdog> {
        self.watchdog.as_mut()
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionTable {
        &mut self.subscriptions
    }

    /// Records and subscribes `items` for `session`, invoking the object's
    /// `on_subscribe` so it can reply with the current value of anything it
    /// tracks (spec.md §4.4 "Subscribe").
    pub fn subscribe(&mut self, session: SessionId, msg: &Message, items: &[SubscribeItem]) {
        for item in items {
            self.subscriptions.subscribe(session, item);
        }
        self.callback.lock().unwrap().on_subscribe(msg, items);
    }

    pub fn unsubscribe(&mut self, session: SessionId, items: &[SubscribeItem]) {
        for item in items {
            self.subscriptions.unsubscribe(session, item);
        }
    }

    /// Applies the event-cache-enabled rule (spec.md §4.4 "Event cache"): a
    /// broadcast is suppressed when the payload is unchanged from the
    /// cached value, unless the message carries `FORCE_UPDATE` or the
    /// object disables caching (`MANUAL_UPDATE` objects always fall
    /// through to the caller regardless of this check).
    pub fn should_broadcast(&mut self, event_code: crate::global::EventCode, topic: Option<&str>, payload: &[u8], force_update: bool) -> bool {
        if !self.flags.contains(ObjectFlags::EVENT_CACHE_ENABLED) {
            return true;
        }
        self.cache.update(event_code, topic, payload.to_vec(), force_update)
    }

    pub fn cached_event(&self, event_code: crate::global::EventCode, topic: Option<&str>) -> Option<&[u8]> {
        self.cache.get(event_code, topic)
    }

    /// Every cached event in insertion order, used to replay an object's
    /// cache to a freshly subscribed session (spec.md §4.4 "Event cache").
    pub fn cache_entries_in_order(&self) -> Vec<(crate::global::EventCode, Option<String>, &[u8])> {
        self.cache.entries_in_order()
    }

    fn run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.worker {
            Some(worker) => worker.post(f),
            None => f(),
        }
    }

    pub fn dispatch_invoke(&mut self, msg: Message) {
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_invoke(&msg));
    }

    pub fn dispatch_reply(&mut self, msg: Message) {
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_reply(&msg));
    }

    pub fn dispatch_broadcast(&mut self, msg: Message) {
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_broadcast(&msg));
    }

    pub fn dispatch_online(&mut self, session: SessionId, is_first: bool) {
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_online(session, is_first));
    }

    pub fn dispatch_offline(&mut self, session: SessionId) {
        self.subscriptions.remove_session(session);
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_offline(session));
    }

    pub fn dispatch_get_event(&mut self, msg: Message) {
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_get_event(&msg));
    }

    pub fn dispatch_status(&mut self, msg: Message) {
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_status(&msg));
    }

    /// A watchdog-enabled object missed too many kicks from `session`
    /// (spec.md §4.6 "Watchdog"); the object decides whether to drop it.
    pub fn dispatch_bark(&mut self, session: SessionId) {
        let cb = self.callback.clone();
        self.run(move || cb.lock().unwrap().on_bark(session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        invokes: Arc<AtomicUsize>,
    }

    impl FdbusObject for Counting {
        fn on_invoke(&mut self, _msg: &Message) {
            self.invokes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_invoke_reaches_the_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut obj = Object::new(0, Box::new(Counting { invokes: count.clone() }), ObjectFlags::empty());
        let msg = Message::new_request(0, 1, vec![]);
        obj.dispatch_invoke(msg);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_runs_on_the_bound_worker_when_set() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut obj = Object::new(0, Box::new(Counting { invokes: count.clone() }), ObjectFlags::empty());
        let worker = Arc::new(Worker::spawn("obj-worker"));
        obj.set_worker(worker.clone());
        obj.dispatch_invoke(Message::new_request(0, 1, vec![]));
        drop(obj);
        drop(worker);
        // Worker::drop flushes its queue before returning (and was just
        // dropped by its last Arc owner above), so the count is guaranteed
        // to have been incremented by the time we get here.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_cache_suppresses_repeated_identical_broadcast() {
        let mut obj = Object::new(0, Box::new(Counting { invokes: Arc::new(AtomicUsize::new(0)) }), ObjectFlags::EVENT_CACHE_ENABLED);
        assert!(obj.should_broadcast(10, None, b"v1", false));
        assert!(!obj.should_broadcast(10, None, b"v1", false));
        assert!(obj.should_broadcast(10, None, b"v1", true));
        assert_eq!(obj.cached_event(10, None), Some(&b"v1"[..]));
    }

    #[test]
    fn uncached_object_always_broadcasts() {
        let mut obj = Object::new(0, Box::new(Counting { invokes: Arc::new(AtomicUsize::new(0)) }), ObjectFlags::empty());
        assert!(obj.should_broadcast(10, None, b"v1", false));
        assert!(obj.should_broadcast(10, None, b"v1", false));
    }

    #[test]
    fn offline_clears_that_sessions_subscriptions() {
        let mut obj = Object::new(0, Box::new(Counting { invokes: Arc::new(AtomicUsize::new(0)) }), ObjectFlags::empty());
        let item = SubscribeItem::new(10, None);
        obj.subscriptions_mut().subscribe(7, &item);
        obj.dispatch_offline(7);
        assert!(obj.subscriptions_mut().subscribers_for(10, None).is_empty());
    }
}
