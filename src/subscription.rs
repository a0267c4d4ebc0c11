// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Subscribe/broadcast bookkeeping for one object (spec.md §4.4): who is
//! registered for which `(event_code, topic)`, and, if event caching is
//! enabled, the last value broadcast for each key so a new subscriber gets
//! an immediate reply instead of waiting for the next update.

use std::collections::{HashMap, HashSet};
use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::global::{is_group_code, EventCode, SessionId};

/// "Normal" subscriptions (spec.md §3 "Subscription record") receive every
/// broadcast matching their key; "on-request" ones only replay when the
/// client issues an explicit `update` trigger.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionType {
    Normal,
    OnRequest,
}

impl SubscriptionType {
    fn to_u8(self) -> u8 {
        match self {
            SubscriptionType::Normal => 0,
            SubscriptionType::OnRequest => 1,
        }
    }

    fn from_u8(v: u8) -> SubscriptionType {
        match v {
            1 => SubscriptionType::OnRequest,
            _ => SubscriptionType::Normal,
        }
    }
}

/// One `subscribe`/`unsubscribe` request line: a single event code (which
/// may itself be a group-wildcard, see [`is_group_code`]) and an optional
/// topic narrowing it further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeItem {
    pub event_code: EventCode,
    pub topic: Option<String>,
    pub sub_type: SubscriptionType,
}

impl SubscribeItem {
    pub fn new(event_code: EventCode, topic: Option<String>) -> SubscribeItem {
        SubscribeItem { event_code, topic, sub_type: SubscriptionType::Normal }
    }

    pub fn on_request(event_code: EventCode, topic: Option<String>) -> SubscribeItem {
        SubscribeItem { event_code, topic, sub_type: SubscriptionType::OnRequest }
    }

    fn is_group(&self) -> bool {
        is_group_code(self.event_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    event_code: EventCode,
    topic: Option<String>,
}

/// Who is listening, keyed by `(event_code, topic)`. A subscription to a
/// group-wildcard event code is stored exactly like any other key; matching
/// a concrete broadcast against both its own key and its group's wildcard
/// key is the caller's job (see [`SubscriptionTable::subscribers_for`]).
#[derive(Default)]
pub struct SubscriptionTable {
    subscribers: HashMap<Key, HashMap<SessionId, SubscriptionType>>,
}

impl SubscriptionTable {
    pub fn new() -> SubscriptionTable {
        SubscriptionTable::default()
    }

    pub fn subscribe(&mut self, session: SessionId, item: &SubscribeItem) {
        let key = Key { event_code: item.event_code, topic: item.topic.clone() };
        self.subscribers.entry(key).or_default().insert(session, item.sub_type);
    }

    pub fn unsubscribe(&mut self, session: SessionId, item: &SubscribeItem) {
        let key = Key { event_code: item.event_code, topic: item.topic.clone() };
        if let Some(map) = self.subscribers.get_mut(&key) {
            map.remove(&session);
            if map.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    /// Drops every registration a session holds, e.g. on disconnect.
    pub fn remove_session(&mut self, session: SessionId) {
        self.subscribers.retain(|_, map| {
            map.remove(&session);
            !map.is_empty()
        });
    }

    fn matching(&self, event_code: EventCode, topic: Option<&str>) -> HashMap<SessionId, SubscriptionType> {
        let mut out = HashMap::new();
        let mut probe = |code: EventCode| {
            let exact = Key { event_code: code, topic: topic.map(str::to_owned) };
            if let Some(map) = self.subscribers.get(&exact) {
                out.extend(map.iter().map(|(s, t)| (*s, *t)));
            }
            // spec.md §4.4: a subscription with no topic matches any topic.
            if topic.is_some() {
                let wildcard = Key { event_code: code, topic: None };
                if let Some(map) = self.subscribers.get(&wildcard) {
                    out.extend(map.iter().map(|(s, t)| (*s, *t)));
                }
            }
        };
        probe(event_code);
        let group = crate::global::make_event_group(crate::global::event_group(event_code));
        if group != event_code {
            probe(group);
        }
        out
    }

    /// Sessions that should receive a spontaneous broadcast of
    /// `event_code`/`topic`: normal-type subscribers only (spec.md §4.4
    /// "Normal vs on-request").
    pub fn subscribers_for(&self, event_code: EventCode, topic: Option<&str>) -> HashSet<SessionId> {
        self.matching(event_code, topic)
            .into_iter()
            .filter(|(_, t)| *t == SubscriptionType::Normal)
            .map(|(s, _)| s)
            .collect()
    }

    /// Every subscriber regardless of type, used for cache replay to a new
    /// subscriber and for explicit `update`-trigger replay.
    pub fn all_subscribers_for(&self, event_code: EventCode, topic: Option<&str>) -> HashSet<SessionId> {
        self.matching(event_code, topic).into_keys().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// Last-value cache for events whose object has event caching enabled
/// (spec.md §4.4 "Event cache"): a new subscriber is replayed the cached
/// value immediately rather than waiting for the next broadcast.
#[derive(Default)]
pub struct EventCache {
    entries: HashMap<Key, Vec<u8>>,
    order: Vec<Key>,
}

impl EventCache {
    pub fn new() -> EventCache {
        EventCache::default()
    }

    /// Records `payload` as the latest value for `event_code`/`topic`.
    /// `force_update` (spec.md's `FORCE_UPDATE` flag) stores even when the
    /// value is identical to what's cached, so manual-update objects can
    /// still fan out a redundant broadcast when asked to.
    pub fn update(&mut self, event_code: EventCode, topic: Option<&str>, payload: Vec<u8>, force_update: bool) -> bool {
        let key = Key { event_code, topic: topic.map(str::to_owned) };
        match self.entries.get(&key) {
            Some(existing) if existing == &payload && !force_update => false,
            _ => {
                if !self.entries.contains_key(&key) {
                    self.order.push(key.clone());
                }
                self.entries.insert(key, payload);
                true
            }
        }
    }

    pub fn get(&self, event_code: EventCode, topic: Option<&str>) -> Option<&[u8]> {
        let key = Key { event_code, topic: topic.map(str::to_owned) };
        self.entries.get(&key).map(Vec::as_slice)
    }

    /// Every cached `(event_code, topic, bytes)` in insertion order (spec.md
    /// §4.4 "replayed ... in insertion order").
    pub fn entries_in_order(&self) -> Vec<(EventCode, Option<String>, &[u8])> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|bytes| (key.event_code, key.topic.clone(), bytes.as_slice())))
            .collect()
    }
}

/// Whether a single subscribe-list entry covers `event_code`/`topic`,
/// honoring group wildcards the same way [`SubscriptionTable`] does. Used to
/// decide which cached entries get replayed to a freshly subscribed session.
pub fn item_matches(item: &SubscribeItem, event_code: EventCode, topic: Option<&str>) -> bool {
    let code_matches = if item.is_group() {
        crate::global::event_group(item.event_code) == crate::global::event_group(event_code)
    } else {
        item.event_code == event_code
    };
    if !code_matches {
        return false;
    }
    match item.topic.as_deref() {
        None => true,
        Some(t) => topic == Some(t),
    }
}

/// Wire encoding for a subscribe/unsubscribe request's body (spec.md §4.3
/// "Subscribe": "a subscribe message carries a list of `(code, topic,
/// type)`"): `count: u16`, then per item `event_code: i32`, `sub_type: u8`,
/// `topic_len: u16`, topic bytes.
pub fn encode_subscribe_list(items: &[SubscribeItem]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u16::<LittleEndian>(items.len() as u16)?;
    for item in items {
        buf.write_i32::<LittleEndian>(item.event_code)?;
        buf.write_u8(item.sub_type.to_u8())?;
        let topic = item.topic.as_deref().unwrap_or("");
        buf.write_u16::<LittleEndian>(topic.len() as u16)?;
        buf.extend_from_slice(topic.as_bytes());
    }
    Ok(buf)
}

pub fn decode_subscribe_list(bytes: &[u8]) -> io::Result<Vec<SubscribeItem>> {
    let mut cur = io::Cursor::new(bytes);
    let count = cur.read_u16::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let event_code = cur.read_i32::<LittleEndian>()?;
        let sub_type = SubscriptionType::from_u8(cur.read_u8()?);
        let topic_len = cur.read_u16::<LittleEndian>()? as usize;
        let mut topic_bytes = vec![0u8; topic_len];
        io::Read::read_exact(&mut cur, &mut topic_bytes)?;
        let topic = if topic_bytes.is_empty() { None } else { Some(String::from_utf8_lossy(&topic_bytes).into_owned()) };
        out.push(SubscribeItem { event_code, topic, sub_type });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::make_event_group;

    #[test]
    fn exact_subscriber_receives_matching_broadcast() {
        let mut table = SubscriptionTable::new();
        table.subscribe(1, &SubscribeItem::new(10, None));
        assert_eq!(table.subscribers_for(10, None), [1].into_iter().collect());
        assert!(table.subscribers_for(11, None).is_empty());
    }

    #[test]
    fn group_subscriber_receives_any_event_in_group() {
        let mut table = SubscriptionTable::new();
        let group = make_event_group(3);
        table.subscribe(2, &SubscribeItem::new(group, None));

        let event_in_group = crate::global::make_event_code(3, 99);
        assert!(table.subscribers_for(event_in_group, None).contains(&2));
    }

    #[test]
    fn unsubscribe_removes_only_that_session() {
        let mut table = SubscriptionTable::new();
        let item = SubscribeItem::new(10, None);
        table.subscribe(1, &item);
        table.subscribe(2, &item);
        table.unsubscribe(1, &item);

        let subs = table.subscribers_for(10, None);
        assert!(!subs.contains(&1));
        assert!(subs.contains(&2));
    }

    #[test]
    fn remove_session_drops_all_of_its_subscriptions() {
        let mut table = SubscriptionTable::new();
        table.subscribe(1, &SubscribeItem::new(10, None));
        table.subscribe(1, &SubscribeItem::new(20, Some("t".into())));
        table.remove_session(1);
        assert!(table.is_empty());
    }

    #[test]
    fn on_request_subscriber_is_excluded_from_spontaneous_broadcast() {
        let mut table = SubscriptionTable::new();
        table.subscribe(1, &SubscribeItem::on_request(10, None));
        assert!(table.subscribers_for(10, None).is_empty());
        assert!(table.all_subscribers_for(10, None).contains(&1));
    }

    #[test]
    fn cache_suppresses_unchanged_update_unless_forced() {
        let mut cache = EventCache::new();
        assert!(cache.update(10, None, b"a".to_vec(), false));
        assert!(!cache.update(10, None, b"a".to_vec(), false));
        assert!(cache.update(10, None, b"a".to_vec(), true));
        assert_eq!(cache.get(10, None), Some(&b"a"[..]));
    }

    #[test]
    fn cache_replays_entries_in_insertion_order() {
        let mut cache = EventCache::new();
        cache.update(20, None, b"second-key-first-value".to_vec(), false);
        cache.update(10, Some("t"), b"first-key-first-value".to_vec(), false);
        cache.update(20, None, b"second-key-second-value".to_vec(), false);
        let entries = cache.entries_in_order();
        assert_eq!(entries[0].0, 20);
        assert_eq!(entries[0].2, b"second-key-second-value");
        assert_eq!(entries[1].0, 10);
    }

    #[test]
    fn item_matches_respects_group_wildcards_and_topic() {
        let group = make_event_group(3);
        let item = SubscribeItem::new(group, Some("t".into()));
        assert!(item_matches(&item, crate::global::make_event_code(3, 7), Some("t")));
        assert!(!item_matches(&item, crate::global::make_event_code(3, 7), Some("other")));
        assert!(!item_matches(&item, crate::global::make_event_code(4, 7), Some("t")));
    }

    #[test]
    fn subscribe_list_round_trips() {
        let items = vec![
            SubscribeItem::new(10, None),
            SubscribeItem::new(20, Some("topic".into())),
            SubscribeItem::on_request(30, Some("t2".into())),
        ];
        let bytes = encode_subscribe_list(&items).unwrap();
        let decoded = decode_subscribe_list(&bytes).unwrap();
        assert_eq!(decoded, items);
    }
}
