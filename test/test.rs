// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! End-to-end coverage of the public bus API: two endpoints on the same
//! runtime, talking over a real Unix-domain socket.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fdbus::global::{make_event_code, make_event_group, OBJECT_MAIN};
use fdbus::object::ObjectFlags;
use fdbus::{EndpointRole, EventCode, FdbusObject, Message, MsgCode, Runtime, SessionId, StatusCode, SubscribeItem};

const CODE_ECHO: MsgCode = 1;
const CODE_SILENT: MsgCode = 2;
const EVENT_A: EventCode = 100;

fn unique_ipc_url(dir: &tempfile::TempDir, name: &str) -> String {
    format!("ipc://{}/{name}.sock", dir.path().display())
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

type BroadcastLog = Arc<Mutex<Vec<(EventCode, Option<String>, Vec<u8>)>>>;
type StatusLog = Arc<Mutex<Vec<StatusCode>>>;

/// Client-side main object: records the session id handed to it by
/// `on_online`, every broadcast it receives, and every async `on_status`
/// termination (e.g. a peer-vanished invoke), so tests can assert on
/// ordering and on callback delivery without polling the wire directly.
struct ClientProbe {
    session: Arc<Mutex<Option<SessionId>>>,
    broadcasts: BroadcastLog,
    statuses: StatusLog,
}

impl FdbusObject for ClientProbe {
    fn on_online(&mut self, session: SessionId, _is_first: bool) {
        *self.session.lock().unwrap() = Some(session);
    }

    fn on_offline(&mut self, _session: SessionId) {
        *self.session.lock().unwrap() = None;
    }

    fn on_broadcast(&mut self, msg: &Message) {
        self.broadcasts.lock().unwrap().push((msg.code(), msg.topic().map(str::to_owned), msg.payload()));
    }

    fn on_status(&mut self, msg: &Message) {
        if let Some((code, _)) = msg.decode_status() {
            self.statuses.lock().unwrap().push(code);
        }
    }
}

/// Server-side main object: echoes `CODE_ECHO` back verbatim, and never
/// replies to `CODE_SILENT`, giving tests a predictable way to exercise
/// timeout and peer-vanish paths.
struct EchoServer;

impl FdbusObject for EchoServer {
    fn on_invoke(&mut self, msg: &Message) {
        if msg.code() == CODE_ECHO {
            msg.reply(msg.payload());
        }
        // CODE_SILENT and anything else: deliberately left unanswered.
    }
}

fn setup(
    dir: &tempfile::TempDir,
    name: &str,
    server_obj: Box<dyn FdbusObject>,
    server_flags: ObjectFlags,
) -> (Runtime, fdbus::Endpoint, fdbus::Endpoint, SessionId, BroadcastLog, StatusLog) {
    let runtime = Runtime::start().unwrap();

    let server = runtime.create_endpoint(format!("{name}-server"), EndpointRole::Server).unwrap();
    server.set_main_object(server_obj, server_flags).unwrap();
    let url = unique_ipc_url(dir, name);
    server.bind(url.clone()).unwrap();

    let session = Arc::new(Mutex::new(None));
    let broadcasts: BroadcastLog = Arc::new(Mutex::new(Vec::new()));
    let statuses: StatusLog = Arc::new(Mutex::new(Vec::new()));
    let client = runtime.create_endpoint(format!("{name}-client"), EndpointRole::Client).unwrap();
    client
        .set_main_object(
            Box::new(ClientProbe { session: session.clone(), broadcasts: broadcasts.clone(), statuses: statuses.clone() }),
            ObjectFlags::empty(),
        )
        .unwrap();
    client.connect(url, true).unwrap();

    assert!(wait_until(Duration::from_secs(2), || session.lock().unwrap().is_some()), "client never came online");
    let sid = session.lock().unwrap().unwrap();
    (runtime, server, client, sid, broadcasts, statuses)
}

#[test]
fn invoke_reply_roundtrip() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, _server, client, sid, _broadcasts, _statuses) = setup(&dir, "echo", Box::new(EchoServer), ObjectFlags::empty());

    let reply = client.invoke(sid, OBJECT_MAIN, CODE_ECHO, b"hello".to_vec(), 2000).unwrap();
    assert!(reply.is_terminated());
    assert!(!reply.is_status());
    assert_eq!(reply.payload(), b"hello");
}

#[test]
fn invoke_without_reply_times_out() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, _server, client, sid, _broadcasts, _statuses) = setup(&dir, "silent", Box::new(EchoServer), ObjectFlags::empty());

    let reply = client.invoke(sid, OBJECT_MAIN, CODE_SILENT, vec![], 150).unwrap();
    assert!(reply.is_terminated());
    assert!(reply.is_status());
    assert_eq!(reply.decode_status().unwrap().0, StatusCode::Timeout);
}

#[test]
fn destroying_the_server_endpoint_drains_pending_invokes_with_peer_vanish() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, server, client, sid, _broadcasts, statuses) = setup(&dir, "vanish", Box::new(EchoServer), ObjectFlags::empty());

    let pending: Vec<Message> = (0..3)
        .map(|i| client.invoke_async(sid, OBJECT_MAIN, CODE_SILENT, vec![i], 0).unwrap())
        .collect();
    // Let the requests actually reach the server's session before it is torn down.
    std::thread::sleep(Duration::from_millis(50));
    server.destroy().unwrap();

    for msg in &pending {
        assert!(msg.wait(Some(Duration::from_secs(2))), "message never terminated after peer vanished");
        assert!(msg.is_status());
        assert_eq!(msg.decode_status().unwrap().0, StatusCode::PeerVanish);
    }

    // `Message::wait` only proves the waiter woke up; the object's own
    // `on_status` callback (what a real caller without a waiter relies on)
    // must fire once per peer-vanished invoke too.
    assert!(wait_until(Duration::from_secs(2), || statuses.lock().unwrap().len() == 3));
    assert!(statuses.lock().unwrap().iter().all(|s| *s == StatusCode::PeerVanish));
}

#[test]
fn subscribe_replays_cached_value_before_the_subscribe_status() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, server, client, sid, broadcasts, _statuses) =
        setup(&dir, "cache", Box::new(EchoServer), ObjectFlags::EVENT_CACHE_ENABLED);

    server.broadcast(OBJECT_MAIN, EVENT_A, None, b"cached-value".to_vec(), false).unwrap();
    // No subscribers exist yet; this only primes the object's event cache.
    std::thread::sleep(Duration::from_millis(50));

    let status = client.subscribe(sid, OBJECT_MAIN, vec![SubscribeItem::new(EVENT_A, None)], 2000).unwrap();
    assert!(status.is_status());
    assert_eq!(status.decode_status().unwrap().0, StatusCode::SubscribeOk);

    let got = broadcasts.lock().unwrap();
    assert_eq!(got.len(), 1, "expected exactly the replayed cache entry, got {got:?}");
    assert_eq!(got[0].0, EVENT_A);
    assert_eq!(got[0].2, b"cached-value");
}

#[test]
fn force_update_suppresses_duplicate_broadcasts_unless_forced() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, server, client, sid, broadcasts, _statuses) =
        setup(&dir, "suppress", Box::new(EchoServer), ObjectFlags::EVENT_CACHE_ENABLED);

    let status = client.subscribe(sid, OBJECT_MAIN, vec![SubscribeItem::new(EVENT_A, None)], 2000).unwrap();
    assert_eq!(status.decode_status().unwrap().0, StatusCode::SubscribeOk);

    server.broadcast(OBJECT_MAIN, EVENT_A, None, b"same".to_vec(), false).unwrap();
    server.broadcast(OBJECT_MAIN, EVENT_A, None, b"same".to_vec(), false).unwrap();
    assert!(wait_until(Duration::from_secs(2), || broadcasts.lock().unwrap().len() >= 1));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(broadcasts.lock().unwrap().len(), 1, "duplicate unchanged broadcast should have been suppressed");

    server.broadcast(OBJECT_MAIN, EVENT_A, None, b"same".to_vec(), true).unwrap();
    assert!(wait_until(Duration::from_secs(2), || broadcasts.lock().unwrap().len() == 2));
}

#[test]
fn group_subscription_receives_every_event_in_the_group() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, server, client, sid, broadcasts, _statuses) = setup(&dir, "group", Box::new(EchoServer), ObjectFlags::empty());

    let group = make_event_group(3);
    let status = client.subscribe(sid, OBJECT_MAIN, vec![SubscribeItem::new(group, None)], 2000).unwrap();
    assert_eq!(status.decode_status().unwrap().0, StatusCode::SubscribeOk);

    let event_one = make_event_code(3, 1);
    let event_two = make_event_code(3, 2);
    server.broadcast(OBJECT_MAIN, event_one, None, b"one".to_vec(), false).unwrap();
    server.broadcast(OBJECT_MAIN, event_two, None, b"two".to_vec(), false).unwrap();

    assert!(wait_until(Duration::from_secs(2), || broadcasts.lock().unwrap().len() == 2));
    let got = broadcasts.lock().unwrap();
    assert!(got.iter().any(|(code, _, payload)| *code == event_one && payload == b"one"));
    assert!(got.iter().any(|(code, _, payload)| *code == event_two && payload == b"two"));
}

#[test]
fn topicless_subscriber_receives_broadcasts_on_any_topic() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (_runtime, server, client, sid, broadcasts, _statuses) = setup(&dir, "topic", Box::new(EchoServer), ObjectFlags::empty());

    // spec.md §4.4: "the exact table for matches on `code` and optionally
    // `topic` (empty topic means 'match any topic')". Subscribing with no
    // topic must still receive live broadcasts published on a concrete topic.
    let status = client.subscribe(sid, OBJECT_MAIN, vec![SubscribeItem::new(EVENT_A, None)], 2000).unwrap();
    assert_eq!(status.decode_status().unwrap().0, StatusCode::SubscribeOk);

    server.broadcast(OBJECT_MAIN, EVENT_A, Some("t".to_string()), b"on-topic".to_vec(), false).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !broadcasts.lock().unwrap().is_empty()));

    let got = broadcasts.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, EVENT_A);
    assert_eq!(got[0].1.as_deref(), Some("t"));
    assert_eq!(got[0].2, b"on-topic");
}
