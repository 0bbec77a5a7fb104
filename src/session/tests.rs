//! Session tests

use super::*;
use crate::protocol::Properties;
use pretty_assertions::assert_eq;

fn message(topic: &str, payload: &str, qos: QoS) -> QueuedMessage {
    QueuedMessage::new(Publish::new(topic, payload.to_string(), qos), Instant::now())
}

fn attached(receive_maximum: u16) -> (Session, mpsc::UnboundedReceiver<Packet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = Session::new("c1".into(), 0);
    session.attach(SessionLink::new(1, tx, 0), receive_maximum);
    (session, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<Packet> {
    let mut out = Vec::new();
    while let Ok(p) = rx.try_recv() {
        out.push(p);
    }
    out
}

fn payloads(packets: &[Packet]) -> Vec<String> {
    packets
        .iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(String::from_utf8_lossy(&p.payload).to_string()),
            _ => None,
        })
        .collect()
}

fn packet_ids(packets: &[Packet]) -> Vec<u16> {
    packets
        .iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => p.packet_id,
            _ => None,
        })
        .collect()
}

#[test]
fn test_subscribe_reports_new() {
    let mut session = Session::new("c1".into(), 0);
    let opts = SubscriptionOptions::new(QoS::AtLeastOnce);
    assert!(session.subscribe("a/b", opts, None));
    assert!(!session.subscribe("a/b", opts.with_no_local(true), Some(4)));
    assert_eq!(session.subscriptions().count(), 1);
    assert_eq!(session.subscriptions["a/b"].subscription_id, Some(4));

    assert!(session.unsubscribe("a/b"));
    assert!(!session.unsubscribe("a/b"));
    assert!(session.subscribe("a/b", opts, None), "resubscribe after unsubscribe is new");
}

#[test]
fn test_offline_messages_are_queued() {
    let mut session = Session::new("c1".into(), 0);
    let now = Instant::now();
    assert_eq!(session.admit(message("t", "0", QoS::AtMostOnce), now), Admission::Queued);
    assert_eq!(session.admit(message("t", "1", QoS::AtLeastOnce), now), Admission::Queued);
    assert_eq!(session.queue_len(), 2);
    assert!(session.dirty);
}

#[test]
fn test_queue_bound_drops_oldest() {
    let mut session = Session::new("c1".into(), 2);
    let now = Instant::now();
    for i in 0..3 {
        session.admit(message("t", &i.to_string(), QoS::AtLeastOnce), now);
    }
    let kept: Vec<String> = session
        .queued()
        .map(|m| String::from_utf8_lossy(&m.publish.payload).to_string())
        .collect();
    assert_eq!(kept, vec!["1", "2"]);
}

#[test]
fn test_window_limits_inflight() {
    let (mut session, mut rx) = attached(2);
    let now = Instant::now();

    for i in 0..5 {
        session.admit(message("t", &i.to_string(), QoS::AtLeastOnce), now);
    }
    let sent = drain(&mut rx);
    assert_eq!(payloads(&sent), vec!["0", "1"]);
    assert_eq!(session.window().len(), 2);
    assert_eq!(session.queue_len(), 3);

    let first = packet_ids(&sent)[0];
    assert!(session.acknowledge(first, now));
    assert_eq!(payloads(&drain(&mut rx)), vec!["2"]);
    assert_eq!(session.window().len(), 2);
}

#[test]
fn test_qos0_bypasses_window() {
    let (mut session, mut rx) = attached(1);
    let now = Instant::now();

    session.admit(message("t", "a", QoS::AtLeastOnce), now);
    session.admit(message("t", "b", QoS::AtLeastOnce), now);
    session.admit(message("t", "c", QoS::AtMostOnce), now);

    assert_eq!(payloads(&drain(&mut rx)), vec!["a", "c"]);
    assert_eq!(session.queue_len(), 1);
}

#[test]
fn test_qos2_release_frees_slot_on_pubcomp() {
    let (mut session, mut rx) = attached(1);
    let now = Instant::now();

    session.admit(message("t", "a", QoS::ExactlyOnce), now);
    session.admit(message("t", "b", QoS::ExactlyOnce), now);
    let id = packet_ids(&drain(&mut rx))[0];

    assert!(session.received(id, false, now));
    assert!(drain(&mut rx).is_empty(), "PUBREC does not free the slot");
    assert!(!session.acknowledge(id, now));
    assert!(session.complete(id, now));
    assert_eq!(payloads(&drain(&mut rx)), vec!["b"]);
}

#[test]
fn test_refused_pubrec_frees_slot() {
    let (mut session, mut rx) = attached(1);
    let now = Instant::now();

    session.admit(message("t", "a", QoS::ExactlyOnce), now);
    session.admit(message("t", "b", QoS::ExactlyOnce), now);
    let id = packet_ids(&drain(&mut rx))[0];

    assert!(session.received(id, true, now));
    assert_eq!(payloads(&drain(&mut rx)), vec!["b"]);
}

#[test]
fn test_resume_resends_inflight_then_queue() {
    let (mut session, mut rx) = attached(2);
    let now = Instant::now();

    for i in 0..4 {
        session.admit(message("t", &i.to_string(), QoS::AtLeastOnce), now);
    }
    let first = drain(&mut rx);
    session.acknowledge(packet_ids(&first)[0], now);
    drain(&mut rx);

    session.detach(now);
    session.admit(message("t", "4", QoS::AtLeastOnce), now);

    let (tx, mut rx2) = mpsc::unbounded_channel();
    session.attach(SessionLink::new(2, tx, 0), 10);
    session.resume(now);

    let packets = drain(&mut rx2);
    assert_eq!(payloads(&packets), vec!["1", "2", "3", "4"]);
    let dups: Vec<bool> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(p.dup),
            _ => None,
        })
        .collect();
    assert_eq!(dups, vec![true, true, false, false]);
}

#[test]
fn test_resume_resends_pubrel() {
    let (mut session, mut rx) = attached(10);
    let now = Instant::now();

    session.admit(message("t", "a", QoS::ExactlyOnce), now);
    let id = packet_ids(&drain(&mut rx))[0];
    session.received(id, false, now);
    session.detach(now);

    let (tx, mut rx2) = mpsc::unbounded_channel();
    session.attach(SessionLink::new(2, tx, 0), 10);
    session.resume(now);
    assert_eq!(drain(&mut rx2), vec![Packet::PubRel(PubRel::new(id))]);
}

#[test]
fn test_resume_respects_smaller_receive_maximum() {
    let (mut session, mut rx) = attached(5);
    let now = Instant::now();

    for i in 0..5 {
        session.admit(message("t", &i.to_string(), QoS::AtLeastOnce), now);
    }
    assert_eq!(drain(&mut rx).len(), 5);
    session.detach(now);

    let (tx, mut rx2) = mpsc::unbounded_channel();
    session.attach(SessionLink::new(2, tx, 0), 2);
    session.resume(now);

    let resent = drain(&mut rx2);
    assert_eq!(payloads(&resent), vec!["0", "1"]);
    assert_eq!(session.window().on_wire(), 2);

    let mut delivered = Vec::new();
    let mut outstanding = resent;
    while !outstanding.is_empty() {
        delivered.extend(payloads(&outstanding));
        for id in packet_ids(&outstanding) {
            session.acknowledge(id, now);
            assert!(session.window().on_wire() <= 2);
        }
        outstanding = drain(&mut rx2);
    }
    assert_eq!(delivered, vec!["0", "1", "2", "3", "4"]);
    assert!(session.window().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resume_recomputes_inflight_expiry() {
    let (mut session, mut rx) = attached(10);
    let start = Instant::now();

    let mut short = Publish::new("t", "short", QoS::AtLeastOnce);
    short.properties.message_expiry_interval = Some(2);
    let mut long = Publish::new("t", "long", QoS::AtLeastOnce);
    long.properties.message_expiry_interval = Some(10);
    session.admit(QueuedMessage::new(short, start), start);
    session.admit(QueuedMessage::new(long, start), start);
    assert_eq!(drain(&mut rx).len(), 2);
    session.detach(start);

    tokio::time::advance(Duration::from_secs(4)).await;
    let now = Instant::now();
    let (tx, mut rx2) = mpsc::unbounded_channel();
    session.attach(SessionLink::new(2, tx, 0), 10);
    session.resume(now);

    let packets = drain(&mut rx2);
    assert_eq!(payloads(&packets), vec!["long"]);
    match &packets[0] {
        Packet::Publish(p) => {
            assert!(p.dup);
            assert_eq!(p.properties.message_expiry_interval, Some(6));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.window().len(), 1, "expired entry leaves the window");
}

#[tokio::test(start_paused = true)]
async fn test_queued_message_expiry() {
    let mut session = Session::new("c1".into(), 0);
    let start = Instant::now();

    let mut short = Publish::new("t", "short", QoS::AtLeastOnce);
    short.properties.message_expiry_interval = Some(2);
    let mut long = Publish::new("t", "long", QoS::AtLeastOnce);
    long.properties.message_expiry_interval = Some(10);

    session.admit(QueuedMessage::new(short, start), start);
    session.admit(QueuedMessage::new(long, start), start);

    tokio::time::advance(Duration::from_secs(3)).await;
    let now = Instant::now();

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.attach(SessionLink::new(1, tx, 0), 10);
    session.resume(now);

    let packets = drain(&mut rx);
    assert_eq!(payloads(&packets), vec!["long"]);
    match &packets[0] {
        Packet::Publish(p) => assert_eq!(p.properties.message_expiry_interval, Some(7)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry() {
    let mut session = Session::new("c1".into(), 0);
    session.session_expiry_interval = 5;
    session.detach(Instant::now());
    assert!(!session.is_expired(Instant::now()));

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(session.is_expired(Instant::now()));

    session.session_expiry_interval = NEVER_EXPIRE;
    assert!(!session.is_expired(Instant::now()));
}

#[test]
fn test_remaining_expiry_rounding() {
    let start = Instant::now();
    assert_eq!(remaining_expiry(None, start, start), None);
    assert_eq!(remaining_expiry(Some(10), start, start), Some(10));
    assert_eq!(
        remaining_expiry(Some(10), start, start + Duration::from_millis(2500)),
        Some(8)
    );
    assert_eq!(remaining_expiry(Some(2), start, start + Duration::from_secs(3)), Some(0));
}

#[test]
fn test_outbound_keeps_properties() {
    let mut publish = Publish::new("t", "x", QoS::AtMostOnce);
    publish.properties = Properties {
        content_type: Some("text/plain".into()),
        ..Properties::default()
    };
    let out = QueuedMessage::new(publish, Instant::now())
        .outbound(Instant::now())
        .unwrap();
    assert_eq!(out.properties.content_type.as_deref(), Some("text/plain"));
    assert_eq!(out.properties.message_expiry_interval, None);
}

#[test]
fn test_store_open_resume_and_clean_start() {
    let store = SessionStore::new(0);
    let id: Arc<str> = "c1".into();
    let now = Instant::now();

    let first = store.open(&id, false, now);
    assert!(!first.present);
    {
        let mut s = first.session.write();
        s.session_expiry_interval = 60;
        s.detach(now);
    }

    let resumed = store.open(&id, false, now);
    assert!(resumed.present);
    assert!(Arc::ptr_eq(&resumed.session, &first.session));

    let clean = store.open(&id, true, now);
    assert!(!clean.present);
    assert!(clean
        .discarded
        .as_ref()
        .is_some_and(|old| Arc::ptr_eq(old, &first.session)));
    assert_eq!(store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_expire() {
    let store = SessionStore::new(0);
    let id: Arc<str> = "c1".into();

    let opened = store.open(&id, false, Instant::now());
    {
        let mut s = opened.session.write();
        s.session_expiry_interval = 1;
        s.detach(Instant::now());
    }
    assert!(store.expire(Instant::now()).is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    let expired = store.expire(Instant::now());
    assert_eq!(expired.len(), 1);
    assert!(store.is_empty());

    let reopened = store.open(&id, false, Instant::now());
    assert!(!reopened.present);
}

#[test]
fn test_remove_if_current_ignores_replaced() {
    let store = SessionStore::new(0);
    let id: Arc<str> = "c1".into();
    let now = Instant::now();

    let old = store.open(&id, true, now).session;
    let new = store.open(&id, true, now).session;
    assert!(!store.remove_if_current("c1", &old));
    assert!(store.remove_if_current("c1", &new));
}
