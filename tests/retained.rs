//! Retained messages: replay on subscribe, expiry, clearing and the
//! Retain As Published option

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use common::*;
use driftmq::broker::{Broker, BrokerConfig, ClientLink};
use driftmq::protocol::{Publish, QoS, RetainHandling, SubscriptionOptions};

/// Subscribe without an identifier and return the retained replay
async fn subscribe_replay(
    link: &mut ClientLink,
    filter: &str,
    options: SubscriptionOptions,
) -> Vec<Publish> {
    publishes(subscribe_with_id(link, filter, options, None).await)
}

fn retained(topic: &str, payload: &str, qos: QoS, expiry: Option<u32>) -> Publish {
    let mut publish = publish(topic, payload, qos);
    publish.retain = true;
    publish.properties.message_expiry_interval = expiry;
    publish
}

#[tokio::test(start_paused = true)]
async fn test_expired_retained_message_not_replayed() {
    let broker = Broker::new(BrokerConfig::default());
    broker
        .publish(retained("status/m1", "m1", QoS::AtMostOnce, Some(2)))
        .await
        .unwrap();
    broker
        .publish(retained("status/m2", "m2", QoS::AtMostOnce, Some(10)))
        .await
        .unwrap();
    assert_eq!(broker.retained().len(), 2);

    tokio::time::advance(Duration::from_secs(4)).await;

    let mut sub = connect(&broker, "late").await;
    let replay = subscribe_replay(&mut sub, "status/#", SubscriptionOptions::default()).await;
    assert_eq!(payloads(&replay), vec!["m2"]);
    let remaining = replay[0].properties.message_expiry_interval.unwrap();
    assert!(remaining <= 6, "remaining expiry {} must count down", remaining);
    assert!(remaining > 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_removes_expired_retained() {
    let broker = Broker::new(BrokerConfig::default());
    broker
        .publish(retained("t/a", "a", QoS::AtMostOnce, Some(1)))
        .await
        .unwrap();
    broker.publish(retained("t/b", "b", QoS::AtMostOnce, None)).await.unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(broker.sweep().retained_expired, 1);
    assert_eq!(broker.retained().len(), 1);
    assert!(broker.retained().get("t/b", Instant::now()).is_some());
}

#[tokio::test]
async fn test_empty_payload_clears_retained() {
    let broker = Broker::new(BrokerConfig::default());
    broker.publish(retained("door", "open", QoS::AtMostOnce, None)).await.unwrap();
    assert_eq!(broker.retained().len(), 1);

    let mut live = connect(&broker, "live").await;
    let never = SubscriptionOptions::new(QoS::AtMostOnce)
        .with_retain_handling(RetainHandling::DoNotSend);
    subscribe_replay(&mut live, "door", never).await;

    broker.publish(retained("door", "", QoS::AtMostOnce, None)).await.unwrap();
    assert!(broker.retained().is_empty());
    assert_eq!(
        publishes(drain(&mut live)).len(),
        1,
        "the clearing publish is still delivered to live subscribers"
    );

    let mut late = connect(&broker, "late").await;
    let replay = subscribe_replay(&mut late, "door", SubscriptionOptions::default()).await;
    assert!(replay.is_empty());
}

#[tokio::test]
async fn test_newer_retained_replaces_older() {
    let broker = Broker::new(BrokerConfig::default());
    broker.publish(retained("v", "1", QoS::AtMostOnce, None)).await.unwrap();
    broker.publish(retained("v", "2", QoS::AtMostOnce, None)).await.unwrap();

    let mut sub = connect(&broker, "sub").await;
    let replay = subscribe_replay(&mut sub, "v", SubscriptionOptions::default()).await;
    assert_eq!(payloads(&replay), vec!["2"]);
}

#[tokio::test]
async fn test_retain_as_published() {
    let broker = Broker::new(BrokerConfig::default());
    broker.publish(retained("rap/stored", "s", QoS::AtMostOnce, None)).await.unwrap();

    let mut plain = connect(&broker, "plain").await;
    let mut rap = connect(&broker, "rap").await;
    let options = SubscriptionOptions::new(QoS::AtMostOnce);
    let replay_plain = subscribe_replay(&mut plain, "rap/#", options).await;
    let replay_rap =
        subscribe_replay(&mut rap, "rap/#", options.with_retain_as_published(true)).await;
    assert!(!replay_plain[0].retain);
    assert!(replay_rap[0].retain);

    broker.publish(retained("rap/live", "l", QoS::AtMostOnce, None)).await.unwrap();
    assert!(!publishes(drain(&mut plain))[0].retain);
    assert!(publishes(drain(&mut rap))[0].retain);
}

#[tokio::test]
async fn test_replay_can_keep_retain_flag() {
    let config = BrokerConfig {
        replay_keeps_retain_flag: true,
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config);
    broker.publish(retained("k", "k", QoS::AtMostOnce, None)).await.unwrap();

    let mut sub = connect(&broker, "sub").await;
    let replay = subscribe_replay(&mut sub, "k", SubscriptionOptions::new(QoS::AtMostOnce)).await;
    assert!(replay[0].retain);

    broker.publish(retained("k", "live", QoS::AtMostOnce, None)).await.unwrap();
    assert!(!publishes(drain(&mut sub))[0].retain, "live delivery still follows RAP");
}

#[tokio::test]
async fn test_replay_downgrades_qos() {
    let broker = Broker::new(BrokerConfig::default());
    broker.publish(retained("q", "q", QoS::ExactlyOnce, None)).await.unwrap();

    let mut sub = connect(&broker, "sub").await;
    let options = SubscriptionOptions::new(QoS::AtLeastOnce);
    let replay = subscribe_replay(&mut sub, "q", options).await;
    assert_eq!(replay[0].qos, QoS::AtLeastOnce);
    assert!(replay[0].packet_id.is_some());
}

#[tokio::test]
async fn test_dollar_topics_not_replayed_to_root_wildcard() {
    let broker = Broker::new(BrokerConfig::default());
    broker.publish(retained("$SYS/version", "1", QoS::AtMostOnce, None)).await.unwrap();
    broker.publish(retained("app/version", "2", QoS::AtMostOnce, None)).await.unwrap();

    let mut sub = connect(&broker, "sub").await;
    let replay = subscribe_replay(&mut sub, "#", SubscriptionOptions::default()).await;
    assert_eq!(payloads(&replay), vec!["2"]);
}

#[tokio::test]
async fn test_shared_subscription_gets_no_replay() {
    let broker = Broker::new(BrokerConfig::default());
    broker.publish(retained("jobs/1", "j", QoS::AtMostOnce, None)).await.unwrap();

    let mut worker = connect(&broker, "worker").await;
    let options = SubscriptionOptions::default();
    let replay = subscribe_replay(&mut worker, "$share/g/jobs/#", options).await;
    assert!(replay.is_empty());
}

#[tokio::test]
async fn test_retain_unavailable_rejects_retained_publish() {
    let config = BrokerConfig {
        retain_available: false,
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config);
    let mut publisher = connect(&broker, "pub").await;
    let err = publisher
        .connection
        .handle(driftmq::protocol::Packet::Publish(retained("x", "x", QoS::AtMostOnce, None)))
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), driftmq::protocol::ReasonCode::RetainNotSupported);
}
