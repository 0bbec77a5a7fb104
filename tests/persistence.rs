//! Sessions and retained messages surviving a restart through the fjall
//! backend

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::*;
use driftmq::broker::{Broker, BrokerConfig};
use driftmq::hooks::DefaultHooks;
use driftmq::persistence::{FjallBackend, PersistenceManager, StorageBackend};
use driftmq::protocol::{Connect, Packet, QoS, SubscriptionOptions};

fn manager(backend: &Arc<FjallBackend>) -> Arc<PersistenceManager> {
    Arc::new(PersistenceManager::new(
        backend.clone(),
        Duration::from_millis(10),
        16,
    ))
}

fn broker(persistence: &Arc<PersistenceManager>) -> Broker {
    Broker::with_persistence(
        BrokerConfig::default(),
        Arc::new(DefaultHooks),
        persistence.clone(),
    )
}

fn persistent_connect(client_id: &str) -> Connect {
    let mut connect = Connect::new(client_id);
    connect.properties.session_expiry_interval = Some(3600);
    connect
}

#[tokio::test]
async fn test_session_and_queue_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FjallBackend::open(dir.path()).unwrap());

    let first_run = manager(&backend);
    {
        let broker = broker(&first_run);
        let mut link = connect_with(&broker, persistent_connect("keeper")).await;
        subscribe(&mut link, "keep/#", SubscriptionOptions::new(QoS::AtLeastOnce)).await;
        link.connection.connection_lost().await;

        broker
            .publish(publish("keep/1", "while away", QoS::AtLeastOnce))
            .await
            .unwrap();
        let stats = broker.sweep();
        assert_eq!(stats.sessions_saved, 1, "queued message marks the session dirty");
    }
    first_run.shutdown().await.unwrap();

    let sessions = backend.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].queued.len(), 1);

    let second_run = manager(&backend);
    let broker = broker(&second_run);
    let stats = broker.restore().await.unwrap();
    assert_eq!(stats.sessions, 1);

    let outcome = broker
        .publish(publish("keep/2", "after restart", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(outcome.matched, 1, "restored subscriptions are indexed");

    let mut resume = persistent_connect("keeper");
    resume.clean_start = false;
    let mut link = broker.connect(resume).await.unwrap();
    let packets = drain(&mut link);
    assert!(matches!(packets.first(), Some(Packet::ConnAck(c)) if c.session_present));
    assert_eq!(
        payloads(&publishes(packets)),
        vec!["while away", "after restart"]
    );
    second_run.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retained_survive_restart_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FjallBackend::open(dir.path()).unwrap());

    let first_run = manager(&backend);
    {
        let broker = broker(&first_run);
        for (topic, payload) in [("cfg/a", "A"), ("cfg/b", "B")] {
            let mut message = publish(topic, payload, QoS::AtLeastOnce);
            message.retain = true;
            broker.publish(message).await.unwrap();
        }
        let mut clear = publish("cfg/b", "", QoS::AtMostOnce);
        clear.retain = true;
        broker.publish(clear).await.unwrap();
    }
    first_run.shutdown().await.unwrap();

    let second_run = manager(&backend);
    let broker = broker(&second_run);
    let stats = broker.restore().await.unwrap();
    assert_eq!(stats.retained, 1);

    let mut sub = connect(&broker, "reader").await;
    let options = SubscriptionOptions::new(QoS::AtLeastOnce);
    let replay = publishes(subscribe_with_id(&mut sub, "cfg/#", options, None).await);
    assert_eq!(payloads(&replay), vec!["A"]);
    assert_eq!(replay[0].qos, QoS::AtLeastOnce);
    second_run.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_disconnect_deletes_stored_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FjallBackend::open(dir.path()).unwrap());
    let persistence = manager(&backend);
    let broker = broker(&persistence);

    let mut link = connect_with(&broker, persistent_connect("gone")).await;
    link.connection.connection_lost().await;

    let mut clean = persistent_connect("gone");
    clean.properties.session_expiry_interval = None;
    let mut link = connect_with(&broker, clean).await;
    link.connection
        .handle(Packet::Disconnect(driftmq::protocol::Disconnect::new(
            driftmq::protocol::ReasonCode::Success,
        )))
        .await
        .unwrap();

    persistence.shutdown().await.unwrap();
    assert!(backend.load_session("gone").await.unwrap().is_none());
}
