//! Serializable data models for persistence.
//!
//! Storage-friendly mirrors of the runtime session and retained types.
//! Monotonic instants are stored as unix milliseconds and mapped back onto
//! the monotonic clock when loaded.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;
use tokio::time::Instant;

use crate::protocol::{Properties, Publish, QoS, SubscriptionOptions};
use crate::retained::RetainedMessage;
use crate::session::{DeliveryState, QueuedMessage, Session, SessionState};

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub properties: StoredProperties,
    /// Unix milliseconds when the message was published
    pub published_at_ms: u64,
}

/// Stored session
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub session_expiry_interval: u32,
    pub subscriptions: Vec<StoredSubscription>,
    pub queued: Vec<StoredQueuedMessage>,
    pub inflight: Vec<StoredInflightMessage>,
    /// Unix milliseconds when the session went offline
    pub disconnected_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    /// Subscription options byte as carried in SUBSCRIBE
    pub options: u8,
    pub subscription_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredQueuedMessage {
    pub publish: StoredPublish,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflightMessage {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// 0 = Sent, 1 = AwaitPubRec, 2 = AwaitPubComp
    pub state: u8,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub properties: StoredProperties,
}

/// Application message properties; connection scoped fields are not stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub subscription_identifiers: Vec<u32>,
    pub user_properties: Vec<(String, String)>,
}

/// Everything loaded at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<StoredRetainedMessage>,
    pub sessions: Vec<StoredSession>,
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Wall-clock milliseconds corresponding to a monotonic instant
pub fn instant_to_unix_ms(instant: Instant) -> u64 {
    let ago = Instant::now().saturating_duration_since(instant);
    unix_now().saturating_sub(ago).as_millis() as u64
}

/// Monotonic instant corresponding to stored wall-clock milliseconds.
/// Timestamps in the future map to now.
pub fn unix_ms_to_instant(ms: u64) -> Instant {
    let now = Instant::now();
    let ago = unix_now().saturating_sub(Duration::from_millis(ms));
    now.checked_sub(ago).unwrap_or(now)
}

impl From<&Properties> for StoredProperties {
    fn from(p: &Properties) -> Self {
        Self {
            payload_format_indicator: p.payload_format_indicator,
            message_expiry_interval: p.message_expiry_interval,
            content_type: p.content_type.clone(),
            response_topic: p.response_topic.clone(),
            correlation_data: p.correlation_data.as_ref().map(|b| b.to_vec()),
            subscription_identifiers: p.subscription_identifiers.clone(),
            user_properties: p.user_properties.clone(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(p: StoredProperties) -> Self {
        Self {
            payload_format_indicator: p.payload_format_indicator,
            message_expiry_interval: p.message_expiry_interval,
            content_type: p.content_type,
            response_topic: p.response_topic,
            correlation_data: p.correlation_data.map(Bytes::from),
            subscription_identifiers: p.subscription_identifiers,
            user_properties: p.user_properties,
            ..Properties::default()
        }
    }
}

impl From<&Publish> for StoredPublish {
    fn from(p: &Publish) -> Self {
        Self {
            topic: p.topic.to_string(),
            payload: p.payload.to_vec(),
            qos: p.qos as u8,
            retain: p.retain,
            properties: StoredProperties::from(&p.properties),
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(p: StoredPublish) -> Self {
        Self {
            dup: false,
            qos: QoS::from_u8(p.qos).unwrap_or_default(),
            retain: p.retain,
            topic: Arc::from(p.topic),
            packet_id: None,
            payload: Bytes::from(p.payload),
            properties: p.properties.into(),
        }
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(m: &RetainedMessage) -> Self {
        Self {
            topic: m.topic.to_string(),
            payload: m.payload.to_vec(),
            qos: m.qos as u8,
            properties: StoredProperties::from(&m.properties),
            published_at_ms: instant_to_unix_ms(m.published_at),
        }
    }
}

impl From<StoredRetainedMessage> for RetainedMessage {
    fn from(m: StoredRetainedMessage) -> Self {
        RetainedMessage::new(
            Arc::from(m.topic),
            Bytes::from(m.payload),
            QoS::from_u8(m.qos).unwrap_or_default(),
            m.properties.into(),
            unix_ms_to_instant(m.published_at_ms),
        )
    }
}

fn state_to_u8(state: DeliveryState) -> u8 {
    match state {
        DeliveryState::Sent => 0,
        DeliveryState::AwaitPubRec => 1,
        DeliveryState::AwaitPubComp => 2,
    }
}

fn state_from_u8(v: u8) -> DeliveryState {
    match v {
        1 => DeliveryState::AwaitPubRec,
        2 => DeliveryState::AwaitPubComp,
        _ => DeliveryState::Sent,
    }
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        let mut subscriptions: Vec<StoredSubscription> = session
            .subscriptions()
            .map(|s| StoredSubscription {
                filter: s.filter.clone(),
                options: s.options.to_byte(),
                subscription_id: s.subscription_id,
            })
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

        Self {
            client_id: session.client_id.to_string(),
            session_expiry_interval: session.session_expiry_interval,
            subscriptions,
            queued: session
                .queued()
                .map(|m| StoredQueuedMessage {
                    publish: StoredPublish::from(&m.publish),
                    received_at_ms: instant_to_unix_ms(m.received_at),
                })
                .collect(),
            inflight: session
                .window()
                .in_order()
                .into_iter()
                .map(|m| StoredInflightMessage {
                    packet_id: m.packet_id,
                    publish: StoredPublish::from(&m.publish),
                    state: state_to_u8(m.state),
                    received_at_ms: instant_to_unix_ms(m.received_at),
                })
                .collect(),
            disconnected_at_ms: session.disconnected_at.map(instant_to_unix_ms),
        }
    }
}

impl StoredSession {
    /// Rebuild an offline session. A session stored while connected counts
    /// as disconnected from the moment it is loaded.
    pub fn into_session(self, max_queued: usize) -> Session {
        let mut session = Session::new(Arc::from(self.client_id), max_queued);
        session.session_expiry_interval = self.session_expiry_interval;
        session.state = SessionState::Disconnected;
        session.disconnected_at = Some(
            self.disconnected_at_ms
                .map(unix_ms_to_instant)
                .unwrap_or_else(Instant::now),
        );

        for sub in self.subscriptions {
            let options = SubscriptionOptions::from_byte(sub.options).unwrap_or_default();
            session.subscribe(&sub.filter, options, sub.subscription_id);
        }

        for m in self.inflight {
            let mut publish = Publish::from(m.publish);
            publish.packet_id = Some(m.packet_id);
            session.window_mut().restore(
                m.packet_id,
                publish,
                state_from_u8(m.state),
                unix_ms_to_instant(m.received_at_ms),
            );
        }

        for m in self.queued {
            session.restore_queued(QueuedMessage::new(
                m.publish.into(),
                unix_ms_to_instant(m.received_at_ms),
            ));
        }

        session.dirty = false;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RetainHandling;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_unix_ms_mapping() {
        let earlier = Instant::now() - Duration::from_secs(5);
        let ms = instant_to_unix_ms(earlier);
        let back = unix_ms_to_instant(ms);
        let drift = if back > earlier {
            back - earlier
        } else {
            earlier - back
        };
        assert!(drift < Duration::from_millis(50));

        let future = unix_now().as_millis() as u64 + 60_000;
        assert!(unix_ms_to_instant(future) <= Instant::now());
    }

    #[tokio::test]
    async fn test_session_snapshot_restores_state() {
        let now = Instant::now();
        let mut session = Session::new(Arc::from("c1"), 10);
        session.session_expiry_interval = 300;
        let options = SubscriptionOptions::new(QoS::ExactlyOnce)
            .with_retain_as_published(true)
            .with_retain_handling(RetainHandling::DoNotSend);
        session.subscribe("a/+", options, Some(4));
        session.detach(now);

        let mut publish = Publish::new("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce);
        publish.properties.message_expiry_interval = Some(60);
        session.admit(QueuedMessage::new(publish, now), now);

        let stored = StoredSession::from(&session);
        assert_eq!(stored.queued.len(), 1);
        assert_eq!(stored.subscriptions[0].options, options.to_byte());

        let restored = stored.into_session(10);
        assert_eq!(&*restored.client_id, "c1");
        assert_eq!(restored.state, SessionState::Disconnected);
        assert_eq!(restored.session_expiry_interval, 300);
        assert_eq!(restored.queue_len(), 1);
        assert!(!restored.dirty);

        let sub = restored.subscriptions.get("a/+").unwrap();
        assert_eq!(sub.options, options);
        assert_eq!(sub.subscription_id, Some(4));

        let queued = restored.queued().next().unwrap();
        assert_eq!(queued.publish.properties.message_expiry_interval, Some(60));
    }

    #[test]
    fn test_properties_drop_connection_scoped_fields() {
        let props = Properties {
            message_expiry_interval: Some(9),
            topic_alias: Some(2),
            correlation_data: Some(Bytes::from_static(b"id")),
            subscription_identifiers: vec![1, 2],
            ..Properties::default()
        };
        let back: Properties = StoredProperties::from(&props).into();
        assert_eq!(back.topic_alias, None);
        assert_eq!(back.message_expiry_interval, Some(9));
        assert_eq!(back.subscription_identifiers, vec![1, 2]);
        assert_eq!(back.correlation_data, Some(Bytes::from_static(b"id")));
    }
}
