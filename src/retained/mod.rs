//! Retained message store
//!
//! Holds the last retained PUBLISH per topic. Expiry is checked lazily on
//! every read and by a periodic sweep; a read that finds an expired entry
//! purges it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::persistence::{PersistenceManager, PersistenceOp, Result, StoredRetainedMessage};
use crate::protocol::{Properties, Publish, QoS};
use crate::session::remaining_expiry;
use crate::topic::topic_matches_filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    /// Application properties as published; the expiry interval keeps its
    /// original value
    pub properties: Properties,
    pub published_at: Instant,
    pub expires_at: Option<Instant>,
}

impl RetainedMessage {
    pub fn new(
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        properties: Properties,
        published_at: Instant,
    ) -> Self {
        let expires_at = properties
            .message_expiry_interval
            .map(|secs| published_at + Duration::from_secs(u64::from(secs)));
        Self {
            topic,
            payload,
            qos,
            properties,
            published_at,
            expires_at,
        }
    }

    pub fn from_publish(publish: &Publish, now: Instant) -> Self {
        Self::new(
            publish.topic.clone(),
            publish.payload.clone(),
            publish.qos,
            publish.properties.forwarded(),
            now,
        )
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Seconds of expiry left at `now`
    pub fn remaining_expiry(&self, now: Instant) -> Option<u32> {
        remaining_expiry(self.properties.message_expiry_interval, self.published_at, now)
    }

    /// PUBLISH for a subscribe-time replay. The expiry interval is the
    /// original one; delivery reduces it by the time since `published_at`.
    pub fn to_publish(&self, retain: bool) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties: self.properties.clone(),
        }
    }
}

pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl RetainedStore {
    pub fn new(persistence: Option<Arc<PersistenceManager>>) -> Self {
        Self {
            messages: DashMap::new(),
            persistence,
        }
    }

    fn persist(&self, op: PersistenceOp) -> Result<()> {
        match &self.persistence {
            Some(p) => p.write(op),
            None => Ok(()),
        }
    }

    /// Store or replace the retained message for its topic.
    ///
    /// The in-memory update always happens; an `Err` only reports that the
    /// write did not reach the persistence backend.
    pub fn put(&self, message: RetainedMessage) -> Result<()> {
        let stored = self
            .persistence
            .as_ref()
            .map(|_| StoredRetainedMessage::from(&message));
        let topic = message.topic.clone();
        self.messages.insert(topic.clone(), message);

        match stored {
            Some(message) => self.persist(PersistenceOp::SaveRetained {
                topic: topic.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    /// Remove the retained message for `topic`; true if one existed
    pub fn clear(&self, topic: &str) -> Result<bool> {
        let existed = self.messages.remove(topic).is_some();
        if existed {
            self.persist(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            })?;
        }
        Ok(existed)
    }

    /// Apply a retained PUBLISH: an empty payload clears the topic
    pub fn retain(&self, publish: &Publish, now: Instant) -> Result<()> {
        if publish.payload.is_empty() {
            self.clear(&publish.topic).map(|_| ())
        } else {
            self.put(RetainedMessage::from_publish(publish, now))
        }
    }

    pub fn get(&self, topic: &str, now: Instant) -> Option<RetainedMessage> {
        let message = self.messages.get(topic).map(|m| m.clone())?;
        if message.is_expired(now) {
            self.purge(topic, now);
            return None;
        }
        Some(message)
    }

    /// Live retained messages whose topic matches `filter`
    pub fn matching(&self, filter: &str, now: Instant) -> Vec<RetainedMessage> {
        let mut live = Vec::new();
        let mut expired = Vec::new();

        for entry in self.messages.iter() {
            if !topic_matches_filter(entry.key(), filter) {
                continue;
            }
            if entry.is_expired(now) {
                expired.push(entry.key().clone());
            } else {
                live.push(entry.value().clone());
            }
        }

        // Shard guards from the iteration above are released before removal
        for topic in expired {
            self.purge(&topic, now);
        }
        live
    }

    fn purge(&self, topic: &str, now: Instant) -> bool {
        let removed = self
            .messages
            .remove_if(topic, |_, m| m.is_expired(now))
            .is_some();
        if removed {
            debug!(topic, "retained message expired");
            if let Err(e) = self.persist(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            }) {
                warn!(topic, error = %e, "failed to persist retained expiry");
            }
        }
        removed
    }

    /// Remove every expired entry; returns the number removed
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<str>> = self
            .messages
            .iter()
            .filter(|m| m.is_expired(now))
            .map(|m| m.key().clone())
            .collect();

        expired.iter().filter(|t| self.purge(t, now)).count()
    }

    /// Insert a message loaded from storage without writing it back
    pub fn restore(&self, message: RetainedMessage) {
        self.messages.insert(message.topic.clone(), message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
