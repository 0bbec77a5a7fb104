//! Per-connection topic alias tables
//!
//! Both directions are scoped to one network connection and are dropped with
//! it. Inbound aliases are chosen by the client and bounded by the maximum the
//! broker advertised in CONNACK; outbound aliases are chosen by the broker and
//! bounded by the maximum the client advertised in CONNECT.

use std::sync::Arc;

use ahash::AHashMap;

use crate::protocol::{ProtocolError, Publish};

/// Client-to-server alias mapping
#[derive(Debug, Default)]
pub struct TopicAliasTable {
    maximum: u16,
    entries: AHashMap<u16, Arc<str>>,
}

impl TopicAliasTable {
    pub fn new(maximum: u16) -> Self {
        Self {
            maximum,
            entries: AHashMap::new(),
        }
    }

    pub fn maximum(&self) -> u16 {
        self.maximum
    }

    fn check_range(&self, alias: u16) -> Result<(), ProtocolError> {
        if alias == 0 || alias > self.maximum {
            return Err(ProtocolError::TopicAliasOutOfRange {
                alias,
                maximum: self.maximum,
            });
        }
        Ok(())
    }

    /// Bind `alias` to `topic`, replacing any previous binding
    pub fn establish(&mut self, alias: u16, topic: Arc<str>) -> Result<(), ProtocolError> {
        self.check_range(alias)?;
        self.entries.insert(alias, topic);
        Ok(())
    }

    pub fn resolve(&self, alias: u16) -> Result<Arc<str>, ProtocolError> {
        self.check_range(alias)?;
        self.entries
            .get(&alias)
            .cloned()
            .ok_or(ProtocolError::UnknownTopicAlias(alias))
    }

    /// Establish when `topic` is non-empty, otherwise resolve
    pub fn resolve_or_establish(
        &mut self,
        alias: u16,
        topic: &Arc<str>,
    ) -> Result<Arc<str>, ProtocolError> {
        if topic.is_empty() {
            self.resolve(alias)
        } else {
            self.establish(alias, topic.clone())?;
            Ok(topic.clone())
        }
    }

    /// Rewrite an inbound PUBLISH so it carries its full topic and no alias
    pub fn apply(&mut self, publish: &mut Publish) -> Result<(), ProtocolError> {
        if let Some(alias) = publish.properties.topic_alias.take() {
            publish.topic = self.resolve_or_establish(alias, &publish.topic)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Server-to-client alias assignment
#[derive(Debug, Default)]
pub struct OutboundAliases {
    maximum: u16,
    assigned: AHashMap<Arc<str>, u16>,
}

impl OutboundAliases {
    pub fn new(maximum: u16) -> Self {
        Self {
            maximum,
            assigned: AHashMap::new(),
        }
    }

    /// Rewrite an outbound PUBLISH to use an alias when one is available.
    ///
    /// The first PUBLISH on a topic carries both the topic and the new alias;
    /// later ones carry the alias and an empty topic. Once every alias is in
    /// use, further topics are sent in full.
    pub fn apply(&mut self, publish: &mut Publish) {
        if self.maximum == 0 {
            return;
        }

        if let Some(&alias) = self.assigned.get(&publish.topic) {
            publish.properties.topic_alias = Some(alias);
            publish.topic = Arc::from("");
            return;
        }

        if self.assigned.len() < self.maximum as usize {
            let alias = self.assigned.len() as u16 + 1;
            self.assigned.insert(publish.topic.clone(), alias);
            publish.properties.topic_alias = Some(alias);
        }
    }
}
