//! Fan-out of a publish to matching sessions

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::Engine;
use crate::protocol::{Publish, QoS, SubscriptionOptions};
use crate::retained::RetainedMessage;
use crate::session::{Admission, QueuedMessage, Session};

/// What happened to one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Sessions with at least one matching subscription
    pub matched: usize,
    pub sent: usize,
    pub queued: usize,
    pub expired: usize,
}

impl DeliveryOutcome {
    fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Sent => self.sent += 1,
            Admission::Queued => self.queued += 1,
            Admission::Expired => self.expired += 1,
        }
    }
}

/// Overlapping subscriptions of one session folded into a single delivery
struct Target {
    qos: QoS,
    retain_as_published: bool,
    subscription_ids: SmallVec<[u32; 4]>,
}

/// Copy of `publish` as sent to one subscriber
fn outbound(publish: &Publish, qos: QoS, retain: bool, subscription_ids: &[u32]) -> Publish {
    let mut properties = publish.properties.forwarded();
    properties.subscription_identifiers = subscription_ids.to_vec();
    Publish {
        dup: false,
        qos,
        retain,
        topic: publish.topic.clone(),
        packet_id: None,
        payload: publish.payload.clone(),
        properties,
    }
}

impl Engine {
    /// Update the retained store and hand a copy of `publish` to every
    /// matching session. `source` is the publishing client, for No Local.
    pub(crate) fn deliver(
        &self,
        source: Option<&str>,
        publish: &Publish,
        now: Instant,
    ) -> DeliveryOutcome {
        if publish.retain && self.config.retain_available {
            if let Err(e) = self.retained.retain(publish, now) {
                warn!(topic = %publish.topic, error = %e, "retained update not persisted");
            }
        }

        let mut targets: AHashMap<(Arc<str>, u64), Target> = AHashMap::new();
        for sub in self.subscriptions.matches(&publish.topic) {
            if sub.options.no_local && source == Some(&*sub.client_id) {
                continue;
            }
            let key = (sub.client_id, sub.session_id);
            let target = targets.entry(key).or_insert_with(|| Target {
                qos: QoS::AtMostOnce,
                retain_as_published: false,
                subscription_ids: SmallVec::new(),
            });
            target.qos = target.qos.max(sub.options.qos);
            target.retain_as_published |= sub.options.retain_as_published;
            if let Some(id) = sub.subscription_id {
                target.subscription_ids.push(id);
            }
        }

        let mut outcome = DeliveryOutcome::default();

        for ((client_id, session_id), mut target) in targets {
            let Some(session) = self.sessions.get(&client_id) else {
                trace!(client_id = %client_id, "subscriber without session");
                continue;
            };
            target.subscription_ids.sort_unstable();
            target.subscription_ids.dedup();

            let message = outbound(
                publish,
                publish.qos.min(target.qos),
                publish.retain && target.retain_as_published,
                &target.subscription_ids,
            );

            let mut session = session.write();
            // Index entry left behind by a session that was replaced
            if session.id != session_id {
                trace!(client_id = %client_id, session_id, "stale subscription skipped");
                continue;
            }
            let admission = session.admit(QueuedMessage::new(message, now), now);
            outcome.matched += 1;
            outcome.record(admission);
        }

        trace!(
            topic = %publish.topic,
            matched = outcome.matched,
            sent = outcome.sent,
            queued = outcome.queued,
            "publish routed"
        );
        outcome
    }

    /// Subscribe-time replay of retained messages matching `filter`
    pub(crate) fn replay_retained(
        &self,
        session: &mut Session,
        filter: &str,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
        now: Instant,
    ) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::default();
        let retain = options.retain_as_published || self.config.replay_keeps_retain_flag;
        let ids: SmallVec<[u32; 1]> = subscription_id.into_iter().collect();

        let mut messages = self.retained.matching(filter, now);
        messages.sort_by_key(|m: &RetainedMessage| m.published_at);

        for message in messages {
            outcome.matched += 1;
            let publish = message.to_publish(retain);
            let publish = outbound(&publish, message.qos.min(options.qos), retain, &ids);
            // Expiry counts from the original publish time
            let admission = session.admit(QueuedMessage::new(publish, message.published_at), now);
            outcome.record(admission);
        }
        outcome
    }
}
