//! SUBSCRIBE and UNSUBSCRIBE packet handling

use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::{Connection, ConnectionError};
use crate::hooks::{Action, Decision};
use crate::protocol::{
    Packet, ProtocolError, ReasonCode, SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe,
};
use crate::topic::{has_wildcards, parse_shared, validate_topic_filter, Subscriber};

/// A filter accepted by SUBSCRIBE, pending retained replay
struct Granted {
    subscription: Subscription,
    is_new: bool,
}

impl Connection {
    fn check_subscribe(&self, subscribe: &Subscribe) -> Result<Option<u32>, ProtocolError> {
        if subscribe.subscriptions.is_empty() {
            return Err(ProtocolError::Violation("SUBSCRIBE without filters"));
        }
        let subscription_id = subscribe.properties.subscription_identifiers.first().copied();
        match subscription_id {
            Some(_) if !self.engine.config.subscription_identifiers => {
                return Err(ProtocolError::SubscriptionIdentifiersNotSupported);
            }
            Some(0) => return Err(ProtocolError::Violation("subscription identifier 0")),
            _ => {}
        }
        if subscribe
            .subscriptions
            .iter()
            .any(|s| s.options.no_local && parse_shared(&s.filter).is_some())
        {
            return Err(ProtocolError::Violation("No Local on a shared subscription"));
        }
        Ok(subscription_id)
    }

    /// Everything short of authorization that can refuse one filter
    fn filter_refusal(&self, filter: &str) -> Option<ReasonCode> {
        let config = &self.engine.config;
        if validate_topic_filter(filter, config.max_topic_levels).is_err() {
            return Some(ReasonCode::TopicFilterInvalid);
        }
        let inner = match parse_shared(filter) {
            Some(_) if !config.shared_subscriptions => {
                return Some(ReasonCode::SharedSubscriptionsNotSupported);
            }
            Some((_, inner)) => inner,
            None => filter,
        };
        if has_wildcards(inner) && !config.wildcard_subscriptions {
            return Some(ReasonCode::WildcardSubscriptionsNotSupported);
        }
        None
    }

    pub(super) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let subscription_id = self.check_subscribe(&subscribe)?;
        let max_qos = self.engine.config.max_qos;

        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted = Vec::with_capacity(subscribe.subscriptions.len());

        for mut subscription in subscribe.subscriptions {
            if let Some(reason) = self.filter_refusal(&subscription.filter) {
                debug!(
                    client_id = %self.client_id,
                    filter = %subscription.filter,
                    reason = %reason,
                    "subscription refused"
                );
                reason_codes.push(reason);
                continue;
            }

            let action = Action::Subscribe {
                qos: subscription.options.qos,
            };
            match self
                .engine
                .hooks
                .authorize(self.client(), &subscription.filter, action)
                .await
            {
                Ok(Decision::Allow) => {}
                Ok(Decision::Deny) => {
                    debug!(
                        client_id = %self.client_id,
                        filter = %subscription.filter,
                        "subscription denied"
                    );
                    reason_codes.push(ReasonCode::NotAuthorized);
                    continue;
                }
                Err(e) => {
                    error!(
                        client_id = %self.client_id,
                        filter = %subscription.filter,
                        error = %e,
                        "authorization hook failed"
                    );
                    reason_codes.push(ReasonCode::UnspecifiedError);
                    continue;
                }
            }

            subscription.options.qos = subscription.options.qos.min(max_qos);
            let (is_new, session_id) = {
                let mut session = self.session.write();
                let is_new =
                    session.subscribe(&subscription.filter, subscription.options, subscription_id);
                (is_new, session.id)
            };
            let subscriber = Subscriber::new(self.client_id.clone(), subscription.options)
                .for_session(session_id)
                .with_subscription_id(subscription_id);
            self.engine
                .subscriptions
                .subscribe(&subscription.filter, subscriber);

            trace!(
                client_id = %self.client_id,
                filter = %subscription.filter,
                qos = subscription.options.qos as u8,
                is_new,
                "subscribed"
            );
            reason_codes.push(subscription.options.qos.granted());
            granted.push(Granted {
                subscription,
                is_new,
            });
        }

        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Default::default(),
        }));

        if !self.engine.config.retain_available {
            return Ok(());
        }

        let now = Instant::now();
        let mut s = self.session.write();
        for Granted {
            subscription,
            is_new,
        } in granted
        {
            // Shared subscriptions never receive retained messages
            if parse_shared(&subscription.filter).is_some()
                || !subscription.options.retain_handling.replays(is_new)
            {
                continue;
            }
            let outcome = self.engine.replay_retained(
                &mut s,
                &subscription.filter,
                subscription.options,
                subscription_id,
                now,
            );
            if outcome.matched > 0 {
                trace!(
                    client_id = %self.client_id,
                    filter = %subscription.filter,
                    replayed = outcome.matched,
                    "retained replay"
                );
            }
        }
        Ok(())
    }

    pub(super) fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        if unsubscribe.filters.is_empty() {
            return Err(ProtocolError::Violation("UNSUBSCRIBE without filters").into());
        }
        let max_levels = self.engine.config.max_topic_levels;

        let reason_codes = unsubscribe
            .filters
            .iter()
            .map(|filter| {
                if validate_topic_filter(filter, max_levels).is_err() {
                    return ReasonCode::TopicFilterInvalid;
                }
                let existed = self.session.write().unsubscribe(filter);
                self.engine.subscriptions.unsubscribe(filter, &self.client_id);
                if existed {
                    trace!(client_id = %self.client_id, filter = %filter, "unsubscribed");
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                }
            })
            .collect();

        self.send(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Default::default(),
        }));
        Ok(())
    }
}
