//! Inbound PUBLISH handling

use tracing::{debug, error, trace, warn};

use super::{Connection, ConnectionError};
use crate::hooks::{Action, Decision};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS, ReasonCode};
use crate::topic::validate_topic_name;

impl Connection {
    /// Acknowledge a QoS > 0 publish without routing it
    fn refuse_publish(&self, publish: &Publish, reason_code: ReasonCode) {
        let Some(packet_id) = publish.packet_id else {
            return;
        };
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.send(Packet::PubAck(PubAck::with_reason(packet_id, reason_code)))
            }
            QoS::ExactlyOnce => {
                self.send(Packet::PubRec(PubRec::with_reason(packet_id, reason_code)))
            }
        }
    }

    fn check_publish(&mut self, publish: &mut Publish) -> Result<(), ProtocolError> {
        let config = &self.engine.config;
        if publish.qos > config.max_qos {
            return Err(ProtocolError::QoSNotSupported(publish.qos));
        }
        if publish.retain && !config.retain_available {
            return Err(ProtocolError::RetainNotSupported);
        }
        if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
            return Err(ProtocolError::Violation("missing packet identifier"));
        }
        if !publish.properties.subscription_identifiers.is_empty() {
            return Err(ProtocolError::Violation("subscription identifier in PUBLISH"));
        }

        self.aliases.apply(publish)?;
        if publish.topic.is_empty() {
            return Err(ProtocolError::InvalidTopicName("empty topic without alias"));
        }
        validate_topic_name(&publish.topic, config.max_topic_levels)
            .map_err(ProtocolError::InvalidTopicName)
    }

    pub(super) async fn handle_publish(
        &mut self,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        self.check_publish(&mut publish)?;
        trace!(
            client_id = %self.client_id,
            topic = %publish.topic,
            qos = publish.qos as u8,
            retain = publish.retain,
            "PUBLISH"
        );

        if self.engine.config.validate_payload_format
            && publish.properties.is_utf8_payload()
            && std::str::from_utf8(&publish.payload).is_err()
        {
            debug!(client_id = %self.client_id, topic = %publish.topic, "payload is not UTF-8");
            self.refuse_publish(&publish, ReasonCode::PayloadFormatInvalid);
            return Ok(());
        }

        if publish.qos == QoS::ExactlyOnce {
            if let Some(packet_id) = publish.packet_id {
                let s = self.session.read();
                if s.awaiting_release.contains(&packet_id) {
                    drop(s);
                    trace!(client_id = %self.client_id, packet_id, "duplicate QoS 2 PUBLISH");
                    self.send(Packet::PubRec(PubRec::new(packet_id)));
                    return Ok(());
                }
                if s.awaiting_release.len() >= usize::from(self.engine.config.receive_maximum) {
                    return Err(ProtocolError::ReceiveMaximumExceeded.into());
                }
            }
        }

        let action = Action::Publish {
            qos: publish.qos,
            retain: publish.retain,
        };
        match self
            .engine
            .hooks
            .authorize(self.client(), &publish.topic, action)
            .await
        {
            Ok(Decision::Allow) => {}
            Ok(Decision::Deny) => {
                debug!(client_id = %self.client_id, topic = %publish.topic, "publish denied");
                self.refuse_publish(&publish, ReasonCode::NotAuthorized);
                if self.engine.config.disconnect_on_unauthorized_publish {
                    return Err(ConnectionError::NotAuthorized);
                }
                return Ok(());
            }
            Err(e) => {
                error!(
                    client_id = %self.client_id,
                    topic = %publish.topic,
                    error = %e,
                    "authorization hook failed"
                );
                self.refuse_publish(&publish, ReasonCode::UnspecifiedError);
                return Ok(());
            }
        }

        let outcome = self
            .engine
            .publish(Some(&*self.client_id), &publish)
            .await;

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                let ack = if outcome.matched == 0 {
                    PubAck::with_reason(packet_id, ReasonCode::NoMatchingSubscribers)
                } else {
                    PubAck::new(packet_id)
                };
                self.send(Packet::PubAck(ack));
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                {
                    let mut s = self.session.write();
                    s.awaiting_release.insert(packet_id);
                    s.dirty = true;
                }
                let rec = if outcome.matched == 0 {
                    PubRec::with_reason(packet_id, ReasonCode::NoMatchingSubscribers)
                } else {
                    PubRec::new(packet_id)
                };
                self.send(Packet::PubRec(rec));
            }
            (QoS::AtMostOnce, _) => {}
            (_, None) => warn!(client_id = %self.client_id, "acknowledgment without packet id"),
        }
        Ok(())
    }
}
