//! QoS acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, ReasonCode};

impl Connection {
    /// PUBACK for an outbound QoS 1 delivery
    pub(super) fn handle_puback(&mut self, puback: PubAck) -> Result<(), ConnectionError> {
        let known = self
            .session
            .write()
            .acknowledge(puback.packet_id, Instant::now());
        if !known {
            debug!(
                client_id = %self.client_id,
                packet_id = puback.packet_id,
                "PUBACK for unknown packet id"
            );
        }
        Ok(())
    }

    /// PUBREC for an outbound QoS 2 delivery.
    ///
    /// An error reason code ends the exchange; otherwise PUBREL follows.
    pub(super) fn handle_pubrec(&mut self, pubrec: PubRec) -> Result<(), ConnectionError> {
        let refused = pubrec.reason_code.is_error();
        let known = self
            .session
            .write()
            .received(pubrec.packet_id, refused, Instant::now());

        if refused {
            trace!(
                client_id = %self.client_id,
                packet_id = pubrec.packet_id,
                reason = %pubrec.reason_code,
                "delivery refused by client"
            );
            return Ok(());
        }

        let pubrel = if known {
            PubRel::new(pubrec.packet_id)
        } else {
            PubRel::with_reason(pubrec.packet_id, ReasonCode::PacketIdNotFound)
        };
        self.send(Packet::PubRel(pubrel));
        Ok(())
    }

    /// PUBREL for an inbound QoS 2 publish; it was routed on receipt
    pub(super) fn handle_pubrel(&mut self, pubrel: PubRel) -> Result<(), ConnectionError> {
        let released = {
            let mut s = self.session.write();
            let released = s.awaiting_release.remove(&pubrel.packet_id);
            s.dirty |= released;
            released
        };

        let pubcomp = if released {
            PubComp::new(pubrel.packet_id)
        } else {
            PubComp::with_reason(pubrel.packet_id, ReasonCode::PacketIdNotFound)
        };
        self.send(Packet::PubComp(pubcomp));
        Ok(())
    }

    /// PUBCOMP for an outbound QoS 2 delivery
    pub(super) fn handle_pubcomp(&mut self, pubcomp: PubComp) -> Result<(), ConnectionError> {
        let known = self
            .session
            .write()
            .complete(pubcomp.packet_id, Instant::now());
        if !known {
            debug!(
                client_id = %self.client_id,
                packet_id = pubcomp.packet_id,
                "PUBCOMP for unknown packet id"
            );
        }
        Ok(())
    }
}
