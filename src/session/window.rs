//! Flow-control window for outbound QoS 1/2 deliveries
//!
//! The window holds every unacknowledged outbound PUBLISH of a session. Its
//! capacity is the client's Receive Maximum; deliveries beyond that wait in
//! the session queue.

use ahash::AHashMap;
use tokio::time::Instant;

use crate::protocol::{Publish, QoS};

/// Client Receive Maximum when the CONNECT carries none
pub const DEFAULT_RECEIVE_MAXIMUM: u16 = 65_535;

/// Acknowledgment state of an outbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// QoS 1 PUBLISH sent, waiting for PUBACK
    Sent,
    /// QoS 2 PUBLISH sent, waiting for PUBREC
    AwaitPubRec,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitPubComp,
}

/// Unacknowledged outbound delivery
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    /// PUBLISH as sent, with its packet id and full topic
    pub publish: Publish,
    pub state: DeliveryState,
    /// When the broker accepted the original message
    pub received_at: Instant,
    /// Times the PUBLISH or PUBREL was sent again after a reconnect
    pub retry_count: u32,
    /// Sent on the current connection and not yet acknowledged
    on_wire: bool,
    /// Admission order, used to redeliver in sequence
    seq: u64,
}

#[derive(Debug)]
pub struct InflightWindow {
    capacity: u16,
    messages: AHashMap<u16, InflightMessage>,
    next_packet_id: u16,
    next_seq: u64,
}

impl InflightWindow {
    pub fn new(capacity: u16) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: AHashMap::new(),
            next_packet_id: 1,
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Apply a new Receive Maximum, e.g. after reconnecting.
    ///
    /// Entries beyond it wait for [`next_pending`] instead of being resent.
    ///
    /// [`next_pending`]: InflightWindow::next_pending
    pub fn set_capacity(&mut self, capacity: u16) {
        self.capacity = capacity.max(1);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_room(&self) -> bool {
        self.messages.len() < self.capacity as usize
    }

    /// Entries sent on the current connection and still unacknowledged
    pub fn on_wire(&self) -> usize {
        self.messages.values().filter(|m| m.on_wire).count()
    }

    /// True while another entry may be put on the wire
    pub fn can_resend(&self) -> bool {
        self.on_wire() < self.capacity as usize
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.messages.contains_key(&packet_id)
    }

    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = match self.next_packet_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !self.messages.contains_key(&id) {
                return id;
            }
        }
    }

    /// Track a QoS 1/2 PUBLISH, assigning its packet id.
    ///
    /// Returns the PUBLISH to transmit. Callers check [`has_room`] first.
    ///
    /// [`has_room`]: InflightWindow::has_room
    pub fn insert(&mut self, mut publish: Publish, received_at: Instant) -> Publish {
        let packet_id = self.allocate_packet_id();
        publish.packet_id = Some(packet_id);
        publish.dup = false;

        let state = match publish.qos {
            QoS::ExactlyOnce => DeliveryState::AwaitPubRec,
            _ => DeliveryState::Sent,
        };
        let seq = self.next_seq;
        self.next_seq += 1;

        self.messages.insert(
            packet_id,
            InflightMessage {
                packet_id,
                publish: publish.clone(),
                state,
                received_at,
                retry_count: 0,
                on_wire: true,
                seq,
            },
        );
        publish
    }

    /// Re-insert a delivery loaded from storage, keeping its packet id
    pub fn restore(
        &mut self,
        packet_id: u16,
        publish: Publish,
        state: DeliveryState,
        received_at: Instant,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.insert(
            packet_id,
            InflightMessage {
                packet_id,
                publish,
                state,
                received_at,
                retry_count: 0,
                on_wire: false,
                seq,
            },
        );
    }

    /// PUBACK: completes a QoS 1 delivery
    pub fn puback(&mut self, packet_id: u16) -> Option<InflightMessage> {
        match self.messages.get(&packet_id) {
            Some(m) if m.state == DeliveryState::Sent => self.messages.remove(&packet_id),
            _ => None,
        }
    }

    /// PUBREC: moves a QoS 2 delivery to the release phase.
    ///
    /// Returns false if the packet id is not awaiting PUBREC or PUBCOMP.
    pub fn pubrec(&mut self, packet_id: u16) -> bool {
        match self.messages.get_mut(&packet_id) {
            Some(m) if m.state != DeliveryState::Sent => {
                m.state = DeliveryState::AwaitPubComp;
                true
            }
            _ => false,
        }
    }

    /// PUBCOMP: completes a QoS 2 delivery
    pub fn pubcomp(&mut self, packet_id: u16) -> Option<InflightMessage> {
        match self.messages.get(&packet_id) {
            Some(m) if m.state == DeliveryState::AwaitPubComp => self.messages.remove(&packet_id),
            _ => None,
        }
    }

    /// Drop a delivery the client refused (PUBREC with an error reason)
    pub fn discard(&mut self, packet_id: u16) -> Option<InflightMessage> {
        self.messages.remove(&packet_id)
    }

    /// In-flight deliveries in admission order
    pub fn in_order(&self) -> Vec<&InflightMessage> {
        let mut messages: Vec<&InflightMessage> = self.messages.values().collect();
        messages.sort_by_key(|m| m.seq);
        messages
    }

    /// A new connection starts with nothing on the wire
    pub(crate) fn suspend(&mut self) {
        for m in self.messages.values_mut() {
            m.on_wire = false;
        }
    }

    /// Oldest entry waiting to be resent on the current connection
    pub fn next_pending(&self) -> Option<&InflightMessage> {
        self.messages
            .values()
            .filter(|m| !m.on_wire)
            .min_by_key(|m| m.seq)
    }

    /// Returns the entry's retry count
    pub(crate) fn mark_resent(&mut self, packet_id: u16) -> u32 {
        match self.messages.get_mut(&packet_id) {
            Some(m) => {
                m.on_wire = true;
                m.retry_count += 1;
                m.retry_count
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(qos: QoS) -> Publish {
        Publish::new("t", "p", qos)
    }

    #[test]
    fn test_capacity_gate() {
        let now = Instant::now();
        let mut window = InflightWindow::new(2);
        assert!(window.has_room());
        window.insert(publish(QoS::AtLeastOnce), now);
        window.insert(publish(QoS::AtLeastOnce), now);
        assert!(!window.has_room());
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        assert_eq!(InflightWindow::new(0).capacity(), 1);
    }

    #[test]
    fn test_qos1_ack() {
        let now = Instant::now();
        let mut window = InflightWindow::new(10);
        let sent = window.insert(publish(QoS::AtLeastOnce), now);
        let id = sent.packet_id.unwrap();

        assert!(!window.pubrec(id));
        assert!(window.pubcomp(id).is_none());
        assert!(window.puback(id).is_some());
        assert!(window.puback(id).is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_qos2_transitions() {
        let now = Instant::now();
        let mut window = InflightWindow::new(10);
        let id = window
            .insert(publish(QoS::ExactlyOnce), now)
            .packet_id
            .unwrap();

        assert!(window.puback(id).is_none());
        assert!(window.pubcomp(id).is_none());
        assert!(window.pubrec(id));
        assert!(window.pubrec(id), "duplicate PUBREC keeps release phase");
        assert!(window.pubcomp(id).is_some());
        assert!(!window.contains(id));
    }

    #[test]
    fn test_packet_ids_skip_in_use() {
        let now = Instant::now();
        let mut window = InflightWindow::new(u16::MAX);
        window.next_packet_id = u16::MAX;
        let a = window.insert(publish(QoS::AtLeastOnce), now).packet_id;
        let b = window.insert(publish(QoS::AtLeastOnce), now).packet_id;
        assert_eq!(a, Some(u16::MAX));
        assert_eq!(b, Some(1));

        window.next_packet_id = 1;
        let c = window.insert(publish(QoS::AtLeastOnce), now).packet_id;
        assert_eq!(c, Some(2));
    }

    #[test]
    fn test_in_order() {
        let now = Instant::now();
        let mut window = InflightWindow::new(10);
        window.next_packet_id = 9;
        for _ in 0..3 {
            window.insert(publish(QoS::AtLeastOnce), now);
        }
        let ids: Vec<u16> = window.in_order().iter().map(|m| m.packet_id).collect();
        assert_eq!(ids, vec![9, 10, 11]);
    }

    #[test]
    fn test_suspended_entries_resend_in_order() {
        let now = Instant::now();
        let mut window = InflightWindow::new(5);
        for _ in 0..3 {
            window.insert(publish(QoS::AtLeastOnce), now);
        }
        assert_eq!(window.on_wire(), 3);

        window.suspend();
        window.set_capacity(1);
        assert_eq!(window.on_wire(), 0);
        assert!(window.can_resend());

        let first = window.next_pending().map(|m| m.packet_id).unwrap();
        assert_eq!(window.mark_resent(first), 1);
        assert!(!window.can_resend());

        window.puback(first);
        let next = window.next_pending().map(|m| m.packet_id);
        assert_eq!(next, Some(first + 1));
    }
}
