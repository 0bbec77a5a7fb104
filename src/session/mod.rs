//! MQTT session state
//!
//! A session outlives its network connections. It owns the subscription set,
//! the queue of messages waiting for delivery, the outbound flow-control
//! window and the Last-Will declaration. While a connection is attached the
//! session holds that connection's outbound channel and alias table in a
//! [`SessionLink`].

mod alias;
mod store;
mod window;

pub use alias::{OutboundAliases, TopicAliasTable};
pub use store::{OpenedSession, SessionStore};
pub use window::{DeliveryState, InflightMessage, InflightWindow, DEFAULT_RECEIVE_MAXIMUM};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::protocol::{Packet, PubRel, Publish, QoS, SubscriptionOptions, Will};

/// Session expiry interval meaning "never expires"
pub const NEVER_EXPIRE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Held for the session expiry interval after the last disconnect
    Disconnected,
}

/// Subscription entry in a session's registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubscription {
    pub filter: String,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

/// A message on its way to one subscriber
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Outbound PUBLISH without packet id
    pub publish: Publish,
    /// When the broker accepted the original message
    pub received_at: Instant,
}

impl QueuedMessage {
    pub fn new(publish: Publish, received_at: Instant) -> Self {
        Self {
            publish,
            received_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        remaining_expiry(self.publish.properties.message_expiry_interval, self.received_at, now)
            == Some(0)
    }

    /// The PUBLISH to transmit now, with its expiry interval reduced by the
    /// time spent in the broker. `None` once expired.
    pub fn outbound(mut self, now: Instant) -> Option<Publish> {
        count_down_expiry(&mut self.publish, self.received_at, now).then_some(self.publish)
    }
}

/// Reduce the message expiry interval by the time since `received_at`.
///
/// Returns false once the message has expired.
fn count_down_expiry(publish: &mut Publish, received_at: Instant, now: Instant) -> bool {
    let interval = publish.properties.message_expiry_interval;
    match remaining_expiry(interval, received_at, now) {
        Some(0) => false,
        remaining => {
            publish.properties.message_expiry_interval = remaining;
            true
        }
    }
}

/// Seconds left of a message expiry interval, rounded up.
///
/// `Some(0)` means expired; `None` means the message never expires.
pub fn remaining_expiry(interval: Option<u32>, since: Instant, now: Instant) -> Option<u32> {
    let interval = Duration::from_secs(u64::from(interval?));
    let elapsed = now.saturating_duration_since(since);
    let left = interval.saturating_sub(elapsed);
    Some(left.as_millis().div_ceil(1000).min(u32::MAX as u128) as u32)
}

/// What happened to a message offered to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed to the connection (QoS 1/2 also entered the window)
    Sent,
    /// Waiting in the session queue
    Queued,
    /// Message expiry elapsed before delivery
    Expired,
}

/// The connection currently attached to a session
#[derive(Debug)]
pub struct SessionLink {
    pub connection_id: u64,
    pub tx: mpsc::UnboundedSender<Packet>,
    pub aliases: OutboundAliases,
}

impl SessionLink {
    pub fn new(connection_id: u64, tx: mpsc::UnboundedSender<Packet>, alias_maximum: u16) -> Self {
        Self {
            connection_id,
            tx,
            aliases: OutboundAliases::new(alias_maximum),
        }
    }

    pub fn send(&self, packet: Packet) {
        if self.tx.send(packet).is_err() {
            debug!(connection_id = self.connection_id, "outbound channel closed");
        }
    }
}

pub struct Session {
    pub client_id: Arc<str>,
    /// Assigned by the store; a replacement session gets a higher id
    pub id: u64,
    pub state: SessionState,
    /// Seconds to keep state after disconnect; 0 discards it immediately
    pub session_expiry_interval: u32,
    pub subscriptions: HashMap<String, SessionSubscription>,
    /// Inbound QoS 2 packet ids routed but not yet released
    pub awaiting_release: AHashSet<u16>,
    pub will: Option<Will>,
    pub disconnected_at: Option<Instant>,
    /// Set when queued state changed since the last snapshot
    pub dirty: bool,
    window: InflightWindow,
    queue: VecDeque<QueuedMessage>,
    max_queued: usize,
    link: Option<SessionLink>,
}

impl Session {
    pub fn new(client_id: Arc<str>, max_queued: usize) -> Self {
        Self {
            client_id,
            id: 0,
            state: SessionState::Connected,
            session_expiry_interval: 0,
            subscriptions: HashMap::new(),
            awaiting_release: AHashSet::new(),
            will: None,
            disconnected_at: None,
            dirty: false,
            window: InflightWindow::new(DEFAULT_RECEIVE_MAXIMUM),
            queue: VecDeque::new(),
            max_queued,
            link: None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.session_expiry_interval > 0
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        if self.state != SessionState::Disconnected || self.session_expiry_interval == NEVER_EXPIRE
        {
            return false;
        }
        match self.disconnected_at {
            Some(at) => {
                now.saturating_duration_since(at)
                    >= Duration::from_secs(u64::from(self.session_expiry_interval))
            }
            None => self.session_expiry_interval == 0,
        }
    }

    // ------------------------------------------------------------------
    // Subscription registry
    // ------------------------------------------------------------------

    /// Add or replace a subscription; true if the filter was not present
    pub fn subscribe(
        &mut self,
        filter: &str,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> bool {
        self.dirty = true;
        self.subscriptions
            .insert(
                filter.to_string(),
                SessionSubscription {
                    filter: filter.to_string(),
                    options,
                    subscription_id,
                },
            )
            .is_none()
    }

    /// Remove a subscription; true if it existed
    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        self.dirty = true;
        self.subscriptions.remove(filter).is_some()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &SessionSubscription> {
        self.subscriptions.values()
    }

    // ------------------------------------------------------------------
    // Connection attachment
    // ------------------------------------------------------------------

    pub fn link(&self) -> Option<&SessionLink> {
        self.link.as_ref()
    }

    pub fn is_attached_to(&self, connection_id: u64) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.connection_id == connection_id)
    }

    /// Attach a connection, returning the one it replaces
    pub fn attach(&mut self, link: SessionLink, receive_maximum: u16) -> Option<SessionLink> {
        self.state = SessionState::Connected;
        self.disconnected_at = None;
        self.window.set_capacity(receive_maximum);
        self.link.replace(link)
    }

    /// Detach the connection; its alias table goes with it
    pub fn detach(&mut self, now: Instant) -> Option<SessionLink> {
        self.state = SessionState::Disconnected;
        self.disconnected_at = Some(now);
        self.link.take()
    }

    /// Redeliver unacknowledged messages, then drain the queue.
    ///
    /// In-flight PUBLISH packets are resent with DUP set; deliveries already
    /// in the release phase get their PUBREL again. At most Receive Maximum
    /// of them go out now, the rest follow as acknowledgments free slots.
    pub fn resume(&mut self, now: Instant) {
        if self.link.is_none() {
            return;
        }
        self.window.suspend();
        self.release(now);
    }

    /// Resend suspended in-flight entries while the window allows
    fn resend_pending(&mut self, now: Instant) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        while self.window.can_resend() {
            let Some(message) = self.window.next_pending() else {
                break;
            };
            let packet_id = message.packet_id;
            let packet = match message.state {
                DeliveryState::AwaitPubComp => Some(Packet::PubRel(PubRel::new(packet_id))),
                DeliveryState::Sent | DeliveryState::AwaitPubRec => {
                    let mut publish = message.publish.clone();
                    count_down_expiry(&mut publish, message.received_at, now).then(|| {
                        publish.dup = true;
                        link.aliases.apply(&mut publish);
                        Packet::Publish(publish)
                    })
                }
            };

            match packet {
                Some(packet) => {
                    let retries = self.window.mark_resent(packet_id);
                    trace!(client_id = %self.client_id, packet_id, retries, "redelivering");
                    link.send(packet);
                }
                None => {
                    self.window.discard(packet_id);
                    self.dirty = true;
                    debug!(
                        client_id = %self.client_id,
                        packet_id,
                        "in-flight message expired before redelivery"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Flow control
    // ------------------------------------------------------------------

    pub fn window(&self) -> &InflightWindow {
        &self.window
    }

    pub(crate) fn window_mut(&mut self) -> &mut InflightWindow {
        &mut self.window
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Offer a message for delivery.
    ///
    /// QoS 0 goes straight to an attached connection. QoS 1/2 enters the
    /// window when it has room and nothing is waiting ahead of it; otherwise
    /// the message is queued in arrival order.
    pub fn admit(&mut self, message: QueuedMessage, now: Instant) -> Admission {
        if message.is_expired(now) {
            return Admission::Expired;
        }
        if self.link.is_none() {
            return self.enqueue(message);
        }
        if message.publish.qos != QoS::AtMostOnce
            && (!self.queue.is_empty() || !self.window.has_room())
        {
            return self.enqueue(message);
        }
        self.transmit(message, now)
    }

    fn enqueue(&mut self, message: QueuedMessage) -> Admission {
        if self.max_queued > 0 && self.queue.len() >= self.max_queued {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(
                    client_id = %self.client_id,
                    topic = %dropped.publish.topic,
                    "session queue full, dropping oldest message"
                );
            }
        }
        self.queue.push_back(message);
        self.dirty = true;
        Admission::Queued
    }

    fn transmit(&mut self, message: QueuedMessage, now: Instant) -> Admission {
        if message.is_expired(now) {
            return Admission::Expired;
        }
        let Some(link) = self.link.as_mut() else {
            return self.enqueue(message);
        };

        // The window keeps the original interval so a resend can count down again
        let QueuedMessage {
            publish,
            received_at,
        } = message;
        let mut publish = match publish.qos {
            QoS::AtMostOnce => publish,
            _ => self.window.insert(publish, received_at),
        };
        count_down_expiry(&mut publish, received_at, now);
        link.aliases.apply(&mut publish);
        link.send(Packet::Publish(publish));
        Admission::Sent
    }

    /// Resend suspended in-flight entries, then move queued messages into
    /// the window while it has room.
    ///
    /// Expired entries are dropped on the way. Returns the number of queued
    /// messages sent.
    pub fn release(&mut self, now: Instant) -> usize {
        self.resend_pending(now);
        let mut sent = 0;
        while self.link.is_some() {
            let Some(front) = self.queue.front() else {
                break;
            };
            if front.publish.qos != QoS::AtMostOnce && !self.window.has_room() {
                break;
            }
            let Some(message) = self.queue.pop_front() else {
                break;
            };
            self.dirty = true;
            if self.transmit(message, now) == Admission::Sent {
                sent += 1;
            }
        }
        sent
    }

    /// Drop expired messages from the queue; returns how many were removed
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.queue.len();
        self.queue.retain(|m| !m.is_expired(now));
        let purged = before - self.queue.len();
        if purged > 0 {
            self.dirty = true;
        }
        purged
    }

    pub(crate) fn restore_queued(&mut self, message: QueuedMessage) {
        self.queue.push_back(message);
    }

    /// PUBACK from the client
    pub fn acknowledge(&mut self, packet_id: u16, now: Instant) -> bool {
        let done = self.window.puback(packet_id).is_some();
        if done {
            self.dirty = true;
            self.release(now);
        }
        done
    }

    /// PUBREC from the client; returns false for unknown packet ids
    pub fn received(&mut self, packet_id: u16, refused: bool, now: Instant) -> bool {
        if refused {
            let known = self.window.discard(packet_id).is_some();
            if known {
                self.release(now);
            }
            return known;
        }
        self.window.pubrec(packet_id)
    }

    /// PUBCOMP from the client
    pub fn complete(&mut self, packet_id: u16, now: Instant) -> bool {
        let done = self.window.pubcomp(packet_id).is_some();
        if done {
            self.dirty = true;
            self.release(now);
        }
        done
    }

    pub fn send(&self, packet: Packet) {
        if let Some(link) = &self.link {
            link.send(packet);
        }
    }
}

#[cfg(test)]
mod tests;
