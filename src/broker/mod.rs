//! MQTT Broker Core
//!
//! [`Broker`] owns the shared engine state: sessions, the subscription
//! index, retained messages, pending wills and the collaborator hooks.
//! A transport front end calls [`Broker::connect`] for each CONNECT and
//! feeds every further decoded packet to [`Connection::handle`]; outbound
//! packets arrive on the receiver in [`ClientLink`].

mod connection;
mod delivery;
mod will;

pub use connection::{ClientLink, ConnectError, Connection, ConnectionError};
pub use delivery::DeliveryOutcome;
pub use will::WillScheduler;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{PersistenceError, PersistenceManager, PersistenceOp, StoredSession};
use crate::protocol::{Connect, ProtocolError, Publish, QoS, Will};
use crate::retained::{RetainedMessage, RetainedStore};
use crate::session::SessionStore;
use crate::topic::{validate_topic_name, Subscriber, SubscriptionStore};

/// Engine settings, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_queued_messages: usize,
    pub max_packet_size: u32,
    pub max_topic_levels: usize,
    pub expiry_check_interval: Duration,
    pub max_session_expiry: u32,
    /// Inbound Topic Alias Maximum advertised to clients
    pub topic_alias_maximum: u16,
    pub server_keep_alive: u16,
    pub max_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    pub shared_subscriptions: bool,
    /// Server Receive Maximum for inbound QoS 2
    pub receive_maximum: u16,
    pub disconnect_on_unauthorized_publish: bool,
    pub validate_payload_format: bool,
    pub replay_keeps_retain_flag: bool,
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_queued_messages: config.limits.max_queued_messages,
            max_packet_size: config.limits.max_packet_size,
            max_topic_levels: config.limits.max_topic_levels,
            expiry_check_interval: config.session.expiry_check_interval,
            max_session_expiry: config.session.max_session_expiry,
            topic_alias_maximum: config.session.topic_alias_maximum,
            server_keep_alive: config.session.server_keep_alive,
            max_qos: QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: config.mqtt.retain_available,
            wildcard_subscriptions: config.mqtt.wildcard_subscriptions,
            subscription_identifiers: config.mqtt.subscription_identifiers,
            shared_subscriptions: config.mqtt.shared_subscriptions,
            receive_maximum: config.mqtt.receive_maximum,
            disconnect_on_unauthorized_publish: config.mqtt.disconnect_on_unauthorized_publish,
            validate_payload_format: config.mqtt.validate_payload_format,
            replay_keeps_retain_flag: config.mqtt.replay_keeps_retain_flag,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub retained_expired: usize,
    pub sessions_expired: usize,
    pub queued_expired: usize,
    pub sessions_saved: usize,
}

/// Counts from [`Broker::restore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub retained: usize,
    pub sessions: usize,
    pub discarded: usize,
}

pub(crate) struct Engine {
    pub(crate) config: BrokerConfig,
    pub(crate) sessions: SessionStore,
    pub(crate) subscriptions: SubscriptionStore,
    pub(crate) retained: RetainedStore,
    pub(crate) wills: WillScheduler,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) persistence: Option<Arc<PersistenceManager>>,
}

impl Engine {
    /// Queue a write; failures are logged and in-memory state stands
    pub(crate) fn persist(&self, op: PersistenceOp) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let kind = op.kind();
        if let Err(e) = persistence.write(op) {
            warn!(op = kind, error = %e, "persistence write failed");
        }
    }

    /// Route a publish and notify hooks
    pub(crate) async fn publish(&self, source: Option<&str>, publish: &Publish) -> DeliveryOutcome {
        let outcome = self.deliver(source, publish, Instant::now());
        self.hooks
            .on_message_published(publish, outcome.matched)
            .await;
        outcome
    }

    /// Publish `will` now or after its delay interval
    pub(crate) async fn schedule_will(self: &Arc<Self>, client_id: Arc<str>, will: Will) {
        let delay = will.properties.will_delay_interval.unwrap_or(0);
        let publish = will_publish(will);

        if delay == 0 {
            debug!(client_id = %client_id, topic = %publish.topic, "publishing will");
            self.publish(Some(&*client_id), &publish).await;
            return;
        }

        debug!(client_id = %client_id, delay, "will armed");
        let engine = Arc::downgrade(self);
        let source = client_id.clone();
        self.wills.arm(
            client_id,
            Duration::from_secs(u64::from(delay)),
            async move {
                if let Some(engine) = engine.upgrade() {
                    debug!(client_id = %source, topic = %publish.topic, "publishing delayed will");
                    engine.publish(Some(&*source), &publish).await;
                }
            },
        );
    }
}

fn will_publish(will: Will) -> Publish {
    Publish {
        dup: false,
        qos: will.qos,
        retain: will.retain,
        topic: Arc::from(will.topic),
        packet_id: None,
        payload: will.payload,
        properties: will.properties.forwarded(),
    }
}

/// The session and delivery engine
#[derive(Clone)]
pub struct Broker {
    engine: Arc<Engine>,
}

impl Broker {
    /// Broker with default hooks (allows everything) and no persistence
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        Self::build(config, hooks, None)
    }

    pub fn with_persistence(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        persistence: Arc<PersistenceManager>,
    ) -> Self {
        Self::build(config, hooks, Some(persistence))
    }

    fn build(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        let engine = Engine {
            sessions: SessionStore::new(config.max_queued_messages),
            subscriptions: SubscriptionStore::new(),
            retained: RetainedStore::new(persistence.clone()),
            wills: WillScheduler::new(),
            hooks,
            persistence,
            config,
        };
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.engine.config
    }

    /// Accept a CONNECT, creating or resuming its session
    pub async fn connect(&self, connect: Connect) -> Result<ClientLink, ConnectError> {
        Connection::open(self.engine.clone(), connect).await
    }

    /// Server-originated publish through the normal delivery path
    pub async fn publish(&self, publish: Publish) -> Result<DeliveryOutcome, ProtocolError> {
        validate_topic_name(&publish.topic, self.engine.config.max_topic_levels)
            .map_err(ProtocolError::InvalidTopicName)?;
        Ok(self.engine.publish(None, &publish).await)
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.engine.retained
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.engine.sessions
    }

    pub fn wills(&self) -> &WillScheduler {
        &self.engine.wills
    }

    /// Reload retained messages and persistent sessions from storage
    pub async fn restore(&self) -> Result<RestoreStats, PersistenceError> {
        let Some(persistence) = &self.engine.persistence else {
            return Ok(RestoreStats::default());
        };
        let data = persistence.load_all().await?;
        let now = Instant::now();
        let mut stats = RestoreStats::default();

        for stored in data.retained {
            let message = RetainedMessage::from(stored);
            if message.is_expired(now) {
                self.engine.persist(PersistenceOp::DeleteRetained {
                    topic: message.topic.to_string(),
                });
                stats.discarded += 1;
                continue;
            }
            self.engine.retained.restore(message);
            stats.retained += 1;
        }

        for stored in data.sessions {
            let session = stored.into_session(self.engine.config.max_queued_messages);
            if session.is_expired(now) {
                self.engine.persist(PersistenceOp::DeleteSession {
                    client_id: session.client_id.to_string(),
                });
                stats.discarded += 1;
                continue;
            }

            let client_id = session.client_id.clone();
            let subscriptions: Vec<_> = session.subscriptions().cloned().collect();

            if let Some(session_id) = self.engine.sessions.restore(session) {
                for s in subscriptions {
                    let subscriber = Subscriber::new(client_id.clone(), s.options)
                        .for_session(session_id)
                        .with_subscription_id(s.subscription_id);
                    self.engine.subscriptions.subscribe(&s.filter, subscriber);
                }
                stats.sessions += 1;
            }
        }

        info!(
            retained = stats.retained,
            sessions = stats.sessions,
            discarded = stats.discarded,
            "restored persistent state"
        );
        Ok(stats)
    }

    /// One pass of expiry and write-behind maintenance
    pub fn sweep(&self) -> SweepStats {
        let engine = &self.engine;
        let now = Instant::now();
        let mut stats = SweepStats {
            retained_expired: engine.retained.sweep(now),
            ..SweepStats::default()
        };

        for session in engine.sessions.expire(now) {
            let (client_id, session_id, filters): (Arc<str>, u64, Vec<String>) = {
                let s = session.read();
                (s.client_id.clone(), s.id, s.subscriptions.keys().cloned().collect())
            };
            engine.subscriptions.unsubscribe_all(
                &client_id,
                session_id,
                filters.iter().map(String::as_str),
            );
            engine.persist(PersistenceOp::DeleteSession {
                client_id: client_id.to_string(),
            });
            debug!(client_id = %client_id, "session expired");
            stats.sessions_expired += 1;
        }

        for session in engine.sessions.all() {
            let snapshot = {
                let mut s = session.write();
                stats.queued_expired += s.purge_expired(now);
                let offline = s.link().is_none();
                if s.dirty && offline && s.is_persistent() && engine.persistence.is_some() {
                    s.dirty = false;
                    Some(StoredSession::from(&*s))
                } else {
                    None
                }
            };
            if let Some(snapshot) = snapshot {
                engine.persist(PersistenceOp::SaveSession {
                    client_id: snapshot.client_id.clone(),
                    session: snapshot,
                });
                stats.sessions_saved += 1;
            }
        }

        stats
    }

    /// Sweep on the configured interval until `shutdown` resolves
    pub async fn run_maintenance<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.engine.config.expiry_check_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.sweep();
                    if stats != SweepStats::default() {
                        debug!(?stats, "maintenance sweep");
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        debug!("maintenance stopped");
    }
}
