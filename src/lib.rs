//! DriftMQ - session and message-delivery engine for MQTT v5
//!
//! The engine matches publications to subscriptions, tracks in-flight QoS
//! state, keeps retained messages with their expiry, resolves topic aliases
//! and schedules delayed Last-Will messages. Packets arrive already decoded;
//! the wire codec and network listeners live outside this crate.

pub mod broker;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig, ClientLink, Connection, ConnectionError, DeliveryOutcome};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{Packet, QoS, ReasonCode};
pub use retained::RetainedStore;
pub use session::SessionStore;
