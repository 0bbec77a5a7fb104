//! MQTT v5 packets handled by the engine
//!
//! `Packet` is the closed set of events a connection exchanges with the
//! engine. Inbound kinds are dispatched by `Connection::handle`; outbound
//! kinds are pushed onto the connection's outbound channel.

use std::sync::Arc;

use bytes::Bytes;

use super::{Properties, QoS, ReasonCode, SubscriptionOptions};

/// MQTT packet
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

impl Packet {
    /// Packet name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier, empty to request an assigned one
    pub client_id: String,
    /// Discard any existing session state
    pub clean_start: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    pub properties: Properties,
}

impl Connect {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
        }
    }
}

/// Last-Will message declared at CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Will properties, including the will delay interval
    pub properties: Properties,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

/// PUBLISH packet (bidirectional)
///
/// The topic is an `Arc<str>` so fan-out clones stay O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// Topic name, empty when only a topic alias is carried
    pub topic: Arc<str>,
    /// Present only for QoS > 0
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Properties,
}

impl Publish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            ..Self::default()
        }
    }
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
            properties: Properties::default(),
        }
    }
}

macro_rules! ack_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
            pub reason_code: ReasonCode,
            pub properties: Properties,
        }

        impl $name {
            pub fn new(packet_id: u16) -> Self {
                Self::with_reason(packet_id, ReasonCode::Success)
            }

            pub fn with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
                Self {
                    packet_id,
                    reason_code,
                    properties: Properties::default(),
                }
            }
        }
    };
}

ack_packet!(
    /// PUBACK packet (QoS 1 acknowledgment)
    PubAck
);
ack_packet!(
    /// PUBREC packet (QoS 2, step 1)
    PubRec
);
ack_packet!(
    /// PUBREL packet (QoS 2, step 2)
    PubRel
);
ack_packet!(
    /// PUBCOMP packet (QoS 2, step 3)
    PubComp
);

/// Topic filter with its options, as requested in SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, options: SubscriptionOptions) -> Self {
        Self {
            filter: filter.into(),
            options,
        }
    }
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
    /// May carry one subscription identifier
    pub properties: Properties,
}

impl Subscribe {
    pub fn new(packet_id: u16, subscriptions: Vec<Subscription>) -> Self {
        Self {
            packet_id,
            subscriptions,
            properties: Properties::default(),
        }
    }
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One reason code per requested filter, in request order
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl Unsubscribe {
    pub fn new(packet_id: u16, filters: Vec<String>) -> Self {
        Self {
            packet_id,
            filters,
            properties: Properties::default(),
        }
    }
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

/// DISCONNECT packet (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Disconnect {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::default(),
        }
    }
}
