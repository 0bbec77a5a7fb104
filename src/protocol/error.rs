//! Protocol violations that terminate a connection

use std::fmt;

use super::{QoS, ReasonCode};

/// A client broke the protocol; the connection is closed with a DISCONNECT
/// carrying [`ProtocolError::reason_code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Topic alias is 0 or above the advertised maximum
    TopicAliasOutOfRange { alias: u16, maximum: u16 },
    /// Empty topic referencing an alias with no mapping on this connection
    UnknownTopicAlias(u16),
    /// Invalid topic name in PUBLISH
    InvalidTopicName(&'static str),
    /// PUBLISH above the broker's maximum QoS
    QoSNotSupported(QoS),
    /// Retained PUBLISH while retain is unavailable
    RetainNotSupported,
    /// Too many unreleased inbound QoS 2 messages
    ReceiveMaximumExceeded,
    /// Subscription identifier sent while the feature is disabled
    SubscriptionIdentifiersNotSupported,
    /// Generic violation
    Violation(&'static str),
}

impl ProtocolError {
    /// Reason code for the server DISCONNECT
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::TopicAliasOutOfRange { .. } | Self::UnknownTopicAlias(_) => {
                ReasonCode::TopicAliasInvalid
            }
            Self::InvalidTopicName(_) => ReasonCode::TopicNameInvalid,
            Self::QoSNotSupported(_) => ReasonCode::QoSNotSupported,
            Self::RetainNotSupported => ReasonCode::RetainNotSupported,
            Self::ReceiveMaximumExceeded => ReasonCode::ReceiveMaximumExceeded,
            Self::SubscriptionIdentifiersNotSupported => {
                ReasonCode::SubscriptionIdentifiersNotSupported
            }
            Self::Violation(_) => ReasonCode::ProtocolError,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TopicAliasOutOfRange { alias, maximum } => {
                write!(f, "topic alias {} outside 1..={}", alias, maximum)
            }
            Self::UnknownTopicAlias(alias) => write!(f, "unknown topic alias: {}", alias),
            Self::InvalidTopicName(msg) => write!(f, "invalid topic name: {}", msg),
            Self::QoSNotSupported(qos) => write!(f, "QoS {} not supported", *qos as u8),
            Self::RetainNotSupported => write!(f, "retain not supported"),
            Self::ReceiveMaximumExceeded => write!(f, "receive maximum exceeded"),
            Self::SubscriptionIdentifiersNotSupported => {
                write!(f, "subscription identifiers not supported")
            }
            Self::Violation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
