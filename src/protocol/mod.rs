//! MQTT v5 protocol types consumed and produced by the engine
//!
//! Byte-level framing belongs to an external codec; the engine only sees the
//! typed packets defined here.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::ProtocolError;
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Effective QoS for a delivery: the lower of the two levels
    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }

    /// SUBACK reason code granting this QoS
    pub fn granted(self) -> ReasonCode {
        match self {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }
}

/// When retained messages are replayed for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages on every subscribe
    #[default]
    SendAtSubscribe = 0,
    /// Send retained messages only if the subscription did not exist
    SendAtSubscribeIfNew = 1,
    /// Never send retained messages at subscribe time
    DoNotSend = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RetainHandling::SendAtSubscribe),
            1 => Some(RetainHandling::SendAtSubscribeIfNew),
            2 => Some(RetainHandling::DoNotSend),
            _ => None,
        }
    }

    /// Whether a subscribe call should trigger a retained replay
    pub fn replays(self, is_new_subscription: bool) -> bool {
        match self {
            RetainHandling::SendAtSubscribe => true,
            RetainHandling::SendAtSubscribeIfNew => is_new_subscription,
            RetainHandling::DoNotSend => false,
        }
    }
}

/// Per-subscription options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_retain_as_published(mut self, rap: bool) -> Self {
        self.retain_as_published = rap;
        self
    }

    pub fn with_retain_handling(mut self, handling: RetainHandling) -> Self {
        self.retain_handling = handling;
        self
    }

    /// Subscription options byte as carried in SUBSCRIBE
    pub fn from_byte(byte: u8) -> Option<Self> {
        // Reserved bits must be zero
        if (byte & 0xC0) != 0 {
            return None;
        }

        Some(Self {
            qos: QoS::from_u8(byte & 0x03)?,
            no_local: (byte & 0x04) != 0,
            retain_as_published: (byte & 0x08) != 0,
            retain_handling: RetainHandling::from_u8((byte >> 4) & 0x03)?,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | ((self.no_local as u8) << 2)
            | ((self.retain_as_published as u8) << 3)
            | ((self.retain_handling as u8) << 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_min() {
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.min(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert_eq!(QoS::AtLeastOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn test_retain_handling_replays() {
        assert!(RetainHandling::SendAtSubscribe.replays(false));
        assert!(RetainHandling::SendAtSubscribeIfNew.replays(true));
        assert!(!RetainHandling::SendAtSubscribeIfNew.replays(false));
        assert!(!RetainHandling::DoNotSend.replays(true));
    }

    #[test]
    fn test_subscription_options_byte() {
        let opts = SubscriptionOptions::from_byte(0b0010_1110).unwrap();
        assert_eq!(opts.qos, QoS::ExactlyOnce);
        assert!(opts.no_local);
        assert!(opts.retain_as_published);
        assert_eq!(opts.retain_handling, RetainHandling::DoNotSend);
        assert_eq!(opts.to_byte(), 0b0010_1110);

        assert!(SubscriptionOptions::from_byte(0x40).is_none());
        assert!(SubscriptionOptions::from_byte(0x03).is_none());
        assert!(SubscriptionOptions::from_byte(0x30).is_none());
    }
}
