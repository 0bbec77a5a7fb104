//! MQTT v5 reason codes surfaced to clients

use std::fmt;

macro_rules! reason_codes {
    ($($(#[$doc:meta])* $name:ident = $value:literal => $text:literal,)*) => {
        /// MQTT v5 reason code
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $($(#[$doc])* $name = $value,)*
        }

        impl ReasonCode {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($value => Some(ReasonCode::$name),)*
                    _ => None,
                }
            }

            /// Human readable description
            pub fn description(self) -> &'static str {
                match self {
                    $(ReasonCode::$name => $text,)*
                }
            }
        }
    };
}

reason_codes! {
    /// Success, normal disconnection, or granted QoS 0
    Success = 0x00 => "success",
    GrantedQoS1 = 0x01 => "granted QoS 1",
    GrantedQoS2 = 0x02 => "granted QoS 2",
    DisconnectWithWill = 0x04 => "disconnect with will message",
    NoMatchingSubscribers = 0x10 => "no matching subscribers",
    NoSubscriptionExisted = 0x11 => "no subscription existed",
    UnspecifiedError = 0x80 => "unspecified error",
    MalformedPacket = 0x81 => "malformed packet",
    ProtocolError = 0x82 => "protocol error",
    ImplementationError = 0x83 => "implementation specific error",
    ClientIdNotValid = 0x85 => "client identifier not valid",
    BadUserNameOrPassword = 0x86 => "bad user name or password",
    NotAuthorized = 0x87 => "not authorized",
    ServerUnavailable = 0x88 => "server unavailable",
    ServerBusy = 0x89 => "server busy",
    ServerShuttingDown = 0x8B => "server shutting down",
    SessionTakenOver = 0x8E => "session taken over",
    TopicFilterInvalid = 0x8F => "topic filter invalid",
    TopicNameInvalid = 0x90 => "topic name invalid",
    PacketIdInUse = 0x91 => "packet identifier in use",
    PacketIdNotFound = 0x92 => "packet identifier not found",
    ReceiveMaximumExceeded = 0x93 => "receive maximum exceeded",
    TopicAliasInvalid = 0x94 => "topic alias invalid",
    PacketTooLarge = 0x95 => "packet too large",
    QuotaExceeded = 0x97 => "quota exceeded",
    AdministrativeAction = 0x98 => "administrative action",
    PayloadFormatInvalid = 0x99 => "payload format invalid",
    RetainNotSupported = 0x9A => "retain not supported",
    QoSNotSupported = 0x9B => "QoS not supported",
    SharedSubscriptionsNotSupported = 0x9E => "shared subscriptions not supported",
    SubscriptionIdentifiersNotSupported = 0xA1 => "subscription identifiers not supported",
    WildcardSubscriptionsNotSupported = 0xA2 => "wildcard subscriptions not supported",
}

impl ReasonCode {
    /// Codes below 0x80 indicate success
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    pub fn is_error(self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), *self as u8)
    }
}
