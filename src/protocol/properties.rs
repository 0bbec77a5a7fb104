//! MQTT v5 properties carried by the packets the engine handles

use bytes::Bytes;

/// Collection of MQTT v5 properties
///
/// Every field is optional on the wire; absent values fall back to the
/// protocol defaults at the point of use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub will_delay_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Application message properties that travel with a forwarded PUBLISH.
    ///
    /// Topic aliases and subscription identifiers are connection and
    /// subscriber specific, so they are never copied from the inbound packet.
    pub fn forwarded(&self) -> Self {
        Self {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type.clone(),
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone(),
            user_properties: self.user_properties.clone(),
            ..Self::default()
        }
    }

    /// True if the payload is declared as UTF-8 text
    pub fn is_utf8_payload(&self) -> bool {
        self.payload_format_indicator == Some(1)
    }
}
