//! Per-connection protocol state machine
//!
//! A [`Connection`] is created by a successful CONNECT and consumes one
//! decoded packet at a time. Everything it sends back, including messages
//! delivered by other clients' publishes, goes out through the single
//! outbound channel returned in [`ClientLink`].

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;


use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::Engine;
use crate::hooks::ClientInfo;
use crate::protocol::{ConnAck, Disconnect, Packet, ProtocolError, ReasonCode};
use crate::session::{Session, TopicAliasTable};

/// CONNECT refused; the CONNACK carries the reason
#[derive(Debug)]
pub enum ConnectError {
    Refused(ConnAck),
}

impl ConnectError {
    fn refused(reason_code: ReasonCode) -> Self {
        ConnectError::Refused(ConnAck {
            session_present: false,
            reason_code,
            ..ConnAck::default()
        })
    }

    pub fn reason_code(&self) -> ReasonCode {
        match self {
            ConnectError::Refused(connack) => connack.reason_code,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Refused(connack) => write!(f, "connect refused: {}", connack.reason_code),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Why a connection stopped accepting packets
#[derive(Debug)]
pub enum ConnectionError {
    /// The client broke the protocol; a DISCONNECT with the matching reason
    /// code has been sent
    Protocol(ProtocolError),
    /// Unauthorized publish with disconnect-on-unauthorized enabled
    NotAuthorized,
    /// Another connection took over the session
    SessionTakenOver,
    /// Packet received after the connection closed
    Closed,
}

impl ConnectionError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            ConnectionError::Protocol(e) => e.reason_code(),
            ConnectionError::NotAuthorized => ReasonCode::NotAuthorized,
            ConnectionError::SessionTakenOver => ReasonCode::SessionTakenOver,
            ConnectionError::Closed => ReasonCode::Success,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::NotAuthorized => write!(f, "Not authorized"),
            ConnectionError::SessionTakenOver => write!(f, "Session taken over"),
            ConnectionError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Result of an accepted CONNECT
pub struct ClientLink {
    pub connection: Connection,
    /// Outbound packets, starting with the CONNACK
    pub outbound: mpsc::UnboundedReceiver<Packet>,
}

pub struct Connection {
    engine: Arc<Engine>,
    client_id: Arc<str>,
    username: Option<String>,
    connection_id: u64,
    session: Arc<RwLock<Session>>,
    /// Client-to-server topic aliases
    aliases: TopicAliasTable,
    tx: mpsc::UnboundedSender<Packet>,
    closed: bool,
}

impl Connection {
    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn client(&self) -> ClientInfo<'_> {
        ClientInfo {
            client_id: &self.client_id,
            username: self.username.as_deref(),
        }
    }

    fn send(&self, packet: Packet) {
        trace!(client_id = %self.client_id, packet = packet.name(), "send");
        if self.tx.send(packet).is_err() {
            debug!(client_id = %self.client_id, "outbound channel closed");
        }
    }

    fn is_current(&self) -> bool {
        self.session.read().is_attached_to(self.connection_id)
    }

    /// Process one inbound packet.
    ///
    /// Errors are terminal: the connection is closed and the transport
    /// should be dropped once the outbound channel is drained.
    pub async fn handle(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        if !self.is_current() {
            self.closed = true;
            return Err(ConnectionError::SessionTakenOver);
        }

        trace!(client_id = %self.client_id, packet = packet.name(), "handle");
        let result = match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(ack) => self.handle_puback(ack),
            Packet::PubRec(rec) => self.handle_pubrec(rec),
            Packet::PubRel(rel) => self.handle_pubrel(rel),
            Packet::PubComp(comp) => self.handle_pubcomp(comp),
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe),
            Packet::PingReq => {
                self.send(Packet::PingResp);
                Ok(())
            }
            Packet::Disconnect(disconnect) => self.handle_disconnect(disconnect).await,
            Packet::Connect(_) => Err(ProtocolError::Violation("second CONNECT").into()),
            other => {
                debug!(client_id = %self.client_id, packet = other.name(), "unexpected packet");
                Err(ProtocolError::Violation("packet not accepted from client").into())
            }
        };

        if let Err(e) = &result {
            match e {
                ConnectionError::Protocol(_) | ConnectionError::NotAuthorized => {
                    debug!(client_id = %self.client_id, error = %e, "closing connection");
                    self.send(Packet::Disconnect(Disconnect::new(e.reason_code())));
                    self.close(true).await;
                }
                ConnectionError::SessionTakenOver | ConnectionError::Closed => {
                    self.closed = true;
                }
            }
        }
        result
    }

    /// Transport lost without DISCONNECT; the will becomes eligible
    pub async fn connection_lost(&mut self) {
        self.close(true).await;
    }
}
