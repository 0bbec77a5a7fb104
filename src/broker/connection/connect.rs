//! CONNECT handling: authentication, session open/resume, CONNACK

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{ClientLink, ConnectError, Connection};
use crate::broker::{will_publish, BrokerConfig, Engine};
use crate::hooks::AuthOutcome;
use crate::persistence::PersistenceOp;
use crate::protocol::{ConnAck, Connect, Disconnect, Packet, Properties, QoS, ReasonCode};
use crate::session::{SessionLink, TopicAliasTable, DEFAULT_RECEIVE_MAXIMUM};
use crate::topic::validate_topic_name;

/// Server-assigned identifier for a client that sent an empty one
fn assign_client_id(connection_id: u64) -> String {
    let salt = ahash::RandomState::new().hash_one(connection_id);
    format!("driftmq-{connection_id:x}-{salt:016x}")
}

fn connack_properties(
    config: &BrokerConfig,
    connect: &Connect,
    session_expiry: u32,
    assigned: Option<&str>,
) -> Properties {
    let mut props = Properties {
        session_expiry_interval: connect
            .properties
            .session_expiry_interval
            .map(|_| session_expiry),
        assigned_client_identifier: assigned.map(str::to_string),
        topic_alias_maximum: Some(config.topic_alias_maximum).filter(|&m| m > 0),
        ..Properties::default()
    };
    if config.server_keep_alive > 0 {
        props.server_keep_alive = Some(config.server_keep_alive);
    }
    if config.receive_maximum != DEFAULT_RECEIVE_MAXIMUM {
        props.receive_maximum = Some(config.receive_maximum);
    }
    if config.max_qos < QoS::ExactlyOnce {
        props.maximum_qos = Some(config.max_qos as u8);
    }
    if !config.retain_available {
        props.retain_available = Some(0);
    }
    if config.max_packet_size > 0 {
        props.maximum_packet_size = Some(config.max_packet_size);
    }
    if !config.wildcard_subscriptions {
        props.wildcard_subscription_available = Some(0);
    }
    if !config.subscription_identifiers {
        props.subscription_identifier_available = Some(0);
    }
    if !config.shared_subscriptions {
        props.shared_subscription_available = Some(0);
    }
    props
}

/// Reject CONNECT contents the engine cannot honor
fn check_connect(config: &BrokerConfig, connect: &Connect) -> Result<(), ReasonCode> {
    if connect.properties.receive_maximum == Some(0) {
        return Err(ReasonCode::ProtocolError);
    }
    if connect.properties.maximum_packet_size == Some(0) {
        return Err(ReasonCode::ProtocolError);
    }
    if connect.client_id.is_empty() && !connect.clean_start {
        return Err(ReasonCode::ClientIdNotValid);
    }
    if let Some(will) = &connect.will {
        if validate_topic_name(&will.topic, config.max_topic_levels).is_err() {
            return Err(ReasonCode::TopicNameInvalid);
        }
        if will.qos > config.max_qos {
            return Err(ReasonCode::QoSNotSupported);
        }
        if will.retain && !config.retain_available {
            return Err(ReasonCode::RetainNotSupported);
        }
    }
    Ok(())
}

impl Connection {
    pub(crate) async fn open(
        engine: Arc<Engine>,
        connect: Connect,
    ) -> Result<ClientLink, ConnectError> {
        let config = &engine.config;
        check_connect(config, &connect).map_err(ConnectError::refused)?;

        let connection_id = engine.sessions.next_connection_id();
        let assigned = connect
            .client_id
            .is_empty()
            .then(|| assign_client_id(connection_id));
        let client_id: Arc<str> = Arc::from(assigned.as_deref().unwrap_or(&connect.client_id));

        let password = connect.password.as_deref();
        match engine
            .hooks
            .on_authenticate(&client_id, connect.username.as_deref(), password)
            .await
        {
            Ok(AuthOutcome::Accept) => {}
            Ok(AuthOutcome::BadCredentials) => {
                debug!(client_id = %client_id, "bad credentials");
                return Err(ConnectError::refused(ReasonCode::BadUserNameOrPassword));
            }
            Ok(AuthOutcome::NotAuthorized) => {
                debug!(client_id = %client_id, "connect not authorized");
                return Err(ConnectError::refused(ReasonCode::NotAuthorized));
            }
            Err(e) => {
                error!(client_id = %client_id, error = %e, "authentication hook failed");
                return Err(ConnectError::refused(ReasonCode::UnspecifiedError));
            }
        }

        // A reconnect suppresses a will still waiting out its delay
        engine.wills.cancel(&client_id);

        let now = Instant::now();
        let opened = engine.sessions.open(&client_id, connect.clean_start, now);

        // Wills of a connection that lost its session to this one
        let mut orphaned = Vec::new();

        if let Some(old) = opened.discarded {
            let (link, old_id, filters) = {
                let mut s = old.write();
                let link = s.detach(now);
                if link.is_some() {
                    orphaned.extend(s.will.take());
                }
                (link, s.id, s.subscriptions.keys().cloned().collect::<Vec<_>>())
            };
            if let Some(link) = link {
                link.send(Packet::Disconnect(Disconnect::new(ReasonCode::SessionTakenOver)));
            }
            engine.subscriptions.unsubscribe_all(
                &client_id,
                old_id,
                filters.iter().map(String::as_str),
            );
        }
        if connect.clean_start {
            engine.persist(PersistenceOp::DeleteSession {
                client_id: client_id.to_string(),
            });
        }

        let session_expiry = connect
            .properties
            .session_expiry_interval
            .unwrap_or(0)
            .min(config.max_session_expiry);

        let (tx, rx) = mpsc::unbounded_channel();
        let connack = ConnAck {
            session_present: opened.present,
            reason_code: ReasonCode::Success,
            properties: connack_properties(config, &connect, session_expiry, assigned.as_deref()),
        };
        // CONNACK goes out before anything the resumed session replays
        let _ = tx.send(Packet::ConnAck(connack));

        let link = SessionLink::new(
            connection_id,
            tx.clone(),
            connect.properties.topic_alias_maximum.unwrap_or(0),
        );
        let receive_maximum = connect
            .properties
            .receive_maximum
            .unwrap_or(DEFAULT_RECEIVE_MAXIMUM);

        {
            let mut s = opened.session.write();
            s.session_expiry_interval = session_expiry;
            let previous_will = std::mem::replace(&mut s.will, connect.will);
            s.dirty = true;
            if let Some(previous) = s.attach(link, receive_maximum) {
                debug!(client_id = %client_id, "session taken over");
                previous.send(Packet::Disconnect(Disconnect::new(ReasonCode::SessionTakenOver)));
                // The session lives on, so only an undelayed will is due
                orphaned.extend(
                    previous_will
                        .filter(|w| w.properties.will_delay_interval.unwrap_or(0) == 0),
                );
            }
            s.resume(now);
        }

        for will in orphaned {
            debug!(
                client_id = %client_id,
                topic = %will.topic,
                "publishing will of replaced connection"
            );
            engine.publish(Some(&*client_id), &will_publish(will)).await;
        }

        info!(
            client_id = %client_id,
            session_present = opened.present,
            session_expiry,
            "client connected"
        );
        engine
            .hooks
            .on_client_connected(&client_id, opened.present)
            .await;

        let connection = Connection {
            aliases: TopicAliasTable::new(config.topic_alias_maximum),
            username: connect.username,
            session: opened.session,
            engine,
            client_id,
            connection_id,
            tx,
            closed: false,
        };
        Ok(ClientLink {
            connection,
            outbound: rx,
        })
    }
}
