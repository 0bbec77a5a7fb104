//! DISCONNECT handling and connection teardown

use tokio::time::Instant;
use tracing::{debug, info};

use super::{Connection, ConnectionError};
use crate::persistence::{PersistenceOp, StoredSession};
use crate::protocol::{Disconnect, ProtocolError, ReasonCode};

impl Connection {
    pub(super) async fn handle_disconnect(
        &mut self,
        disconnect: Disconnect,
    ) -> Result<(), ConnectionError> {
        if let Some(requested) = disconnect.properties.session_expiry_interval {
            let mut s = self.session.write();
            if s.session_expiry_interval == 0 && requested != 0 {
                drop(s);
                return Err(ProtocolError::Violation("session expiry raised from zero").into());
            }
            s.session_expiry_interval = requested.min(self.engine.config.max_session_expiry);
            s.dirty = true;
        }

        let publish_will = disconnect.reason_code == ReasonCode::DisconnectWithWill;
        debug!(
            client_id = %self.client_id,
            reason = %disconnect.reason_code,
            "client disconnect"
        );
        self.close(publish_will).await;
        Ok(())
    }

    /// Detach from the session and settle its fate.
    ///
    /// A session with expiry 0 is removed along with its subscriptions; any
    /// other is kept (and saved) for its expiry interval. The will is
    /// published or armed when `publish_will` is set and dropped otherwise.
    pub(super) async fn close(&mut self, publish_will: bool) {
        if self.closed {
            return;
        }
        self.closed = true;

        let engine = self.engine.clone();
        let now = Instant::now();

        let (will, expiry, session_id, filters, snapshot) = {
            let mut s = self.session.write();
            if !s.is_attached_to(self.connection_id) {
                debug!(client_id = %self.client_id, "close after takeover");
                return;
            }
            s.detach(now);
            let will = s.will.take();
            let expiry = s.session_expiry_interval;
            let filters: Vec<String> = if expiry == 0 {
                s.subscriptions.keys().cloned().collect()
            } else {
                Vec::new()
            };
            let snapshot = (expiry != 0 && engine.persistence.is_some()).then(|| {
                s.dirty = false;
                StoredSession::from(&*s)
            });
            (will, expiry, s.id, filters, snapshot)
        };

        if expiry == 0 {
            if engine.sessions.remove_if_current(&self.client_id, &self.session) {
                engine.subscriptions.unsubscribe_all(
                    &self.client_id,
                    session_id,
                    filters.iter().map(String::as_str),
                );
                engine.persist(PersistenceOp::DeleteSession {
                    client_id: self.client_id.to_string(),
                });
            }
        } else if let Some(snapshot) = snapshot {
            engine.persist(PersistenceOp::SaveSession {
                client_id: snapshot.client_id.clone(),
                session: snapshot,
            });
        }

        if let Some(will) = will.filter(|_| publish_will) {
            engine.schedule_will(self.client_id.clone(), will).await;
        }

        info!(
            client_id = %self.client_id,
            session_expiry = expiry,
            graceful = !publish_will,
            "client disconnected"
        );
        engine
            .hooks
            .on_client_disconnected(&self.client_id, !publish_will)
            .await;
    }
}
