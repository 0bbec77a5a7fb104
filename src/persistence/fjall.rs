//! Fjall storage backend
//!
//! One LSM-tree keyspace with a partition per record kind. Records are
//! bincode encoded and keyed by topic or client id.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredRetainedMessage, StoredSession};

pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    sessions: PartitionHandle,
}

impl FjallBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            retained,
            sessions,
        })
    }

    fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    fn get<T: bincode::Decode<()>>(partition: &PartitionHandle, key: &str) -> Result<Option<T>> {
        partition
            .get(key)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    fn list<T: bincode::Decode<()>>(partition: &PartitionHandle) -> Result<Vec<T>> {
        partition
            .iter()
            .map(|item| {
                let (_, value) = item?;
                Self::decode(&value)
            })
            .collect()
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn load_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Self::get(&self.retained, topic)
    }

    async fn save_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.retained.insert(topic, Self::encode(message)?)?;
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic)?;
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<StoredRetainedMessage>> {
        Self::list(&self.retained)
    }

    async fn load_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Self::get(&self.sessions, client_id)
    }

    async fn save_session(&self, client_id: &str, session: &StoredSession) -> Result<()> {
        self.sessions.insert(client_id, Self::encode(session)?)?;
        Ok(())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id)?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        Self::list(&self.sessions)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                PersistenceOp::SaveRetained { topic, message } => {
                    batch.insert(&self.retained, topic, Self::encode(&message)?);
                }
                PersistenceOp::DeleteRetained { topic } => batch.remove(&self.retained, topic),
                PersistenceOp::SaveSession { client_id, session } => {
                    batch.insert(&self.sessions, client_id, Self::encode(&session)?);
                }
                PersistenceOp::DeleteSession { client_id } => {
                    batch.remove(&self.sessions, client_id)
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}
