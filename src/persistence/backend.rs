//! Storage backend contract

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// A single write, applied in order by [`StorageBackend::batch_write`]
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    SaveRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    DeleteRetained {
        topic: String,
    },
    SaveSession {
        client_id: String,
        session: StoredSession,
    },
    DeleteSession {
        client_id: String,
    },
}

impl PersistenceOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SaveRetained { .. } => "save_retained",
            Self::DeleteRetained { .. } => "delete_retained",
            Self::SaveSession { .. } => "save_session",
            Self::DeleteSession { .. } => "delete_session",
        }
    }
}

/// Durable store for sessions and retained messages
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn load_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    async fn save_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()>;

    async fn delete_retained(&self, topic: &str) -> Result<()>;

    async fn list_retained(&self) -> Result<Vec<StoredRetainedMessage>>;

    async fn load_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    async fn save_session(&self, client_id: &str, session: &StoredSession) -> Result<()>;

    async fn delete_session(&self, client_id: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<StoredSession>>;

    /// Apply all operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            sessions: self.list_sessions().await?,
        })
    }
}
