//! Persistence for sessions and retained messages.
//!
//! The engine never blocks on storage: writes are queued to a background
//! task that batches them into the backend. A write that cannot be queued
//! is reported to the caller, which logs it and carries on with the
//! in-memory state.
//!
//! Backends implement [`StorageBackend`]; [`FjallBackend`] is the bundled
//! LSM-tree store.

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{
    instant_to_unix_ms, unix_ms_to_instant, LoadedData, StoredInflightMessage, StoredProperties,
    StoredPublish, StoredQueuedMessage, StoredRetainedMessage, StoredSession, StoredSubscription,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const CHANNEL_CAPACITY: usize = 10_000;

/// Owns the background writer that batches operations into a backend
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let writer = tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size.max(1),
        ));

        Self {
            backend,
            tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Queue a write without waiting for it to reach storage
    pub fn write(&self, op: PersistenceOp) -> Result<()> {
        self.tx.try_send(op).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                PersistenceError::Unavailable("persistence queue full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                PersistenceError::Unavailable("persistence writer stopped")
            }
        })
    }

    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Drain queued writes, then flush and close the backend
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down persistence");

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!(error = %e, "persistence writer task failed");
            }
        }

        self.backend.flush().await?;
        self.backend.close().await?;
        info!("persistence shutdown complete");
        Ok(())
    }

    async fn commit(backend: &Arc<dyn StorageBackend>, batch: &mut Vec<PersistenceOp>, why: &str) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match backend.batch_write(std::mem::take(batch)).await {
            Ok(()) => debug!(count, trigger = why, "flushed persistence batch"),
            Err(e) => error!(count, trigger = why, error = %e, "failed to write persistence batch"),
        }
    }

    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: oneshot::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => match op {
                    Some(op) => {
                        batch.push(op);
                        if batch.len() >= max_batch_size {
                            Self::commit(&backend, &mut batch, "batch size").await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    Self::commit(&backend, &mut batch, "interval").await;
                }
                _ = &mut shutdown_rx => {
                    rx.close();
                    while let Some(op) = rx.recv().await {
                        batch.push(op);
                    }
                    break;
                }
            }
        }

        Self::commit(&backend, &mut batch, "shutdown").await;
        debug!("persistence writer exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn retained(topic: &str, payload: &[u8]) -> StoredRetainedMessage {
        StoredRetainedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: 1,
            properties: StoredProperties::default(),
            published_at_ms: 1_700_000_000_000,
        }
    }

    fn session(client_id: &str) -> StoredSession {
        StoredSession {
            client_id: client_id.to_string(),
            session_expiry_interval: 60,
            subscriptions: vec![StoredSubscription {
                filter: "a/#".to_string(),
                options: 1,
                subscription_id: None,
            }],
            queued: Vec::new(),
            inflight: Vec::new(),
            disconnected_at_ms: Some(1_700_000_000_000),
        }
    }

    #[tokio::test]
    async fn test_fjall_backend_retained() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(dir.path()).unwrap();

        backend
            .save_retained("test/topic", &retained("test/topic", &[1, 2, 3]))
            .await
            .unwrap();
        let loaded = backend.load_retained("test/topic").await.unwrap().unwrap();
        assert_eq!(loaded.payload, vec![1, 2, 3]);

        backend.delete_retained("test/topic").await.unwrap();
        assert!(backend.load_retained("test/topic").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fjall_backend_batch_write() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(dir.path()).unwrap();
        backend.save_retained("t1", &retained("t1", &[1])).await.unwrap();

        let ops = vec![
            PersistenceOp::SaveRetained {
                topic: "t2".to_string(),
                message: retained("t2", &[2]),
            },
            PersistenceOp::DeleteRetained {
                topic: "t1".to_string(),
            },
            PersistenceOp::SaveSession {
                client_id: "c1".to_string(),
                session: session("c1"),
            },
        ];
        backend.batch_write(ops).await.unwrap();

        let data = backend.load_all().await.unwrap();
        assert_eq!(data.retained.len(), 1);
        assert_eq!(data.retained[0].topic, "t2");
        assert_eq!(data.sessions, vec![session("c1")]);
    }

    #[tokio::test]
    async fn test_manager_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FjallBackend::open(dir.path()).unwrap());
        let manager = PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 1000);

        manager
            .write(PersistenceOp::SaveSession {
                client_id: "c1".to_string(),
                session: session("c1"),
            })
            .unwrap();
        manager
            .write(PersistenceOp::SaveRetained {
                topic: "t".to_string(),
                message: retained("t", b"v"),
            })
            .unwrap();
        manager.shutdown().await.unwrap();

        assert!(matches!(
            manager.write(PersistenceOp::DeleteSession {
                client_id: "c1".to_string()
            }),
            Err(PersistenceError::Unavailable(_))
        ));

        let data = backend.load_all().await.unwrap();
        assert_eq!(data.sessions.len(), 1);
        assert_eq!(data.retained.len(), 1);
    }
}
