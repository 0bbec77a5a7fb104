//! Session lifecycle: create, resume, take over, expire

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::Session;

/// Result of [`SessionStore::open`]
pub struct OpenedSession {
    pub session: Arc<RwLock<Session>>,
    /// True when prior state was resumed
    pub present: bool,
    /// Session replaced by a clean start or found expired
    pub discarded: Option<Arc<RwLock<Session>>>,
}

/// Thread-safe session map keyed by client id.
///
/// Lock order is map shard, then session. Code holding a session lock never
/// calls back into the store.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    next_connection_id: AtomicU64,
    next_session_id: AtomicU64,
    max_queued: usize,
}

impl SessionStore {
    pub fn new(max_queued: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            max_queued,
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Find or create the session for a CONNECT.
    ///
    /// Existing state is resumed unless `clean_start` is set or it has
    /// expired, in which case a fresh session replaces it.
    pub fn open(&self, client_id: &Arc<str>, clean_start: bool, now: Instant) -> OpenedSession {
        match self.sessions.entry(client_id.clone()) {
            Entry::Occupied(mut entry) => {
                let resumable = !clean_start && !entry.get().read().is_expired(now);
                if resumable {
                    return OpenedSession {
                        session: entry.get().clone(),
                        present: true,
                        discarded: None,
                    };
                }
                let fresh = self.fresh(client_id);
                let old = entry.insert(fresh.clone());
                OpenedSession {
                    session: fresh,
                    present: false,
                    discarded: Some(old),
                }
            }
            Entry::Vacant(entry) => {
                let fresh = self.fresh(client_id);
                entry.insert(fresh.clone());
                OpenedSession {
                    session: fresh,
                    present: false,
                    discarded: None,
                }
            }
        }
    }

    fn fresh(&self, client_id: &Arc<str>) -> Arc<RwLock<Session>> {
        let mut session = Session::new(client_id.clone(), self.max_queued);
        session.id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(RwLock::new(session))
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    /// Insert a session loaded from storage unless one already exists.
    ///
    /// Returns the id assigned to it.
    pub fn restore(&self, mut session: Session) -> Option<u64> {
        match self.sessions.entry(session.client_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                session.id = id;
                entry.insert(Arc::new(RwLock::new(session)));
                Some(id)
            }
        }
    }

    /// Remove `session` if it is still the one registered for its client id
    pub fn remove_if_current(&self, client_id: &str, session: &Arc<RwLock<Session>>) -> bool {
        self.sessions
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Remove and return every session whose expiry interval has elapsed
    pub fn expire(&self, now: Instant) -> Vec<Arc<RwLock<Session>>> {
        let mut expired = Vec::new();
        self.sessions.retain(|_, session| {
            if session.read().is_expired(now) {
                expired.push(session.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Snapshot of all sessions, for sweeps that must not hold map locks
    pub fn all(&self) -> Vec<Arc<RwLock<Session>>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(1000)
    }
}
