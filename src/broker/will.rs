//! Delayed will publication
//!
//! Each pending will owns a timer task and an atomic state. Firing and
//! cancellation both claim the timer with a compare-and-swap out of
//! `ARMED`, so exactly one of them wins: a cancel that loses finds the will
//! already being published and leaves it alone.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

const ARMED: u8 = 0;
const FIRING: u8 = 1;
const CANCELLED: u8 = 2;

struct WillTimer {
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WillTimer {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ARMED),
            task: Mutex::new(None),
        }
    }

    fn claim(&self, next: u8) -> bool {
        self.state
            .compare_exchange(ARMED, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self) -> bool {
        if !self.claim(CANCELLED) {
            return false;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        true
    }
}

/// Pending will timers keyed by client id
#[derive(Default)]
pub struct WillScheduler {
    timers: Arc<DashMap<Arc<str>, Arc<WillTimer>>>,
}

impl WillScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` once `delay` has elapsed unless cancelled first.
    ///
    /// Arming replaces (and cancels) any timer already pending for the
    /// client.
    pub fn arm<F>(&self, client_id: Arc<str>, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timer = Arc::new(WillTimer::new());
        if let Some(previous) = self.timers.insert(client_id.clone(), timer.clone()) {
            previous.cancel();
        }

        let timers = self.timers.clone();
        let own = timer.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if own.claim(FIRING) {
                debug!(client_id = %client_id, "will delay elapsed");
                fire.await;
            }
            timers.remove_if(&client_id, |_, current| Arc::ptr_eq(current, &own));
        });

        // A cancel that ran before the handle was stored has already claimed
        // the timer; the task will find it CANCELLED when it wakes.
        if timer.state.load(Ordering::Acquire) == ARMED {
            *timer.task.lock() = Some(task);
        }
    }

    /// Suppress the pending will for `client_id`.
    ///
    /// Returns false if none is pending or it has already started firing.
    pub fn cancel(&self, client_id: &str) -> bool {
        match self.timers.remove(client_id) {
            Some((_, timer)) => {
                let cancelled = timer.cancel();
                if cancelled {
                    debug!(client_id, "pending will cancelled");
                }
                cancelled
            }
            None => false,
        }
    }

    pub fn is_pending(&self, client_id: &str) -> bool {
        self.timers
            .get(client_id)
            .is_some_and(|t| t.state.load(Ordering::Acquire) == ARMED)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
