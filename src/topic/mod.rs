//! Topic matching and the global subscription index
//!
//! Sessions own their subscription sets; this index mirrors every session's
//! filters in a trie so a publish finds its subscribers without visiting
//! each session.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    has_wildcards, match_filters, parse_shared, topic_matches_filter, validate_topic_filter,
    validate_topic_name,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::SubscriptionOptions;

/// One session's subscription as stored in the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    /// Id of the session that made the subscription
    pub session_id: u64,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
    /// The full `$share/{group}/{filter}` for shared subscriptions
    pub shared_filter: Option<Arc<str>>,
}

impl Subscriber {
    pub fn new(client_id: Arc<str>, options: SubscriptionOptions) -> Self {
        Self {
            client_id,
            session_id: 0,
            options,
            subscription_id: None,
            shared_filter: None,
        }
    }

    pub fn with_subscription_id(mut self, id: Option<u32>) -> Self {
        self.subscription_id = id;
        self
    }

    pub fn for_session(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn is_shared(&self) -> bool {
        self.shared_filter.is_some()
    }
}

/// Thread-safe subscription index: written on SUBSCRIBE/UNSUBSCRIBE, read by
/// every publish.
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscriber>>>,
    /// Round-robin cursor per shared subscription, keyed by its full filter
    share_cursors: DashMap<Arc<str>, AtomicUsize>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            share_cursors: DashMap::new(),
        }
    }

    /// Insert or replace the subscription `subscriber.client_id` holds on
    /// `filter`.
    ///
    /// An entry written by a newer session of the same client is kept.
    pub fn subscribe(&self, filter: &str, mut subscriber: Subscriber) {
        let inner = match parse_shared(filter) {
            Some((_, inner)) => {
                subscriber.shared_filter = Some(filter.into());
                inner
            }
            None => filter,
        };

        let mut trie = self.trie.write();
        let subs = trie.entry(inner).get_or_insert_with(Vec::new);
        match subs.iter_mut().find(|s| {
            s.client_id == subscriber.client_id && s.shared_filter == subscriber.shared_filter
        }) {
            Some(existing) if existing.session_id > subscriber.session_id => {}
            Some(existing) => *existing = subscriber,
            None => subs.push(subscriber),
        }
    }

    /// Remove `client_id`'s subscription on `filter`; true if one existed
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        self.remove(filter, client_id, None)
    }

    /// Remove every listed filter that session `session_id` of `client_id`
    /// subscribed to. Entries of a newer session stay.
    pub fn unsubscribe_all<'a, I>(&self, client_id: &str, session_id: u64, filters: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for filter in filters {
            self.remove(filter, client_id, Some(session_id));
        }
    }

    fn remove(&self, filter: &str, client_id: &str, session_id: Option<u64>) -> bool {
        let (inner, shared) = match parse_shared(filter) {
            Some((_, inner)) => (inner, Some(filter)),
            None => (filter, None),
        };

        let (removed, share_left) = {
            let mut trie = self.trie.write();
            let Some(subs) = trie.get_mut(inner) else {
                return false;
            };

            let before = subs.len();
            subs.retain(|s| {
                let same = &*s.client_id == client_id
                    && s.shared_filter.as_deref() == shared
                    && session_id.is_none_or(|id| s.session_id == id);
                !same
            });
            let removed = subs.len() != before;
            let share_left = subs.iter().any(|s| s.shared_filter.as_deref() == shared);
            if subs.is_empty() {
                trie.remove(inner);
            }
            (removed, share_left)
        };

        if let Some(shared) = shared {
            if removed && !share_left {
                self.share_cursors.remove(shared);
            }
        }
        removed
    }

    /// Subscribers whose filters match `topic`.
    ///
    /// Each shared subscription contributes one member, chosen round-robin.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscriber; 16]> {
        let mut result: SmallVec<[Subscriber; 16]> = SmallVec::new();
        let mut shares: AHashMap<Arc<str>, SmallVec<[Subscriber; 4]>> = AHashMap::new();

        self.trie.read().matches(topic, |subs| {
            for sub in subs {
                match &sub.shared_filter {
                    Some(shared) => shares.entry(shared.clone()).or_default().push(sub.clone()),
                    None => result.push(sub.clone()),
                }
            }
        });

        for (shared, members) in shares {
            let cursor = self
                .share_cursors
                .entry(shared)
                .or_insert_with(|| AtomicUsize::new(0));
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            result.push(members[idx].clone());
        }

        result
    }

    /// Number of shared subscriptions with a round-robin cursor
    pub fn share_cursor_count(&self) -> usize {
        self.share_cursors.len()
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
