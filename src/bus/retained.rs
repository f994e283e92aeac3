//! Retained message store
//!
//! Keeps the single most-recently-published retained message per exact
//! topic, bounded by `max_retained`. Backed by an `lru::LruCache`: storing
//! or resolving a topic touches it, and inserting past capacity evicts the
//! least-recently-touched topic.
//!
//! Publishing `retain: true` with a `null` payload acts as a tombstone and
//! clears the topic's entry, so producers can retract stale retained state.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::message::Message;
use super::pattern::TopicPattern;

/// Outcome of storing a retained message, used for stats bookkeeping.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Stored (or replaced the topic's previous value) without eviction.
    Stored,
    /// Stored, and the least-recently-touched topic was evicted to make room.
    Evicted(String),
    /// A null-payload tombstone removed the topic's entry.
    Cleared,
}

#[derive(Debug)]
pub struct RetainedStore {
    cache: LruCache<String, Arc<Message>>,
}

impl RetainedStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Store `message` under its exact topic, touching the entry.
    pub fn store(&mut self, message: Arc<Message>) -> StoreOutcome {
        if message.payload.is_null() {
            self.cache.pop(&message.topic);
            return StoreOutcome::Cleared;
        }

        let topic = message.topic.clone();
        match self.cache.push(topic.clone(), message) {
            // `push` returns the displaced pair: same key means a plain
            // replacement, a different key means an eviction.
            Some((old_topic, _)) if old_topic != topic => StoreOutcome::Evicted(old_topic),
            _ => StoreOutcome::Stored,
        }
    }

    /// All retained messages whose topic matches `pattern`, most recent
    /// first, touching each. Exact patterns resolve by direct lookup.
    pub fn resolve(&mut self, pattern: &TopicPattern) -> Vec<Arc<Message>> {
        if let Some(topic) = pattern.exact_topic() {
            return self.cache.get(topic).cloned().into_iter().collect();
        }

        let matching: Vec<String> = self
            .cache
            .iter()
            .filter(|(topic, _)| pattern.matches(topic))
            .map(|(topic, _)| topic.clone())
            .collect();

        matching
            .into_iter()
            .filter_map(|topic| self.cache.get(&topic).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
