// Queue storage abstraction for the cloud cache
// This defines the interface for the durable PENDING / WORK / FAIL_* queues

//! # Queue Storage Abstraction Layer
//!
//! This module provides the storage abstraction the cloud cache sits on. The
//! cache only needs a handful of list operations, but two of them must be
//! **atomic**: moving a batch from `PENDING` into `WORK`, and renaming `WORK`
//! to a failure queue. Atomicity is the store's job, not the caller's.
//!
//! ## Storage Architecture
//!
//! The storage layer follows the **Repository Pattern**:
//! - **QueueStore trait**: Defines the interface for all queue operations
//! - **QueueSet**: The queue operations themselves, over a plain serializable value
//! - **InMemoryQueueStore**: A `QueueSet` behind a mutex
//! - **NatsQueueStore**: A `QueueSet` document in a JetStream KV bucket (see `nats_storage`)
//!
//! ## Queue Orientation
//!
//! Queues are lists with the newest entry on the left. `push` adds on the left,
//! batching takes from the right, so a batch is always oldest-first.
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! Rust's native async trait methods are not object safe yet. The
//! `async-trait` crate boxes the returned futures so the cache can hold an
//! `Arc<dyn QueueStore>` without knowing the backend.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EdmpError, Result};

/// What happened to a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    /// Entries appended
    pub accepted: usize,
    /// Oldest entries trimmed to honor the length cap
    pub dropped: usize,
    /// Queue length after the push
    pub len: usize,
}

/// Storage trait for the cloud cache queues
///
/// ## Return Value
/// Lookups on a key that does not exist behave like an empty queue. Only
/// `rename` treats a missing source as an error.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Left-push `entries` onto `key`; `max_len` of 0 means unbounded
    async fn push(&self, key: &str, entries: Vec<String>, max_len: usize) -> Result<PushOutcome>;

    /// Atomically claim a batch
    ///
    /// Returns the contents of `work` if it already exists. Otherwise moves up
    /// to `count` entries from the right of `source` into `work` and returns
    /// them oldest-first. An empty vector means there is nothing to do.
    async fn dequeue_batch(&self, source: &str, work: &str, count: usize) -> Result<Vec<String>>;

    /// Atomically rename `from` to `to`, replacing `to`, with an optional TTL
    async fn rename(&self, from: &str, to: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a queue; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn len(&self, key: &str) -> Result<usize>;

    /// Every entry of `key`, newest first
    async fn range(&self, key: &str) -> Result<Vec<String>>;

    /// Names of live queues starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoredQueue {
    /// Front is the newest entry
    items: VecDeque<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// A named set of queues with TTLs
///
/// Each method is one atomic step of a [`QueueStore`]; backends make them
/// atomic by holding a lock or by compare-and-swap on the serialized value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSet {
    queues: BTreeMap<String, StoredQueue>,
}

impl QueueSet {
    /// Drop queues whose TTL elapsed; returns how many were removed
    pub fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.queues.len();
        self.queues
            .retain(|_, queue| queue.expires_at.map_or(true, |at| at > now));
        before - self.queues.len()
    }

    pub fn push(&mut self, key: &str, entries: Vec<String>, max_len: usize) -> PushOutcome {
        let queue = self.queues.entry(key.to_string()).or_default();
        let accepted = entries.len();
        for entry in entries {
            queue.items.push_front(entry);
        }
        let mut dropped = 0;
        if max_len > 0 {
            while queue.items.len() > max_len {
                queue.items.pop_back();
                dropped += 1;
            }
        }
        PushOutcome {
            accepted,
            dropped,
            len: queue.items.len(),
        }
    }

    pub fn dequeue_batch(&mut self, source: &str, work: &str, count: usize) -> Vec<String> {
        if let Some(existing) = self.queues.get(work).filter(|q| !q.items.is_empty()) {
            return existing.items.iter().rev().cloned().collect();
        }

        let Some(pending) = self.queues.get_mut(source) else {
            return Vec::new();
        };
        let take = count.min(pending.items.len());
        let batch: Vec<String> = (0..take).filter_map(|_| pending.items.pop_back()).collect();
        if pending.items.is_empty() {
            self.queues.remove(source);
        }
        if !batch.is_empty() {
            self.queues.insert(
                work.to_string(),
                StoredQueue {
                    items: batch.iter().rev().cloned().collect(),
                    expires_at: None,
                },
            );
        }
        batch
    }

    pub fn rename(&mut self, from: &str, to: &str, ttl: Option<Duration>, now: DateTime<Utc>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                now + chrono::Duration::from_std(ttl)
                    .map_err(|e| EdmpError::InvalidInput(format!("ttl out of range: {}", e)))?,
            ),
            None => None,
        };
        let mut queue = self
            .queues
            .remove(from)
            .ok_or_else(|| EdmpError::NotFound(format!("queue '{}'", from)))?;
        queue.expires_at = expires_at;
        self.queues.insert(to.to_string(), queue);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.queues.remove(key).is_some()
    }

    pub fn len(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, |q| q.items.len())
    }

    pub fn range(&self, key: &str) -> Vec<String> {
        self.queues
            .get(key)
            .map(|q| q.items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.queues
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// In-memory queue store for development, tests and single-process deployments
///
/// Every operation runs under one mutex, so each one is atomic. Expired
/// queues are purged lazily whenever the set is touched.
///
/// ## Limitations
///
/// - **Not persistent**: queued results are lost when the process restarts
#[derive(Default)]
pub struct InMemoryQueueStore {
    queues: Mutex<QueueSet>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queues<R>(&self, f: impl FnOnce(&mut QueueSet) -> R) -> R {
        let mut queues = self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queues.purge(Utc::now());
        f(&mut queues)
    }
}

#[async_trait::async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push(&self, key: &str, entries: Vec<String>, max_len: usize) -> Result<PushOutcome> {
        Ok(self.with_queues(|queues| queues.push(key, entries, max_len)))
    }

    async fn dequeue_batch(&self, source: &str, work: &str, count: usize) -> Result<Vec<String>> {
        Ok(self.with_queues(|queues| queues.dequeue_batch(source, work, count)))
    }

    async fn rename(&self, from: &str, to: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_queues(|queues| queues.rename(from, to, ttl, Utc::now()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.with_queues(|queues| queues.delete(key)))
    }

    async fn len(&self, key: &str) -> Result<usize> {
        Ok(self.with_queues(|queues| queues.len(key)))
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.with_queues(|queues| queues.range(key)))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.with_queues(|queues| queues.keys(prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batches_are_oldest_first() {
        let store = InMemoryQueueStore::new();
        store.push("PENDING", entries(&["a", "b", "c"]), 0).await.unwrap();
        assert_eq!(store.range("PENDING").await.unwrap(), entries(&["c", "b", "a"]));

        let batch = store.dequeue_batch("PENDING", "WORK", 2).await.unwrap();
        assert_eq!(batch, entries(&["a", "b"]));
        assert_eq!(store.len("PENDING").await.unwrap(), 1);
        assert_eq!(store.len("WORK").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_existing_work_is_returned_first() {
        let store = InMemoryQueueStore::new();
        store.push("PENDING", entries(&["a", "b", "c"]), 0).await.unwrap();
        let first = store.dequeue_batch("PENDING", "WORK", 2).await.unwrap();
        // Nothing was acknowledged, so the same batch comes back
        let again = store.dequeue_batch("PENDING", "WORK", 2).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.len("PENDING").await.unwrap(), 1);

        store.delete("WORK").await.unwrap();
        assert_eq!(store.dequeue_batch("PENDING", "WORK", 2).await.unwrap(), entries(&["c"]));
        assert!(store.keys("PENDING").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_trims_oldest() {
        let store = InMemoryQueueStore::new();
        let outcome = store.push("PENDING", entries(&["1", "2", "3", "4"]), 3).await.unwrap();
        assert_eq!(outcome, PushOutcome { accepted: 4, dropped: 1, len: 3 });
        assert_eq!(store.range("PENDING").await.unwrap(), entries(&["4", "3", "2"]));
    }

    #[test]
    fn test_rename_with_ttl_expires() {
        let mut set = QueueSet::default();
        let now = Utc::now();
        set.push("WORK", entries(&["x"]), 0);
        set.rename("WORK", "FAIL_1", Some(Duration::from_secs(60)), now).unwrap();
        assert_eq!(set.keys("FAIL_"), entries(&["FAIL_1"]));
        assert_eq!(set.len("WORK"), 0);

        assert_eq!(set.purge(now + chrono::Duration::seconds(30)), 0);
        assert_eq!(set.purge(now + chrono::Duration::seconds(61)), 1);
        assert!(set.keys("FAIL_").is_empty());
    }

    #[tokio::test]
    async fn test_rename_missing_queue_fails() {
        let store = InMemoryQueueStore::new();
        let err = store.rename("WORK", "FAIL_1", None).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(!store.delete("WORK").await.unwrap());
    }

    #[test]
    fn test_queue_set_survives_serialization() {
        let mut set = QueueSet::default();
        set.push("PENDING", entries(&["a", "b"]), 0);
        set.rename("PENDING", "FAIL_9", Some(Duration::from_secs(5)), Utc::now()).unwrap();

        let restored: QueueSet = serde_json::from_slice(&serde_json::to_vec(&set).unwrap()).unwrap();
        assert_eq!(restored, set);
        assert_eq!(restored.range("FAIL_9"), entries(&["b", "a"]));
    }
}
