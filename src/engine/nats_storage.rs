// NATS storage implementation for the cloud cache queues
// This provides durable, restart-safe queues using a NATS JetStream key-value bucket

//! # NATS Queue Storage
//!
//! This module provides a JetStream KV implementation of the [`QueueStore`]
//! trait, so cached results survive a manager restart.
//!
//! ## Layout
//!
//! One KV key per cache holds the whole [`QueueSet`] as JSON. Every mutation is
//! a read-modify-write guarded by the entry's revision:
//!
//! 1. read the document and its revision
//! 2. apply the operation to the decoded `QueueSet`
//! 3. `update(key, value, revision)`; if another writer got there first the
//!    revision no longer matches and the whole step is retried
//!
//! That makes every `QueueStore` operation atomic, including the moves between
//! `PENDING`, `WORK` and `FAIL_*` that span several queues.
//!
//! ## Document Size
//!
//! A KV value cannot be larger than the server's `max_payload` (1 MB by
//! default). Before writing, the encoded document is checked against
//! `max_document_bytes`, lowered to the server limit on connect. A write that
//! would not fit fails with `storage_full` and leaves the stored document as
//! it was, so queued batches are kept and only the new entries are refused.
//! Size `max_pending` so a full cache stays below the limit.
//!
//! ## Bucket Configuration
//!
//! - **Storage Type**: File-based for persistence
//! - **History**: 1, only the latest document matters

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::storage::{PushOutcome, QueueSet, QueueStore};
use crate::{EdmpError, Result};

/// Give up after this many lost compare-and-swap races in a row
const MAX_CAS_ATTEMPTS: usize = 16;

/// Room left under `max_payload` for the message headers
const HEADER_HEADROOM: usize = 4 * 1024;

/// Configuration for NATS queue storage
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// NATS server URLs
    pub nats_urls: Vec<String>,
    pub bucket: String,
    /// Key of the queue document inside the bucket
    pub key: String,
    pub max_bytes: i64,
    /// Largest queue document written to the bucket
    pub max_document_bytes: usize,
    pub connection_timeout: Duration,
}

impl Default for NatsQueueConfig {
    fn default() -> Self {
        Self {
            nats_urls: vec!["nats://localhost:4222".to_string()],
            bucket: "edmp_cloud_cache".to_string(),
            key: "queues".to_string(),
            max_bytes: 256 * 1024 * 1024, // 256MB
            max_document_bytes: 1024 * 1024 - HEADER_HEADROOM,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// JetStream KV backed queue store
pub struct NatsQueueStore {
    store: kv::Store,
    key: String,
    max_document_bytes: usize,
}

impl NatsQueueStore {
    /// Connect and make sure the bucket exists
    pub async fn connect(config: &NatsQueueConfig) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout)
            .connect(config.nats_urls.join(",").as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to NATS: {}", e))?;
        let max_payload = client.server_info().max_payload;
        let max_document_bytes = if max_payload > HEADER_HEADROOM {
            config.max_document_bytes.min(max_payload - HEADER_HEADROOM)
        } else {
            config.max_document_bytes
        };
        let js = jetstream::new(client);

        let store = match js.get_key_value(&config.bucket).await {
            Ok(store) => {
                debug!("Using existing KV bucket: {}", config.bucket);
                store
            }
            Err(_) => {
                info!("Creating KV bucket: {}", config.bucket);
                js.create_key_value(kv::Config {
                    bucket: config.bucket.clone(),
                    description: "EDMP cloud cache queues".to_string(),
                    history: 1,
                    max_bytes: config.max_bytes,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create KV bucket {}: {}", config.bucket, e))?
            }
        };

        debug!(max_document_bytes, "queue document size limit");
        Ok(Self::from_store(store, config.key.clone(), max_document_bytes))
    }

    /// Use an already opened bucket
    pub fn from_store(store: kv::Store, key: impl Into<String>, max_document_bytes: usize) -> Self {
        Self {
            store,
            key: key.into(),
            max_document_bytes,
        }
    }

    /// Current document and its revision (None when the key was never written)
    async fn load(&self) -> Result<(QueueSet, Option<u64>)> {
        let entry = self
            .store
            .entry(&self.key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read queue document: {}", e))?;

        match entry {
            Some(entry) if entry.operation == kv::Operation::Put => {
                let mut set = decode(&entry.value)?;
                set.purge(Utc::now());
                Ok((set, Some(entry.revision)))
            }
            Some(entry) => Ok((QueueSet::default(), Some(entry.revision))),
            None => Ok((QueueSet::default(), None)),
        }
    }

    /// Apply `operation` atomically, retrying on revision conflicts
    async fn mutate<R, F>(&self, mut operation: F) -> Result<R>
    where
        F: FnMut(&mut QueueSet) -> Result<R> + Send,
        R: Send,
    {
        let mut last_error = None;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let (mut set, revision) = self.load().await?;
            let outcome = operation(&mut set)?;
            let value = encode(&set)?;
            check_size(value.len(), self.max_document_bytes)?;

            let written = match revision {
                Some(revision) => self
                    .store
                    .update(&self.key, value, revision)
                    .await
                    .map_err(|e| e.to_string()),
                None => self
                    .store
                    .create(&self.key, value)
                    .await
                    .map_err(|e| e.to_string()),
            };
            match written {
                Ok(_) => return Ok(outcome),
                Err(e) => {
                    debug!(attempt, error = %e, "queue document changed underneath, retrying");
                    last_error = Some(e);
                }
            }
        }
        Err(anyhow::anyhow!(
            "Failed to update queue document after {} attempts: {}",
            MAX_CAS_ATTEMPTS,
            last_error.unwrap_or_default()
        )
        .into())
    }
}

fn encode(set: &QueueSet) -> Result<Bytes> {
    serde_json::to_vec(set)
        .map(Bytes::from)
        .map_err(|e| anyhow::anyhow!("Failed to serialize queue document: {}", e).into())
}

/// Refuse documents the server would reject as too large
fn check_size(len: usize, limit: usize) -> Result<()> {
    if len > limit {
        warn!(len, limit, "queue document would exceed the size limit");
        return Err(EdmpError::StorageFull(format!(
            "queue document of {} bytes exceeds the {} byte limit",
            len, limit
        )));
    }
    Ok(())
}

fn decode(bytes: &[u8]) -> Result<QueueSet> {
    if bytes.is_empty() {
        return Ok(QueueSet::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| anyhow::anyhow!("Failed to deserialize queue document: {}", e).into())
}

#[async_trait::async_trait]
impl QueueStore for NatsQueueStore {
    async fn push(&self, key: &str, entries: Vec<String>, max_len: usize) -> Result<PushOutcome> {
        self.mutate(|set| Ok(set.push(key, entries.clone(), max_len))).await
    }

    async fn dequeue_batch(&self, source: &str, work: &str, count: usize) -> Result<Vec<String>> {
        self.mutate(|set| Ok(set.dequeue_batch(source, work, count))).await
    }

    async fn rename(&self, from: &str, to: &str, ttl: Option<Duration>) -> Result<()> {
        self.mutate(|set| set.rename(from, to, ttl, Utc::now())).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.mutate(|set| Ok(set.delete(key))).await
    }

    async fn len(&self, key: &str) -> Result<usize> {
        Ok(self.load().await?.0.len(key))
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.load().await?.0.range(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.load().await?.0.keys(prefix))
    }
}
