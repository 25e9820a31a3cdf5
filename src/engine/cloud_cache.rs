// Cloud cache with at-least-once batch uplink

//! # Cloud Cache
//!
//! Results bound for the cloud are never posted inline. They are flattened,
//! rewritten into the uplink envelope and left-pushed onto `PENDING`. A periodic
//! uploader then drains the queues:
//!
//! ```text
//!   enqueue ──► PENDING ──(atomic move, batch_size)──► WORK ──POST──► 2xx: delete WORK
//!                                                        │
//!                                                        └── else: rename to FAIL_<nanos> (ttl = fail_ttl)
//! ```
//!
//! After a pending batch has been delivered, up to `retry_count` failure queues
//! are retried newest-first. A round with nothing pending retries nothing. A retry moves the failure queue back into `WORK`,
//! so there is never more than one batch in flight. A failure queue that fails
//! again is renamed to a fresh `FAIL_*` key, which restarts its TTL.
//!
//! Batches are only ever moved or renamed, never dropped, until they are
//! acknowledged or their failure TTL runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::events::EventPublisher;
use super::nats_storage::{NatsQueueConfig, NatsQueueStore};
use super::storage::{InMemoryQueueStore, PushOutcome, QueueStore};
use crate::models::event::tags::ServiceEvent;
use crate::models::result::{self, ResultMap};
use crate::utils::secs;
use crate::{EdmpError, Result};

pub const PENDING: &str = "PENDING";
pub const WORK: &str = "WORK";
pub const FAIL_PREFIX: &str = "FAIL_";

/// Backend holding the queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStore {
    #[default]
    Memory,
    Nats,
}

/// Cloud cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudCacheConfig {
    /// Uplink URL; results are still cached when unset
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub batch_size: usize,
    /// Cap on `PENDING`; the oldest entries are dropped beyond it (0 = unbounded)
    pub max_pending: usize,
    pub retry_count: usize,
    /// Seconds a failure queue is kept
    pub fail_ttl: f64,
    /// Seconds between uploader rounds
    pub upload_interval: f64,
    /// HTTP request timeout in seconds
    pub timeout: f64,
    pub store: CacheStore,
    pub nats_url: String,
    pub bucket: String,
}

impl Default for CloudCacheConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            batch_size: 100,
            max_pending: 100_000,
            retry_count: 3,
            fail_ttl: 7.0 * 24.0 * 3600.0,
            upload_interval: 60.0,
            timeout: 30.0,
            store: CacheStore::Memory,
            nats_url: "nats://localhost:4222".to_string(),
            bucket: "edmp_cloud_cache".to_string(),
        }
    }
}

/// Delivers one batch of envelopes
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, batch: &[Value]) -> Result<()>;
}

/// POSTs batches as a JSON array with `authorization: token <t>`
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl HttpUploader {
    pub fn new(endpoint: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| EdmpError::InvalidInput(format!("invalid cloud endpoint '{}': {}", endpoint, e)))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint, token))
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(client: reqwest::Client, endpoint: Url, token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint,
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, batch: &[Value]) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
            .json(batch)
            .send()
            .await
            .map_err(|e| EdmpError::UploadFailed(format!("POST {}: {}", self.endpoint, e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(EdmpError::UploadFailed(format!(
                "POST {} responded {}",
                self.endpoint, status
            )))
        }
    }
}

/// Outcome of one uploader round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UploadReport {
    /// Entries delivered from `PENDING`
    pub uploaded: usize,
    /// Failure queues delivered on retry
    pub retried: usize,
}

/// Queue sizes, as shown by the admin workflow
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CacheStatus {
    pub pending: usize,
    pub work: usize,
    pub failed_queues: usize,
    pub failed_entries: usize,
}

/// Durable three-queue cache in front of an [`Uploader`]
pub struct CloudCache {
    config: CloudCacheConfig,
    store: Arc<dyn QueueStore>,
    uploader: Option<Arc<dyn Uploader>>,
    /// Serializes upload rounds so only one batch is ever in flight
    round: Mutex<()>,
}

impl CloudCache {
    pub fn new(config: CloudCacheConfig, store: Arc<dyn QueueStore>, uploader: Option<Arc<dyn Uploader>>) -> Self {
        Self {
            config,
            store,
            uploader,
            round: Mutex::new(()),
        }
    }

    /// Open the configured store and build the HTTP uploader when an endpoint is set
    pub async fn from_config(config: CloudCacheConfig) -> Result<Self> {
        let store: Arc<dyn QueueStore> = match config.store {
            CacheStore::Memory => Arc::new(InMemoryQueueStore::new()),
            CacheStore::Nats => Arc::new(
                NatsQueueStore::connect(&NatsQueueConfig {
                    nats_urls: vec![config.nats_url.clone()],
                    bucket: config.bucket.clone(),
                    ..Default::default()
                })
                .await?,
            ),
        };

        let uploader: Option<Arc<dyn Uploader>> = match &config.endpoint {
            Some(endpoint) => Some(Arc::new(HttpUploader::new(
                endpoint,
                config.token.clone().unwrap_or_default(),
                secs(config.timeout),
            )?)),
            None => None,
        };

        Ok(Self::new(config, store, uploader))
    }

    pub fn config(&self) -> &CloudCacheConfig {
        &self.config
    }

    pub fn has_uploader(&self) -> bool {
        self.uploader.is_some()
    }

    /// Flatten a result and queue every piece for upload
    pub async fn enqueue(&self, result: ResultMap) -> Result<PushOutcome> {
        let entries = result::flatten(result)
            .iter()
            .map(|piece| serde_json::to_string(&result::to_cloud_envelope(piece)))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let outcome = self.store.push(PENDING, entries, self.config.max_pending).await?;
        if outcome.dropped > 0 {
            warn!(dropped = outcome.dropped, max_pending = self.config.max_pending, "cloud cache full, dropped oldest entries");
        }
        Ok(outcome)
    }

    /// One uploader round: the pending batch, then retries of failure queues
    ///
    /// A failed batch is preserved under a new `FAIL_*` key and the error is
    /// returned to the caller. Failure queues are only retried once a pending
    /// batch went through in the same round.
    pub async fn upload(&self) -> Result<UploadReport> {
        let Some(uploader) = self.uploader.clone() else {
            return Err(EdmpError::InvalidInput("cloud cache has no endpoint configured".to_string()));
        };
        let _round = self.round.lock().await;

        let batch = self
            .store
            .dequeue_batch(PENDING, WORK, self.config.batch_size)
            .await?;
        let mut report = UploadReport::default();

        if batch.is_empty() {
            return Ok(report);
        }
        self.deliver_work(uploader.as_ref(), &batch).await?;
        report.uploaded = batch.len();
        debug!(entries = batch.len(), "uploaded pending batch");

        report.retried = self.retry_failed(uploader.as_ref()).await?;
        Ok(report)
    }

    /// Upload the contents of `WORK`; on failure age it into a failure queue
    async fn deliver_work(&self, uploader: &dyn Uploader, batch: &[String]) -> Result<()> {
        let envelopes: Vec<Value> = batch.iter().map(|entry| decode_entry(entry)).collect();
        match uploader.upload(&envelopes).await {
            Ok(()) => {
                self.store.delete(WORK).await?;
                Ok(())
            }
            Err(e) => {
                let fail_key = fail_key();
                self.store
                    .rename(WORK, &fail_key, Some(secs(self.config.fail_ttl)))
                    .await?;
                warn!(queue = %fail_key, entries = batch.len(), error = %e, "upload failed, batch kept for retry");
                Err(e)
            }
        }
    }

    /// Retry up to `retry_count` failure queues, newest first
    async fn retry_failed(&self, uploader: &dyn Uploader) -> Result<usize> {
        let mut retried = 0;
        for fail_key in self.failure_queues().await?.into_iter().take(self.config.retry_count) {
            self.store.rename(&fail_key, WORK, None).await?;
            let batch = self.store.dequeue_batch(PENDING, WORK, 0).await?;
            if batch.is_empty() {
                self.store.delete(WORK).await?;
                continue;
            }
            match self.deliver_work(uploader, &batch).await {
                Ok(()) => {
                    info!(queue = %fail_key, entries = batch.len(), "failure queue delivered");
                    retried += 1;
                }
                // The uplink is still down; the rest can wait for the next round
                Err(e) => return Err(e),
            }
        }
        Ok(retried)
    }

    /// Failure queue names, newest first
    pub async fn failure_queues(&self) -> Result<Vec<String>> {
        let mut keys = self.store.keys(FAIL_PREFIX).await?;
        keys.sort_by_key(|key| std::cmp::Reverse(fail_stamp(key)));
        Ok(keys)
    }

    pub async fn status(&self) -> Result<CacheStatus> {
        let mut status = CacheStatus {
            pending: self.store.len(PENDING).await?,
            work: self.store.len(WORK).await?,
            ..Default::default()
        };
        for key in self.store.keys(FAIL_PREFIX).await? {
            status.failed_queues += 1;
            status.failed_entries += self.store.len(&key).await?;
        }
        Ok(status)
    }

    /// Run upload rounds every `upload_interval` seconds until cancelled
    ///
    /// Failed rounds publish `system/service/<manager>/failed` when lifecycle
    /// events are enabled.
    pub fn spawn_uploader(self: Arc<Self>, events: EventPublisher, cancel: CancellationToken) -> JoinHandle<()> {
        let period = secs(self.config.upload_interval).max(Duration::from_millis(10));
        tokio::spawn(async move {
            info!(interval = ?period, "cloud cache uploader started");
            // First round one period after start, not immediately
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.upload().await {
                            Ok(report) if report.uploaded + report.retried > 0 => {
                                debug!(uploaded = report.uploaded, retried = report.retried, "upload round finished");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "upload round failed");
                                if let EdmpError::UploadFailed(_) = e {
                                    if let Err(e) = events.emit_service(ServiceEvent::Failed, json!({"error": e.to_string()})) {
                                        warn!(error = %e, "failed to publish uploader failure event");
                                    }
                                }
                            }
                        }
                    }
                }
            }
            info!("cloud cache uploader stopped");
        })
    }
}

/// A fresh failure queue name, `FAIL_<utc-nanos>`
fn fail_key() -> String {
    let now = Utc::now();
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000));
    format!("{}{}", FAIL_PREFIX, nanos)
}

fn fail_stamp(key: &str) -> i64 {
    key.strip_prefix(FAIL_PREFIX)
        .and_then(|stamp| stamp.parse().ok())
        .unwrap_or(0)
}

fn decode_entry(entry: &str) -> Value {
    serde_json::from_str(entry).unwrap_or_else(|_| Value::String(entry.to_string()))
}
