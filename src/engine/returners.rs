// Built-in returners: cloud, jsonl, log

//! # Built-in Returners
//!
//! Returners are the terminal sinks of a workflow. They run after the reply
//! has been sent, so their errors are logged and never reach the caller.
//!
//! - `cloud`: flattens the result and queues it in the [`CloudCache`]
//! - `jsonl`: one compact JSON object per line through a [`RotatingWriter`]
//! - `log`: the result as a structured `tracing` record
//!
//! All of them consult the [`ExpirationGate`] first and silently skip data
//! once it stops accepting.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cloud_cache::CloudCache;
use super::expiration::ExpirationGate;
use super::registry::{ExtensionRegistry, Returner};
use super::writer::{RotatingWriter, WriteStatus};
use crate::models::result::ResultMap;
use crate::models::Message;
use crate::Result;

pub const CLOUD: &str = "cloud";
pub const JSONL: &str = "jsonl";
pub const LOG: &str = "log";

/// File name template used by the `jsonl` returner
pub const JSONL_FILENAME: &str = "{now:%y%m%d%H%M%S}_{pid}.jsonl";

fn skipped(gate: &ExpirationGate, returner: &str, message: &Message) -> bool {
    if gate.accepts() {
        return false;
    }
    debug!(correlation_id = %message.id, returner, "returners expired, skipping result");
    true
}

/// Queues results for the cloud uplink
pub struct CloudReturner {
    cache: Arc<CloudCache>,
    gate: Arc<ExpirationGate>,
}

impl CloudReturner {
    pub fn new(cache: Arc<CloudCache>, gate: Arc<ExpirationGate>) -> Self {
        Self { cache, gate }
    }
}

#[async_trait]
impl Returner for CloudReturner {
    async fn deliver(&self, message: &Message, result: &ResultMap) -> Result<()> {
        if skipped(&self.gate, CLOUD, message) {
            return Ok(());
        }
        let outcome = self.cache.enqueue(result.clone()).await?;
        debug!(correlation_id = %message.id, queued = outcome.accepted, pending = outcome.len, "result cached for upload");
        Ok(())
    }
}

/// Appends results to rotating JSONL files
pub struct JsonlReturner {
    writer: Arc<RotatingWriter>,
    gate: Arc<ExpirationGate>,
}

impl JsonlReturner {
    pub fn new(writer: Arc<RotatingWriter>, gate: Arc<ExpirationGate>) -> Self {
        Self { writer, gate }
    }
}

#[async_trait]
impl Returner for JsonlReturner {
    async fn deliver(&self, message: &Message, result: &ResultMap) -> Result<()> {
        if skipped(&self.gate, JSONL, message) {
            return Ok(());
        }
        // serde_json's compact form already uses `,` and `:` without spaces
        let line = serde_json::to_string(result)?;
        if self.writer.write_line(line)? == WriteStatus::HighWatermark {
            debug!(correlation_id = %message.id, backlog = self.writer.backlog(), "jsonl writer is behind");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.writer.close().await
    }
}

/// Writes results to the log
pub struct LogReturner {
    gate: Arc<ExpirationGate>,
}

impl LogReturner {
    pub fn new(gate: Arc<ExpirationGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Returner for LogReturner {
    async fn deliver(&self, message: &Message, result: &ResultMap) -> Result<()> {
        if skipped(&self.gate, LOG, message) {
            return Ok(());
        }
        let handler = message.handler().unwrap_or_default();
        info!(
            target: "edmp::returner",
            correlation_id = %message.id,
            handler,
            result = %serde_json::Value::Object(result.clone()),
            "result"
        );
        Ok(())
    }
}

/// Register `log`, plus `cloud` and `jsonl` when their backends exist
///
/// The jsonl writer is also handed to the gate so expiration closes it.
pub async fn register_builtin_returners(
    registry: &ExtensionRegistry,
    gate: &Arc<ExpirationGate>,
    cache: Option<Arc<CloudCache>>,
    jsonl: Option<Arc<RotatingWriter>>,
) {
    registry.register_returner(LOG, Arc::new(LogReturner::new(gate.clone())));

    if let Some(cache) = cache {
        if !cache.has_uploader() {
            warn!("cloud returner registered without an endpoint, results will only be cached");
        }
        registry.register_returner(CLOUD, Arc::new(CloudReturner::new(cache, gate.clone())));
    }

    if let Some(writer) = jsonl {
        gate.register_writer(writer.clone()).await;
        registry.register_returner(JSONL, Arc::new(JsonlReturner::new(writer, gate.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cloud_cache::CloudCacheConfig;
    use crate::engine::storage::InMemoryQueueStore;
    use crate::engine::writer::WriterConfig;
    use serde_json::json;
    use std::time::Duration;

    fn result(value: Value) -> ResultMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn cache() -> Arc<CloudCache> {
        Arc::new(CloudCache::new(
            CloudCacheConfig::default(),
            Arc::new(InMemoryQueueStore::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn test_cloud_returner_flattens_into_pending() {
        let cache = cache();
        let returner = CloudReturner::new(cache.clone(), ExpirationGate::new());
        returner
            .deliver(
                &Message::new("query"),
                &result(json!({"_type": "obd", "_stamp": "2024-01-01T00:00:00Z", "values": [1, 2, 3]})),
            )
            .await
            .unwrap();
        assert_eq!(cache.status().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_expired_gate_skips_everything() {
        let cache = cache();
        let gate = ExpirationGate::new();
        gate.expire("trial over").await;

        let returner = CloudReturner::new(cache.clone(), gate.clone());
        returner
            .deliver(&Message::new("query"), &result(json!({"_type": "rpm", "value": 850})))
            .await
            .unwrap();
        assert_eq!(cache.status().await.unwrap().pending, 0);

        assert!(LogReturner::new(gate)
            .deliver(&Message::new("query"), &ResultMap::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rearmed_gate_accepts_again() {
        let cache = cache();
        let gate = ExpirationGate::new();
        let returner = CloudReturner::new(cache.clone(), gate.clone());
        let reading = result(json!({"_type": "rpm", "value": 850}));

        gate.expire("trial over").await;
        returner.deliver(&Message::new("query"), &reading).await.unwrap();
        assert_eq!(cache.status().await.unwrap().pending, 0);

        gate.set_expiration(Duration::from_secs(3600), "license renewed").await.unwrap();
        returner.deliver(&Message::new("query"), &reading).await.unwrap();
        assert_eq!(cache.status().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_jsonl_lines_are_compact() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(
            RotatingWriter::spawn(
                JSONL,
                WriterConfig {
                    directory: dir.path().to_string_lossy().to_string(),
                    filename: "out.jsonl".to_string(),
                    flush_timeout: 60.0,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let gate = ExpirationGate::new();
        let registry = ExtensionRegistry::new();
        register_builtin_returners(&registry, &gate, None, Some(writer.clone())).await;
        assert_eq!(registry.returner_names(), vec![JSONL.to_string(), LOG.to_string()]);

        let returner = registry.returner(JSONL).unwrap();
        for rpm in [850, 900] {
            returner
                .deliver(&Message::new("query"), &result(json!({"_type": "rpm", "value": rpm})))
                .await
                .unwrap();
        }
        registry.close_returners().await;
        assert!(writer.is_closed());

        let written = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        assert_eq!(written, "{\"_type\":\"rpm\",\"value\":850}\n{\"_type\":\"rpm\",\"value\":900}\n");
    }

    #[tokio::test]
    async fn test_expiration_closes_jsonl_writer() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(
            RotatingWriter::spawn(
                JSONL,
                WriterConfig {
                    directory: dir.path().to_string_lossy().to_string(),
                    filename: JSONL_FILENAME.to_string(),
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let gate = ExpirationGate::new();
        let registry = ExtensionRegistry::new();
        register_builtin_returners(&registry, &gate, Some(cache()), Some(writer.clone())).await;

        gate.set_expiration(Duration::ZERO, "license revoked").await.unwrap();
        assert!(writer.is_closed());
        // Skipped rather than failing on the closed writer
        assert!(registry
            .returner(JSONL)
            .unwrap()
            .deliver(&Message::new("query"), &ResultMap::new())
            .await
            .is_ok());
    }
}
