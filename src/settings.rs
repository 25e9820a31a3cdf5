// Manager configuration
// Layered from an optional file and EDMP__-prefixed environment variables

//! # Manager Settings
//!
//! Everything a manager process can be configured with. The file format is
//! picked by extension (YAML, TOML or JSON); environment variables override the
//! file, with `__` separating nested keys:
//!
//! ```text
//! EDMP__NAME=obd_manager
//! EDMP__TRIGGER_EVENTS=true
//! EDMP__CLOUD_CACHE__ENDPOINT=https://uplink.example.com/v1/data
//! ```
//!
//! Durations are seconds as `f64`. Directories accept `~` and `$VAR`.

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine::cloud_cache::CloudCacheConfig;
use crate::engine::expiration::ExpirationConfig;
use crate::engine::reactors::ReactorDescriptor;
use crate::engine::returners::JSONL_FILENAME;
use crate::engine::writer::{RotationPolicy, WriterConfig};
use crate::models::WorkerDefinition;
use crate::{EdmpError, Result};

pub const ENV_PREFIX: &str = "EDMP";

/// Dispatch overrides for a registered hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSettings {
    pub name: String,
    #[serde(default)]
    pub synchronize: Option<bool>,
    #[serde(default)]
    pub returner: Option<String>,
}

/// Buffering of the background writers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncWriterSettings {
    pub flush_threshold: usize,
    pub flush_timeout: f64,
    pub buffer_size: usize,
    pub buffer_high_watermark: usize,
}

impl Default for AsyncWriterSettings {
    fn default() -> Self {
        let defaults = WriterConfig::default();
        Self {
            flush_threshold: defaults.flush_threshold,
            flush_timeout: defaults.flush_timeout,
            buffer_size: defaults.buffer_size,
            buffer_high_watermark: defaults.buffer_high_watermark,
        }
    }
}

/// Where the `jsonl` returner writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlSettings {
    pub directory: String,
    pub filename: String,
}

impl Default for JsonlSettings {
    fn default() -> Self {
        Self {
            directory: "/var/lib/edmp/jsonl".to_string(),
            filename: JSONL_FILENAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Publications buffered per subscriber before it lags
    pub capacity: usize,
    /// Default reply deadline in seconds
    pub timeout: f64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            capacity: crate::engine::bus::DEFAULT_CAPACITY,
            timeout: crate::engine::bus::DEFAULT_TIMEOUT.as_secs_f64(),
        }
    }
}

/// Full configuration of one manager process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Manager name, used in service event tags
    pub name: String,
    pub hooks: Vec<HookSettings>,
    /// Workers started with the manager
    pub workers: Vec<WorkerDefinition>,
    pub reactors: Vec<ReactorDescriptor>,
    /// Enables the `cloud` returner
    pub cloud_cache: Option<CloudCacheConfig>,
    pub async_writer: AsyncWriterSettings,
    pub rotation: RotationPolicy,
    /// Enables the `jsonl` returner
    pub jsonl: Option<JsonlSettings>,
    /// Publish worker and service lifecycle events
    pub trigger_events: bool,
    /// Tag globs under which repeated events are suppressed
    pub skip_duplicates_filters: Vec<String>,
    pub expiration: ExpirationConfig,
    /// Directory of the JSON state files
    pub state_dir: String,
    pub bus: BusSettings,
    /// Seconds to wait for workers and in-flight messages on shutdown
    pub shutdown_timeout: f64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            name: "edmp".to_string(),
            hooks: Vec::new(),
            workers: Vec::new(),
            reactors: Vec::new(),
            cloud_cache: None,
            async_writer: AsyncWriterSettings::default(),
            rotation: RotationPolicy::default(),
            jsonl: None,
            trigger_events: false,
            skip_duplicates_filters: Vec::new(),
            expiration: ExpirationConfig::default(),
            state_dir: "/var/lib/edmp/state".to_string(),
            bus: BusSettings::default(),
            shutdown_timeout: 10.0,
        }
    }
}

impl ManagerSettings {
    /// Defaults with the given manager name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load from an optional file layered with `EDMP__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: ManagerSettings = builder.build()?.try_deserialize()?;
        settings.normalized()
    }

    /// Expand directories and validate what can be checked without I/O
    pub fn normalized(mut self) -> Result<Self> {
        if self.name.trim().is_empty() {
            return Err(EdmpError::InvalidInput("manager name must not be empty".to_string()));
        }

        self.state_dir = expand(&self.state_dir)?;
        if let Some(jsonl) = &mut self.jsonl {
            jsonl.directory = expand(&jsonl.directory)?;
        }
        if let Some(endpoint) = self.cloud_cache.as_ref().and_then(|c| c.endpoint.as_deref()) {
            Url::parse(endpoint)
                .map_err(|e| EdmpError::InvalidInput(format!("invalid cloud endpoint '{}': {}", endpoint, e)))?;
        }
        self.rotation.schedule()?;
        Ok(self)
    }

    /// Writer configuration of the `jsonl` returner, when enabled
    pub fn jsonl_writer(&self) -> Option<WriterConfig> {
        self.jsonl.as_ref().map(|jsonl| WriterConfig {
            directory: jsonl.directory.clone(),
            filename: jsonl.filename.clone(),
            flush_threshold: self.async_writer.flush_threshold,
            flush_timeout: self.async_writer.flush_timeout,
            buffer_size: self.async_writer.buffer_size,
            buffer_high_watermark: self.async_writer.buffer_high_watermark,
            rotation: self.rotation.clone(),
        })
    }
}

fn expand(path: &str) -> Result<String> {
    shellexpand::full(path)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| EdmpError::InvalidInput(format!("cannot expand '{}': {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = ManagerSettings::named("obd_manager");
        assert_eq!(settings.name, "obd_manager");
        assert!(settings.cloud_cache.is_none());
        assert!(settings.jsonl_writer().is_none());
        assert_eq!(settings.bus.timeout, 30.0);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obd.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
name = "obd_manager"
skip_duplicates_filters = ["vehicle/position/*"]

[[hooks]]
name = "echo"
returner = "log"

[[workers]]
name = "rpm_poller"
handler = "query"
args = ["rpm"]
interval = 5.0

[cloud_cache]
endpoint = "https://uplink.example.com/v1/data"
batch_size = 50

[jsonl]
directory = "~/edmp"

[rotation]
size = 1048576
"#
        )
        .unwrap();

        let settings = ManagerSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.name, "obd_manager");
        assert_eq!(settings.hooks[0].returner.as_deref(), Some("log"));
        assert_eq!(settings.workers[0].name, "rpm_poller");
        assert_eq!(settings.workers[0].interval, 5.0);
        assert_eq!(settings.cloud_cache.as_ref().unwrap().batch_size, 50);
        assert_eq!(settings.cloud_cache.as_ref().unwrap().retry_count, 3);

        let writer = settings.jsonl_writer().unwrap();
        assert!(!writer.directory.starts_with('~'));
        assert_eq!(writer.filename, JSONL_FILENAME);
        assert_eq!(writer.rotation.size, Some(1_048_576));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut settings = ManagerSettings::named("modem_manager");
        settings.cloud_cache = Some(CloudCacheConfig {
            endpoint: Some("not a url".to_string()),
            ..Default::default()
        });
        assert_eq!(settings.normalized().unwrap_err().kind(), "invalid_input");
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = ManagerSettings::load(Some(Path::new("/nonexistent/edmp.yaml"))).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }
}
