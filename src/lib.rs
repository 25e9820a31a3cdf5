// EDMP - Event-Driven Message Processor
// The common engine shared by every device manager on the telematics edge device

//! # EDMP Library
//!
//! This is the library crate behind every device manager process (accelerometer,
//! CAN, OBD, GNSS, modem, power, ...). Each manager owns one hardware or protocol
//! endpoint and exposes a uniform request/response interface to sibling processes.
//! This file is the **library root** and defines the public API.
//!
//! ## Core Components
//!
//! ### Data Model
//! - [`Message`]: Immutable request record with a typed [`Routing`] envelope
//! - [`ResultMap`]: Response dictionary carrying `_type` / `_stamp` and a payload
//! - [`Event`]: `{tag, data, timestamp}` record published on the bus
//! - [`Rule`]: Small condition grammar used by listeners and reactors
//!
//! ### Engine
//! - [`Bus`]: Correlated request/response plus publish/subscribe transport
//! - [`ExtensionRegistry`]: Named hooks, validators, converters, filters, triggers, returners
//! - [`WorkflowExecutor`]: validator → handler → converter → filter → trigger → returner
//! - [`WorkerSupervisor`]: Named, schedulable tasks re-running a message
//! - [`ReactorEngine`]: Listeners over results and reactors over events
//! - [`EventPublisher`]: Tag-namespaced events with duplicate suppression
//! - [`CloudCache`]: Three-queue durable store with at-least-once batch uplink
//! - [`RotatingWriter`]: Background line writer with flush and rotation policies
//! - [`ExpirationGate`]: Global switch suppressing returner activity
//! - [`MessageProcessor`]: Per-manager state wiring all of the above together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use edmp::{ManagerSettings, Message, MessageProcessor};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn demo() -> edmp::Result<()> {
//! let processor = MessageProcessor::build(ManagerSettings::named("obd_manager"), None).await?;
//! processor.start().await?;
//!
//! let client = processor.client();
//! let reply = client
//!     .send_sync(json!({"_handler": "echo", "speed": 42}), Duration::from_secs(5))
//!     .await?;
//! assert_eq!(reply["speed"], json!(42));
//!
//! processor.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so callers don't need to know the internal
//! module structure. Instead of `use edmp::engine::bus::Bus`, callers write
//! `use edmp::Bus`.

// Core domain models (messages, results, events, workers, rules)
pub mod models;

// Execution engine: bus, registry, executor, workers, reactors, cloud cache, writers
pub mod engine;

// Manager configuration surface
pub mod settings;

// Small shared helpers (glob matching, durations)
pub mod utils;

pub use models::{
    event::{tags, Event},
    message::{Message, MessageSpec, Routing, WorkerSpec, WorkflowKind},
    result::ResultMap,
    rule::{Rule, RuleCondition},
    worker::{WorkerDefinition, WorkerDescriptor, WorkerState},
};

pub use engine::{
    admin::{AdminCommand, AdminWorkflow},
    bus::{Bus, Dispatcher, Payload, Publication, Subscription},
    client::Client,
    cloud_cache::{CacheStatus, CloudCache, CloudCacheConfig, HttpUploader, Uploader},
    context::Context,
    events::EventPublisher,
    executor::WorkflowExecutor,
    expiration::{ExpirationGate, ExpirationState},
    nats_storage::NatsQueueStore,
    persistence::StateStore,
    processor::MessageProcessor,
    reactors::{Listener, Matcher, ReactorDescriptor, ReactorEngine},
    registry::{ExtensionRegistry, FnHook, FnReturner, FnTrigger, Hook, HookCall, HookRegistration, Returner, Trigger},
    storage::{InMemoryQueueStore, QueueStore},
    workers::WorkerSupervisor,
    writer::{RotatingWriter, RotationPolicy, WriteStatus, WriterConfig},
};

pub use settings::ManagerSettings;

use std::time::Duration;
use thiserror::Error;

/// Error kinds surfaced by the message processor
///
/// The `Display` output of each variant starts with the stable snake_case kind
/// (see [`EdmpError::kind`]) because it is what callers see in the `error`
/// field of a result envelope.
#[derive(Error, Debug)]
pub enum EdmpError {
    /// A validator returned a non-empty reason, or a hook's required kwargs are missing
    #[error("validation_failed: {0}")]
    ValidationFailed(String),

    /// The message targets a hook or extension that is not registered
    #[error("unknown_handler: {0}")]
    UnknownHandler(String),

    /// An admin verb that the manage workflow does not understand
    #[error("unsupported_command: {0}")]
    UnsupportedCommand(String),

    /// A `$path` keyword could not be found in the context tree
    #[error("unresolved_keyword: {0}")]
    UnresolvedKeyword(String),

    /// No reply arrived before the deadline
    #[error("timeout: no reply within {0:?}")]
    Timeout(Duration),

    /// The bus is shutting down or the worker was killed while awaiting
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The handler raised
    #[error("handler_error: {0}")]
    Handler(String),

    #[error("converter_error: {0}")]
    Converter(String),

    #[error("filter_error: {0}")]
    Filter(String),

    #[error("trigger_error: {0}")]
    Trigger(String),

    #[error("returner_error: {0}")]
    Returner(String),

    /// A cloud cache batch could not be delivered; the batch is preserved
    #[error("upload_failed: {0}")]
    UploadFailed(String),

    /// A writer buffer would overflow
    #[error("storage_full: {0}")]
    StorageFull(String),

    /// Operation on a resource that was permanently closed
    #[error("resource_closed: {0}")]
    ResourceClosed(String),

    /// A worker with the same name is already registered
    #[error("duplicate_worker: {0}")]
    DuplicateWorker(String),

    #[error("not_found: {0}")]
    NotFound(String),

    #[error("invalid_input: {0}")]
    InvalidInput(String),

    /// Configuration loading errors
    #[error("config_error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Storage backend errors (NATS and friends)
    #[error("storage_error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization_error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http_error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal_error: {0}")]
    Internal(String),
}

impl EdmpError {
    /// Stable snake_case kind of this error
    pub fn kind(&self) -> &'static str {
        match self {
            EdmpError::ValidationFailed(_) => "validation_failed",
            EdmpError::UnknownHandler(_) => "unknown_handler",
            EdmpError::UnsupportedCommand(_) => "unsupported_command",
            EdmpError::UnresolvedKeyword(_) => "unresolved_keyword",
            EdmpError::Timeout(_) => "timeout",
            EdmpError::Cancelled(_) => "cancelled",
            EdmpError::Handler(_) => "handler_error",
            EdmpError::Converter(_) => "converter_error",
            EdmpError::Filter(_) => "filter_error",
            EdmpError::Trigger(_) => "trigger_error",
            EdmpError::Returner(_) => "returner_error",
            EdmpError::UploadFailed(_) => "upload_failed",
            EdmpError::StorageFull(_) => "storage_full",
            EdmpError::ResourceClosed(_) => "resource_closed",
            EdmpError::DuplicateWorker(_) => "duplicate_worker",
            EdmpError::NotFound(_) => "not_found",
            EdmpError::InvalidInput(_) => "invalid_input",
            EdmpError::Config(_) => "config_error",
            EdmpError::Storage(_) => "storage_error",
            EdmpError::Serialization(_) => "serialization_error",
            EdmpError::Io(_) => "io_error",
            EdmpError::Http(_) => "http_error",
            EdmpError::Internal(_) => "internal_error",
        }
    }

    /// Transport-level failures stay errors for the caller of `Bus::send`;
    /// everything else is folded into an `{error: ...}` result.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EdmpError::Timeout(_) | EdmpError::Cancelled(_) | EdmpError::UnknownHandler(_)
        )
    }
}

/// Type alias for Results that use our error type
pub type Result<T> = std::result::Result<T, EdmpError>;
