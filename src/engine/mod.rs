// Message processor engine
// This contains the bus, the workflow pipeline and everything that runs on top of it

//! # Engine Module
//!
//! This module contains the execution machinery of the message processor. The
//! engine is the layer between the plain records in `models/` and the hooks a
//! device manager registers.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: Messages, results, events, workers, rules (in `models/`)
//! - **Engine Layer**: Transport, pipeline and supervision (this module)
//! - **Binary**: The `manager` executable wiring configuration to the engine
//!
//! ## Engine Components
//!
//! ### Transport (`bus`, `client`)
//! Correlated request/response with per-handler FIFO lanes, plus topic fan-out.
//!
//! ### Pipeline (`registry`, `context`, `executor`, `admin`)
//! Named extensions and the stage chain applied to every message.
//!
//! ### Supervision (`workers`, `reactors`, `events`)
//! Periodic workers, result listeners, event reactors and the event publisher.
//!
//! ### Sinks (`returners`, `cloud_cache`, `storage`, `nats_storage`, `writer`, `expiration`)
//! Where results end up, and the switch that turns returners off.
//!
//! ### Built-ins (`hooks`, `triggers`, `persistence`)
//! Extensions every manager gets for free.
//!
//! ### Wiring (`processor`)
//! Per-manager state that owns all of the above.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for clean API

/// Named catalogs of hooks, validators, converters, filters, triggers and returners
pub mod registry;

/// In-process request/response and publish/subscribe transport
pub mod bus;

/// Shared context tree and `$path` keyword resolution
pub mod context;

/// The validator → handler → converter → filter → trigger → returner pipeline
pub mod executor;

/// Supervisor for named, schedulable workers
pub mod workers;

/// Result listeners and event reactors
pub mod reactors;

/// Event publisher with duplicate suppression
pub mod events;

/// The `manage` workflow: runtime introspection and control
pub mod admin;

/// Queue store abstraction and its in-memory implementation
pub mod storage;

/// NATS JetStream key-value implementation of the queue store
pub mod nats_storage;

/// Three-queue durable cache with at-least-once batch uplink
pub mod cloud_cache;

/// Background line writer with flush and rotation policies
pub mod writer;

/// Global switch governing whether returners accept data
pub mod expiration;

/// Built-in returners: cloud, jsonl, log
pub mod returners;

/// Built-in triggers: engine_state, recurrence
pub mod triggers;

/// Built-in hooks: echo, context and state helpers, sleep
pub mod hooks;

/// Small JSON state files with atomic replace
pub mod persistence;

/// Per-manager state wiring the engine together
pub mod processor;

/// Client facade over the bus
pub mod client;

pub use bus::{Bus, Dispatcher, Payload, Publication, Subscription};
pub use client::Client;
pub use cloud_cache::{CacheStatus, CloudCache, CloudCacheConfig, HttpUploader, Uploader};
pub use context::Context;
pub use events::EventPublisher;
pub use executor::WorkflowExecutor;
pub use processor::MessageProcessor;
pub use registry::{ExtensionRegistry, Hook, Returner, Trigger};
pub use storage::{InMemoryQueueStore, QueueStore};
pub use workers::WorkerSupervisor;
