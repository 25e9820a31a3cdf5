// Core data model for the message processor
// These are plain, serializable records with no engine behaviour attached

//! # Domain Models Module
//!
//! This module contains the records every other part of the processor passes
//! around. None of them own tasks, locks or channels, which keeps them cheap to
//! clone across the bus boundary.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Declarations
//! Each `pub mod` declaration tells Rust to look for a `.rs` file with that name
//! in this directory and include it as a public submodule.

// Message, Routing envelope, WorkerSpec and the reserved-key codec
pub mod message;

// Result dictionaries: wrapping, stamping, flattening and cloud envelopes
pub mod result;

// Events and the stable tag catalogue
pub mod event;

// Worker descriptors and their lifecycle state machine
pub mod worker;

// Rule and RuleCondition - the matcher grammar for listeners and reactors
pub mod rule;

pub use event::Event;
pub use message::{Message, MessageSpec, Routing, WorkerSpec, WorkflowKind};
pub use result::ResultMap;
pub use rule::{Rule, RuleCondition};
pub use worker::{WorkerDefinition, WorkerDescriptor, WorkerState};
