// Request messages and their routing envelope

//! # Messages
//!
//! A [`Message`] is the immutable request record that travels over the bus. It
//! carries a typed [`Routing`] struct (which workflow, which hook, which stage
//! extensions) plus an opaque JSON payload of positional and keyword arguments.
//!
//! ## Envelope Format
//!
//! Clients in sibling processes speak in flat JSON objects. Keys starting with
//! `_` are routing fields, every other key is a keyword argument for the hook:
//!
//! ```json
//! {"_handler": "query", "_args": ["rpm"], "_returner": "cloud", "mode": "01"}
//! ```
//!
//! [`Message::unpack`] turns such an envelope into a [`Message`] and
//! [`Message::pack`] goes the other way. Unknown `_` keys are dropped, so the
//! round trip is an identity modulo reserved-key stripping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::{EdmpError, Result};

/// Reserved envelope keys
pub mod keys {
    pub const HANDLER: &str = "_handler";
    pub const WORKFLOW: &str = "_workflow";
    pub const ARGS: &str = "_args";
    pub const VALIDATOR: &str = "_validator";
    pub const CONVERTER: &str = "_converter";
    pub const FILTER: &str = "_filter";
    pub const TRIGGER: &str = "_trigger";
    pub const RETURNER: &str = "_returner";
    pub const WORKER: &str = "_worker";
    pub const SYNCHRONIZE: &str = "_synchronize";
    pub const KEYWORD_RESOLVE: &str = "_keyword_resolve";
    pub const TYPE: &str = "_type";
    pub const STAMP: &str = "_stamp";
}

/// Keys starting with this character are routing fields, never hook kwargs.
pub const RESERVED_PREFIX: char = '_';

pub fn is_reserved(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Which pipeline a message goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Handler only
    #[default]
    Simple,
    /// Every optional stage slot is honored
    Extended,
    /// Bypasses the handler and enters the admin workflow
    Manage,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Simple => "simple",
            WorkflowKind::Extended => "extended",
            WorkflowKind::Manage => "manage",
        }
    }
}

impl FromStr for WorkflowKind {
    type Err = EdmpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(WorkflowKind::Simple),
            "extended" => Ok(WorkflowKind::Extended),
            "manage" => Ok(WorkflowKind::Manage),
            other => Err(EdmpError::InvalidInput(format!("unknown workflow '{}'", other))),
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_loop() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

/// Scheduling parameters for a message that should run as a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,

    /// Optional cron expression (seconds field first); replaces `interval` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Number of iterations, `-1` for infinite
    #[serde(rename = "loop", default = "default_loop")]
    pub loop_count: i64,

    /// Seconds to wait before the first iteration
    #[serde(default)]
    pub delay: f64,

    /// Seconds to sleep between iterations
    #[serde(default)]
    pub interval: f64,

    /// Kill the worker instead of suspending it when paused
    #[serde(default)]
    pub kill_upon_suspend: bool,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule: None,
            loop_count: default_loop(),
            delay: 0.0,
            interval: 0.0,
            kill_upon_suspend: false,
        }
    }

    pub fn with_loop(mut self, loop_count: i64) -> Self {
        self.loop_count = loop_count;
        self
    }

    pub fn with_interval(mut self, seconds: f64) -> Self {
        self.interval = seconds;
        self
    }

    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = seconds;
        self
    }

    pub fn with_schedule(mut self, cron: impl Into<String>) -> Self {
        self.schedule = Some(cron.into());
        self
    }

    pub fn with_kill_upon_suspend(mut self, kill: bool) -> Self {
        self.kill_upon_suspend = kill;
        self
    }

    pub fn is_infinite(&self) -> bool {
        self.loop_count < 0
    }
}

/// Typed routing fields of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    pub workflow: WorkflowKind,
    pub handler: Option<String>,
    pub validator: Option<String>,
    pub converter: Option<String>,
    pub filter: Option<String>,
    pub trigger: Option<String>,
    pub returner: Option<String>,
    pub worker: Option<WorkerSpec>,
    /// Acquire the handler's FIFO lane for the duration of the workflow
    pub synchronize: bool,
    /// Resolve `$path` kwargs against the context before the handler runs
    pub keyword_resolve: bool,
    /// Overrides the default `_type` (the handler name) of the result
    pub result_type: Option<String>,
    pub stamp: Option<String>,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            workflow: WorkflowKind::Simple,
            handler: None,
            validator: None,
            converter: None,
            filter: None,
            trigger: None,
            returner: None,
            worker: None,
            synchronize: true,
            keyword_resolve: false,
            result_type: None,
            stamp: None,
        }
    }
}

/// An immutable request record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation ID, reassigned by the bus on every submission
    pub id: Uuid,
    pub routing: Routing,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Message {
    /// Create a simple-workflow message targeting `handler`
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            routing: Routing {
                handler: Some(handler.into()),
                ..Routing::default()
            },
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Create an admin message; the first positional argument is the verb
    pub fn manage<I, V>(args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            id: Uuid::new_v4(),
            routing: Routing {
                workflow: WorkflowKind::Manage,
                synchronize: false,
                ..Routing::default()
            },
            args: args.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    pub fn handler(&self) -> Option<&str> {
        self.routing.handler.as_deref()
    }

    pub fn workflow(&self) -> WorkflowKind {
        self.routing.workflow
    }

    pub fn with_args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    pub fn with_workflow(mut self, workflow: WorkflowKind) -> Self {
        self.routing.workflow = workflow;
        self
    }

    /// Switch to the extended workflow so every stage slot is honored
    pub fn extended(self) -> Self {
        self.with_workflow(WorkflowKind::Extended)
    }

    pub fn with_validator(mut self, name: impl Into<String>) -> Self {
        self.routing.validator = Some(name.into());
        self
    }

    pub fn with_converter(mut self, name: impl Into<String>) -> Self {
        self.routing.converter = Some(name.into());
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>) -> Self {
        self.routing.filter = Some(name.into());
        self
    }

    pub fn with_trigger(mut self, name: impl Into<String>) -> Self {
        self.routing.trigger = Some(name.into());
        self
    }

    pub fn with_returner(mut self, name: impl Into<String>) -> Self {
        self.routing.returner = Some(name.into());
        self
    }

    pub fn with_worker(mut self, worker: WorkerSpec) -> Self {
        self.routing.worker = Some(worker);
        self
    }

    pub fn with_synchronize(mut self, synchronize: bool) -> Self {
        self.routing.synchronize = synchronize;
        self
    }

    pub fn with_keyword_resolve(mut self, resolve: bool) -> Self {
        self.routing.keyword_resolve = resolve;
        self
    }

    pub fn with_type(mut self, result_type: impl Into<String>) -> Self {
        self.routing.result_type = Some(result_type.into());
        self
    }

    /// Copy of this message with a fresh correlation ID and without a worker spec,
    /// used for every iteration a worker submits.
    pub fn iteration(&self) -> Self {
        let mut message = self.clone();
        message.id = Uuid::new_v4();
        message.routing.worker = None;
        message
    }

    /// Keyword arguments as handed to a hook: reserved keys stripped
    pub fn handler_kwargs(&self) -> Map<String, Value> {
        self.kwargs
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Check the routing invariants
    pub fn validate(&self) -> Result<()> {
        if self.routing.workflow != WorkflowKind::Manage && self.routing.handler.is_none() {
            return Err(EdmpError::InvalidInput(
                "_handler is required unless _workflow is manage".to_string(),
            ));
        }
        if let Some(worker) = &self.routing.worker {
            if worker.name.trim().is_empty() {
                return Err(EdmpError::InvalidInput("worker name must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Pack this message into a flat client envelope
    pub fn pack(&self) -> Value {
        let mut fields = Map::new();
        let routing = &self.routing;

        if let Some(handler) = &routing.handler {
            fields.insert(keys::HANDLER.to_string(), Value::String(handler.clone()));
        }
        if routing.workflow != WorkflowKind::Simple {
            fields.insert(keys::WORKFLOW.to_string(), Value::String(routing.workflow.to_string()));
        }
        if !self.args.is_empty() {
            fields.insert(keys::ARGS.to_string(), Value::Array(self.args.clone()));
        }

        let slots = [
            (keys::VALIDATOR, &routing.validator),
            (keys::CONVERTER, &routing.converter),
            (keys::FILTER, &routing.filter),
            (keys::TRIGGER, &routing.trigger),
            (keys::RETURNER, &routing.returner),
            (keys::TYPE, &routing.result_type),
            (keys::STAMP, &routing.stamp),
        ];
        for (key, slot) in slots {
            if let Some(name) = slot {
                fields.insert(key.to_string(), Value::String(name.clone()));
            }
        }

        if let Some(worker) = &routing.worker {
            if let Ok(spec) = serde_json::to_value(worker) {
                fields.insert(keys::WORKER.to_string(), spec);
            }
        }
        if !routing.synchronize {
            fields.insert(keys::SYNCHRONIZE.to_string(), Value::Bool(false));
        }
        if routing.keyword_resolve {
            fields.insert(keys::KEYWORD_RESOLVE.to_string(), Value::Bool(true));
        }

        for (key, value) in &self.kwargs {
            if !is_reserved(key) {
                fields.insert(key.clone(), value.clone());
            }
        }

        Value::Object(fields)
    }

    /// Unpack a flat client envelope into a message
    pub fn unpack(envelope: Value) -> Result<Self> {
        let Value::Object(fields) = envelope else {
            return Err(EdmpError::InvalidInput(
                "message envelope must be a JSON object".to_string(),
            ));
        };

        let mut routing = Routing::default();
        let mut args = Vec::new();
        let mut kwargs = Map::new();

        for (key, value) in fields {
            if !is_reserved(&key) {
                kwargs.insert(key, value);
                continue;
            }

            match key.as_str() {
                keys::HANDLER => routing.handler = optional_string(&key, value)?,
                keys::WORKFLOW => {
                    if let Some(workflow) = optional_string(&key, value)? {
                        routing.workflow = workflow.parse()?;
                    }
                }
                keys::ARGS => {
                    args = match value {
                        Value::Array(items) => items,
                        Value::Null => Vec::new(),
                        other => vec![other],
                    }
                }
                keys::VALIDATOR => routing.validator = optional_string(&key, value)?,
                keys::CONVERTER => routing.converter = optional_string(&key, value)?,
                keys::FILTER => routing.filter = optional_string(&key, value)?,
                keys::TRIGGER => routing.trigger = optional_string(&key, value)?,
                keys::RETURNER => routing.returner = optional_string(&key, value)?,
                keys::TYPE => routing.result_type = optional_string(&key, value)?,
                keys::STAMP => routing.stamp = optional_string(&key, value)?,
                keys::WORKER => {
                    routing.worker = match value {
                        Value::Null => None,
                        Value::String(name) => Some(WorkerSpec::new(name)),
                        spec => Some(serde_json::from_value(spec)?),
                    }
                }
                keys::SYNCHRONIZE => routing.synchronize = expect_bool(&key, value)?,
                keys::KEYWORD_RESOLVE => routing.keyword_resolve = expect_bool(&key, value)?,
                _ => debug!(key = %key, "dropping unknown reserved key"),
            }
        }

        if routing.workflow == WorkflowKind::Manage {
            routing.synchronize = false;
        }

        let message = Message {
            id: Uuid::new_v4(),
            routing,
            args,
            kwargs,
        };
        message.validate()?;
        Ok(message)
    }
}

fn optional_string(key: &str, value: Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(EdmpError::InvalidInput(format!(
            "{} must be a string, got {}",
            key, other
        ))),
    }
}

fn expect_bool(key: &str, value: Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EdmpError::InvalidInput(format!(
            "{} must be a boolean, got {}",
            key, other
        ))),
    }
}

/// Declarative form of a message, used by configuration files and the admin `run` verb
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSpec {
    pub handler: Option<String>,
    #[serde(default)]
    pub workflow: WorkflowKind,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub converter: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub returner: Option<String>,
    #[serde(default = "default_true")]
    pub synchronize: bool,
    #[serde(default)]
    pub keyword_resolve: bool,
    #[serde(default, rename = "type")]
    pub result_type: Option<String>,
}

impl MessageSpec {
    pub fn into_message(self) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            routing: Routing {
                workflow: self.workflow,
                handler: self.handler,
                validator: self.validator,
                converter: self.converter,
                filter: self.filter,
                trigger: self.trigger,
                returner: self.returner,
                worker: None,
                synchronize: self.synchronize,
                keyword_resolve: self.keyword_resolve,
                result_type: self.result_type,
                stamp: None,
            },
            args: self.args,
            kwargs: self
                .kwargs
                .into_iter()
                .filter(|(key, _)| !is_reserved(key))
                .collect(),
        };
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unpack_splits_routing_from_kwargs() {
        let message = Message::unpack(json!({
            "_handler": "query",
            "_args": ["rpm"],
            "_workflow": "extended",
            "_returner": "cloud",
            "_keyword_resolve": true,
            "mode": "01",
        }))
        .unwrap();

        assert_eq!(message.handler(), Some("query"));
        assert_eq!(message.workflow(), WorkflowKind::Extended);
        assert_eq!(message.args, vec![json!("rpm")]);
        assert_eq!(message.routing.returner.as_deref(), Some("cloud"));
        assert!(message.routing.keyword_resolve);
        assert!(message.routing.synchronize);
        assert_eq!(message.kwargs.len(), 1);
        assert_eq!(message.kwargs["mode"], json!("01"));
    }

    #[test]
    fn test_pack_unpack_is_identity_modulo_reserved_keys() {
        let original = Message::new("query")
            .extended()
            .with_args(vec![json!("rpm"), json!(2)])
            .with_kwarg("mode", "01")
            .with_kwarg("_internal", "stripped")
            .with_converter("to_kmh")
            .with_worker(WorkerSpec::new("poller").with_interval(5.0).with_loop(3))
            .with_synchronize(false);

        let unpacked = Message::unpack(original.pack()).unwrap();

        assert_eq!(unpacked.routing, original.routing);
        assert_eq!(unpacked.args, original.args);
        assert_eq!(unpacked.kwargs, original.handler_kwargs());
        assert!(!unpacked.kwargs.contains_key("_internal"));
    }

    #[test]
    fn test_unknown_reserved_keys_are_dropped() {
        let message = Message::unpack(json!({"_handler": "echo", "_bogus": 1, "x": 2})).unwrap();
        assert_eq!(message.kwargs.len(), 1);
        assert!(message.pack().get("_bogus").is_none());
    }

    #[test]
    fn test_handler_required_unless_manage() {
        assert!(Message::unpack(json!({"x": 1})).is_err());
        let manage = Message::unpack(json!({"_workflow": "manage", "_args": ["hook", "list"]})).unwrap();
        assert_eq!(manage.workflow(), WorkflowKind::Manage);
        assert!(!manage.routing.synchronize);
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        assert!(Message::unpack(json!(["not", "an", "object"])).is_err());
        assert!(Message::unpack(json!({"_handler": 5})).is_err());
        assert!(Message::unpack(json!({"_handler": "x", "_workflow": "bogus"})).is_err());
        assert!(Message::unpack(json!({"_handler": "x", "_synchronize": "yes"})).is_err());
    }

    #[test]
    fn test_worker_spec_defaults() {
        let message = Message::unpack(json!({"_handler": "x", "_worker": {"name": "w"}})).unwrap();
        let worker = message.routing.worker.unwrap();
        assert_eq!(worker.loop_count, -1);
        assert!(worker.is_infinite());
        assert_eq!(worker.interval, 0.0);

        let named = Message::unpack(json!({"_handler": "x", "_worker": "poller"})).unwrap();
        assert_eq!(named.routing.worker.unwrap().name, "poller");
    }

    #[test]
    fn test_message_spec_into_message() {
        let spec: MessageSpec = serde_json::from_value(json!({
            "handler": "query",
            "args": ["rpm"],
            "kwargs": {"mode": "01", "_skip": true},
            "workflow": "extended",
            "returner": "cloud",
        }))
        .unwrap();
        let message = spec.into_message().unwrap();
        assert_eq!(message.handler(), Some("query"));
        assert_eq!(message.workflow(), WorkflowKind::Extended);
        assert!(message.routing.synchronize);
        assert!(!message.kwargs.contains_key("_skip"));
    }
}
