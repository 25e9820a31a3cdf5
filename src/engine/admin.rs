// The manage workflow: runtime introspection and control

//! # Admin Workflow
//!
//! Messages with `_workflow: "manage"` never reach a hook. Their positional
//! arguments form a command line that is parsed into an [`AdminCommand`] and
//! executed against the live processor state:
//!
//! ```text
//! hook list [pattern]                 hook call <name> [args...] [kwargs]
//! worker list|show [pattern]          worker start (kwargs = worker definition)
//! worker pause|resume|kill <pattern>  reactor list|show [pattern]
//! run <envelope> | run (kwargs = message spec)
//! status
//! ```
//!
//! Every reply carries `_type: "manage.<noun>.<verb>"` (or `manage.run`,
//! `manage.status`). Unknown verbs fail with `unsupported_command`.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::info;

use super::bus::Bus;
use super::cloud_cache::CloudCache;
use super::executor::WorkflowExecutor;
use super::expiration::ExpirationGate;
use super::reactors::ReactorEngine;
use super::registry::ExtensionRegistry;
use super::workers::WorkerSupervisor;
use crate::models::message::{Message, MessageSpec};
use crate::models::result::{self, ResultMap};
use crate::models::WorkerDefinition;
use crate::utils::glob_match;
use crate::{EdmpError, Result};

const ANY: &str = "*";

/// A parsed admin command
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    HookList { pattern: String },
    HookCall { name: String, args: Vec<Value>, kwargs: Map<String, Value> },
    WorkerList { pattern: String },
    WorkerShow { pattern: String },
    WorkerStart { definition: WorkerDefinition },
    WorkerPause { pattern: String },
    WorkerResume { pattern: String },
    WorkerKill { pattern: String },
    ReactorList { pattern: String },
    ReactorShow { pattern: String },
    Run { message: Message },
    Status,
}

impl AdminCommand {
    /// Parse the positional arguments and kwargs of a manage message
    pub fn parse(message: &Message) -> Result<Self> {
        let mut words = message.args.iter();
        let noun = next_word(&mut words)?;
        let kwargs = message.handler_kwargs();

        let command = match noun.as_str() {
            "hook" => match next_word(&mut words)?.as_str() {
                "list" => AdminCommand::HookList { pattern: pattern_or_any(words.next())? },
                "call" => AdminCommand::HookCall {
                    name: next_word(&mut words)?,
                    args: words.cloned().collect(),
                    kwargs,
                },
                other => return Err(unsupported(&noun, other)),
            },
            "worker" => match next_word(&mut words)?.as_str() {
                "list" => AdminCommand::WorkerList { pattern: pattern_or_any(words.next())? },
                "show" => AdminCommand::WorkerShow { pattern: pattern_or_any(words.next())? },
                "start" => AdminCommand::WorkerStart {
                    definition: serde_json::from_value(Value::Object(kwargs)).map_err(|e| {
                        EdmpError::InvalidInput(format!("invalid worker definition: {}", e))
                    })?,
                },
                "pause" => AdminCommand::WorkerPause { pattern: next_word(&mut words)? },
                "resume" => AdminCommand::WorkerResume { pattern: next_word(&mut words)? },
                "kill" => AdminCommand::WorkerKill { pattern: next_word(&mut words)? },
                other => return Err(unsupported(&noun, other)),
            },
            "reactor" => match next_word(&mut words)?.as_str() {
                "list" => AdminCommand::ReactorList { pattern: pattern_or_any(words.next())? },
                "show" => AdminCommand::ReactorShow { pattern: pattern_or_any(words.next())? },
                other => return Err(unsupported(&noun, other)),
            },
            "run" => {
                let message = match words.next() {
                    Some(envelope @ Value::Object(_)) => Message::unpack(envelope.clone())?,
                    Some(other) => {
                        return Err(EdmpError::InvalidInput(format!(
                            "run expects a message envelope, got {}",
                            other
                        )))
                    }
                    None => serde_json::from_value::<MessageSpec>(Value::Object(kwargs))
                        .map_err(|e| EdmpError::InvalidInput(format!("invalid message spec: {}", e)))?
                        .into_message()?,
                };
                AdminCommand::Run { message }
            }
            "status" => AdminCommand::Status,
            other => return Err(EdmpError::UnsupportedCommand(other.to_string())),
        };
        Ok(command)
    }

    /// `<noun>.<verb>` of the command, used as the reply type
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::HookList { .. } => "hook.list",
            AdminCommand::HookCall { .. } => "hook.call",
            AdminCommand::WorkerList { .. } => "worker.list",
            AdminCommand::WorkerShow { .. } => "worker.show",
            AdminCommand::WorkerStart { .. } => "worker.start",
            AdminCommand::WorkerPause { .. } => "worker.pause",
            AdminCommand::WorkerResume { .. } => "worker.resume",
            AdminCommand::WorkerKill { .. } => "worker.kill",
            AdminCommand::ReactorList { .. } => "reactor.list",
            AdminCommand::ReactorShow { .. } => "reactor.show",
            AdminCommand::Run { .. } => "run",
            AdminCommand::Status => "status",
        }
    }
}

fn next_word<'a>(words: &mut impl Iterator<Item = &'a Value>) -> Result<String> {
    match words.next() {
        Some(Value::String(word)) => Ok(word.clone()),
        Some(other) => Err(EdmpError::InvalidInput(format!("expected a word, got {}", other))),
        None => Err(EdmpError::InvalidInput("admin command is incomplete".to_string())),
    }
}

fn pattern_or_any(word: Option<&Value>) -> Result<String> {
    match word {
        None => Ok(ANY.to_string()),
        Some(Value::String(pattern)) => Ok(pattern.clone()),
        Some(other) => Err(EdmpError::InvalidInput(format!("expected a pattern, got {}", other))),
    }
}

fn unsupported(noun: &str, verb: &str) -> EdmpError {
    EdmpError::UnsupportedCommand(format!("{} {}", noun, verb))
}

fn values<T: serde::Serialize>(items: Vec<T>) -> Result<ResultMap> {
    let mut reply = ResultMap::new();
    reply.insert(result::VALUES.to_string(), serde_json::to_value(items)?);
    Ok(reply)
}

/// Executes admin commands against one processor
pub struct AdminWorkflow {
    registry: Arc<ExtensionRegistry>,
    executor: Arc<WorkflowExecutor>,
    workers: WorkerSupervisor,
    reactors: Arc<ReactorEngine>,
    bus: Bus,
    gate: Arc<ExpirationGate>,
    cache: Option<Arc<CloudCache>>,
}

impl AdminWorkflow {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        executor: Arc<WorkflowExecutor>,
        workers: WorkerSupervisor,
        reactors: Arc<ReactorEngine>,
        bus: Bus,
        gate: Arc<ExpirationGate>,
        cache: Option<Arc<CloudCache>>,
    ) -> Self {
        Self {
            registry,
            executor,
            workers,
            reactors,
            bus,
            gate,
            cache,
        }
    }

    /// Parse and execute a manage message
    pub async fn handle(&self, message: &Message) -> Result<ResultMap> {
        let command = AdminCommand::parse(message)?;
        info!(correlation_id = %message.id, command = command.name(), "admin command");
        self.execute(command).await
    }

    pub async fn execute(&self, command: AdminCommand) -> Result<ResultMap> {
        let reply_type = format!("manage.{}", command.name());

        let mut reply = match command {
            AdminCommand::HookList { pattern } => values(
                self.registry
                    .hook_names()
                    .into_iter()
                    .filter(|name| glob_match(&pattern, name))
                    .collect::<Vec<_>>(),
            )?,
            AdminCommand::HookCall { name, args, kwargs } => {
                let mut reply = self.executor.call_hook(&name, args, kwargs).await?;
                // The hook's own type would otherwise win over the admin one
                reply.remove(result::TYPE);
                reply
            }
            AdminCommand::WorkerList { pattern } => values(self.workers.list(&pattern))?,
            AdminCommand::WorkerShow { pattern } => values(self.workers.show(&pattern))?,
            AdminCommand::WorkerStart { definition } => {
                let (spec, message) = definition.into_parts()?;
                let descriptor = self.workers.start(spec, message)?;
                match serde_json::to_value(descriptor)? {
                    Value::Object(map) => map,
                    _ => ResultMap::new(),
                }
            }
            AdminCommand::WorkerPause { pattern } => values(self.workers.pause(&pattern))?,
            AdminCommand::WorkerResume { pattern } => values(self.workers.resume(&pattern))?,
            AdminCommand::WorkerKill { pattern } => values(self.workers.kill(&pattern))?,
            AdminCommand::ReactorList { pattern } => values(self.reactors.list(&pattern).await)?,
            AdminCommand::ReactorShow { pattern } => values(self.reactors.show(&pattern).await)?,
            AdminCommand::Run { message } => {
                let mut reply = self.bus.call(message, None).await?;
                reply.remove(result::TYPE);
                reply
            }
            AdminCommand::Status => self.status().await?,
        };

        result::ensure_envelope(&mut reply, &reply_type);
        Ok(reply)
    }

    async fn status(&self) -> Result<ResultMap> {
        let cache = match &self.cache {
            Some(cache) => serde_json::to_value(cache.status().await?)?,
            None => Value::Null,
        };
        let status = json!({
            "bus": self.bus.status(),
            "hooks": self.registry.hook_names().len(),
            "returners": self.registry.returner_names(),
            "workers": self.workers.len(),
            "reactors": self.reactors.list(ANY).await.len(),
            "expiration": self.gate.state(),
            "cloud_cache": cache,
        });
        match status {
            Value::Object(map) => Ok(map),
            _ => Ok(ResultMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::{Admission, Dispatcher};
    use crate::engine::context::Context;
    use crate::engine::events::EventPublisher;
    use crate::engine::registry::HookCall;
    use crate::models::WorkerState;
    use async_trait::async_trait;
    use std::sync::Weak;
    use std::time::Duration;

    fn manage(args: Value) -> Message {
        Message::unpack(json!({"_workflow": "manage", "_args": args})).unwrap()
    }

    #[test]
    fn test_parse_verbs() {
        assert_eq!(
            AdminCommand::parse(&manage(json!(["hook", "list"]))).unwrap(),
            AdminCommand::HookList { pattern: "*".to_string() }
        );
        assert_eq!(
            AdminCommand::parse(&manage(json!(["worker", "kill", "rpm_*"]))).unwrap(),
            AdminCommand::WorkerKill { pattern: "rpm_*".to_string() }
        );

        let call = Message::unpack(json!({
            "_workflow": "manage",
            "_args": ["hook", "call", "query", "rpm"],
            "mode": "01",
        }))
        .unwrap();
        match AdminCommand::parse(&call).unwrap() {
            AdminCommand::HookCall { name, args, kwargs } => {
                assert_eq!(name, "query");
                assert_eq!(args, vec![json!("rpm")]);
                assert_eq!(kwargs["mode"], json!("01"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let run = AdminCommand::parse(&manage(json!(["run", {"_handler": "echo", "x": 1}]))).unwrap();
        assert_eq!(run.name(), "run");
    }

    #[test]
    fn test_parse_rejects_unknown_and_incomplete() {
        assert_eq!(
            AdminCommand::parse(&manage(json!(["worker", "explode"]))).unwrap_err().kind(),
            "unsupported_command"
        );
        assert_eq!(
            AdminCommand::parse(&manage(json!(["highstate"]))).unwrap_err().kind(),
            "unsupported_command"
        );
        assert_eq!(AdminCommand::parse(&manage(json!(["worker", "pause"]))).unwrap_err().kind(), "invalid_input");
        assert_eq!(AdminCommand::parse(&manage(json!([]))).unwrap_err().kind(), "invalid_input");
    }

    /// Runs every message through the executor, concurrently
    struct Direct {
        executor: Arc<WorkflowExecutor>,
    }

    #[async_trait]
    impl Dispatcher for Direct {
        fn admit(&self, _message: &Message) -> Result<Admission> {
            Ok(Admission::Concurrent)
        }

        async fn dispatch(&self, message: Message) -> Result<ResultMap> {
            self.executor.execute(message).await
        }
    }

    fn admin() -> (AdminWorkflow, Arc<Direct>) {
        let bus = Bus::default();
        let events = EventPublisher::new(bus.clone(), "test", Vec::new(), false);
        let registry = Arc::new(ExtensionRegistry::new());
        registry.register_fn_hook("echo", |call: HookCall| async move { Ok(Value::Object(call.kwargs)) });
        registry.register_fn_hook("query", |call: HookCall| async move {
            Ok(json!({"_type": "rpm", "value": call.arg("value", 0).cloned().unwrap_or(json!(0))}))
        });

        let reactors = Arc::new(ReactorEngine::new(bus.clone(), events.clone()));
        let executor = Arc::new(WorkflowExecutor::new(
            registry.clone(),
            Context::new(),
            events.clone(),
            reactors.clone(),
            bus.clone(),
        ));
        let direct = Arc::new(Direct { executor: executor.clone() });
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&direct) as Weak<dyn Dispatcher>;
        bus.bind(weak).unwrap();

        let workers = WorkerSupervisor::new(bus.clone(), events);
        let admin = AdminWorkflow::new(registry, executor, workers, reactors, bus, ExpirationGate::new(), None);
        (admin, direct)
    }

    #[tokio::test]
    async fn test_hook_list_and_call() {
        let (admin, _direct) = admin();
        let listed = admin.handle(&manage(json!(["hook", "list", "q*"]))).await.unwrap();
        assert_eq!(listed["values"], json!(["query"]));
        assert_eq!(listed["_type"], json!("manage.hook.list"));

        let called = admin.handle(&manage(json!(["hook", "call", "query", 850]))).await.unwrap();
        assert_eq!(called["value"], json!(850));
        assert_eq!(called["_type"], json!("manage.hook.call"));
    }

    #[tokio::test]
    async fn test_worker_lifecycle_through_admin() {
        let (admin, _direct) = admin();
        let start = Message::unpack(json!({
            "_workflow": "manage",
            "_args": ["worker", "start"],
            "name": "heartbeat",
            "handler": "echo",
            "kwargs": {"alive": true},
            "interval": 60,
        }))
        .unwrap();
        let started = admin.handle(&start).await.unwrap();
        assert_eq!(started["name"], json!("heartbeat"));
        assert_eq!(started["state"], json!("pending"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let shown = admin.handle(&manage(json!(["worker", "show", "heart*"]))).await.unwrap();
        assert_eq!(shown["values"][0]["state"], json!("running"));

        let killed = admin.handle(&manage(json!(["worker", "kill", "heartbeat"]))).await.unwrap();
        assert_eq!(killed["values"], json!(["heartbeat"]));
        for _ in 0..100 {
            if admin.workers.state("heartbeat") == Some(WorkerState::Killed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(admin.workers.state("heartbeat"), Some(WorkerState::Killed));
    }

    #[tokio::test]
    async fn test_run_and_status() {
        let (admin, _direct) = admin();
        let reply = admin
            .handle(&manage(json!(["run", {"_handler": "echo", "speed": 42}])))
            .await
            .unwrap();
        assert_eq!(reply["speed"], json!(42));
        assert_eq!(reply["_type"], json!("manage.run"));

        let status = admin.handle(&manage(json!(["status"]))).await.unwrap();
        assert_eq!(status["hooks"], json!(2));
        assert_eq!(status["cloud_cache"], Value::Null);
        assert_eq!(status["expiration"]["state"], json!("enabled"));
    }
}
