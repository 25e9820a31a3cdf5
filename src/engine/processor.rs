// Per-manager processor state
// Owns the bus, the registry and every engine component of one manager

//! # Message Processor
//!
//! [`MessageProcessor`] is what a device manager instantiates. It wires the
//! engine together and is the single [`Dispatcher`] bound to its bus:
//!
//! ```text
//!                     ┌──────────── admit ────────────┐
//! Client ──► Bus ─────┤ manage / _worker → concurrent  │
//!                     │ synchronized hook → FIFO lane  │
//!                     └──────────── dispatch ──────────┘
//!                        │            │            │
//!                  AdminWorkflow  WorkerSupervisor  WorkflowExecutor
//! ```
//!
//! There is no global state; two processors in one process are fully
//! independent.
//!
//! ## Lifecycle
//!
//! 1. [`MessageProcessor::build`] creates every component and registers the
//!    built-in hooks, triggers and returners. Managers register their own
//!    hooks on [`MessageProcessor::registry`] afterwards.
//! 2. [`MessageProcessor::start`] applies hook overrides, registers reactors,
//!    starts the reactor loop, the cloud uploader, the expiration timer and the
//!    configured workers.
//! 3. [`MessageProcessor::shutdown`] stops in order: workers, then new
//!    messages, then in-flight jobs, then writers and returners, then queues.
//!
//! ## Rust Learning Notes:
//!
//! ### Arc + Weak Back-Reference
//! The bus needs to call back into the processor, and the processor owns the
//! bus. The bus only keeps a `Weak<dyn Dispatcher>`, so dropping the last
//! `MessageProcessor` handle frees everything.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admin::AdminWorkflow;
use super::bus::{Admission, Bus, Dispatcher};
use super::client::Client;
use super::cloud_cache::CloudCache;
use super::context::Context;
use super::events::EventPublisher;
use super::executor::WorkflowExecutor;
use super::expiration::ExpirationGate;
use super::hooks::register_builtin_hooks;
use super::persistence::StateStore;
use super::reactors::ReactorEngine;
use super::registry::ExtensionRegistry;
use super::returners::{register_builtin_returners, JSONL};
use super::triggers::register_builtin_triggers;
use super::workers::WorkerSupervisor;
use super::writer::RotatingWriter;
use crate::models::event::tags::ServiceEvent;
use crate::models::result::{self, ResultMap};
use crate::models::{Message, WorkflowKind};
use crate::settings::ManagerSettings;
use crate::utils::secs;
use crate::{EdmpError, Result};

/// Reply type of a worker scheduling confirmation
pub const WORKER_SCHEDULED: &str = "worker.scheduled";

struct ProcessorCore {
    settings: ManagerSettings,
    bus: Bus,
    registry: Arc<ExtensionRegistry>,
    context: Context,
    events: EventPublisher,
    reactors: Arc<ReactorEngine>,
    executor: Arc<WorkflowExecutor>,
    workers: WorkerSupervisor,
    admin: AdminWorkflow,
    gate: Arc<ExpirationGate>,
    cache: Option<Arc<CloudCache>>,
    state: StateStore,
    /// Set once shutdown begins; new messages are refused from then on
    closing: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl Dispatcher for ProcessorCore {
    fn admit(&self, message: &Message) -> Result<Admission> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(EdmpError::Cancelled(format!("manager '{}' is shutting down", self.settings.name)));
        }
        if message.workflow() == WorkflowKind::Manage || message.routing.worker.is_some() {
            return Ok(Admission::Concurrent);
        }

        let handler = message
            .handler()
            .ok_or_else(|| EdmpError::InvalidInput("message has no handler".to_string()))?;
        let registration = self.registry.hook(handler)?;
        if message.routing.synchronize && registration.synchronize {
            Ok(Admission::Serialized(handler.to_string()))
        } else {
            Ok(Admission::Concurrent)
        }
    }

    async fn dispatch(&self, message: Message) -> Result<ResultMap> {
        if message.workflow() == WorkflowKind::Manage {
            return self.admin.handle(&message).await;
        }

        if let Some(spec) = message.routing.worker.clone() {
            // The caller only ever gets the scheduling confirmation
            let descriptor = self.workers.start(spec, message.iteration())?;
            let mut reply = match serde_json::to_value(&descriptor)? {
                Value::Object(map) => map,
                _ => ResultMap::new(),
            };
            reply.remove("message");
            result::ensure_envelope(&mut reply, WORKER_SCHEDULED);
            return Ok(reply);
        }

        self.executor.execute(message).await
    }
}

/// Cloneable handle to one manager's processor
#[derive(Clone)]
pub struct MessageProcessor {
    core: Arc<ProcessorCore>,
}

impl MessageProcessor {
    /// Build every component from `settings`
    ///
    /// `cache` overrides the cloud cache described by `settings.cloud_cache`,
    /// which lets tests and embedders supply their own store or uploader.
    pub async fn build(settings: ManagerSettings, cache: Option<Arc<CloudCache>>) -> Result<Self> {
        let settings = settings.normalized()?;
        info!(manager = %settings.name, "building message processor");

        let bus = Bus::new(settings.bus.capacity, secs(settings.bus.timeout));
        let events = EventPublisher::new(
            bus.clone(),
            settings.name.clone(),
            settings.skip_duplicates_filters.clone(),
            settings.trigger_events,
        );
        let registry = Arc::new(ExtensionRegistry::new());
        let context = Context::new();
        let reactors = Arc::new(ReactorEngine::new(bus.clone(), events.clone()));
        let executor = Arc::new(WorkflowExecutor::new(
            registry.clone(),
            context.clone(),
            events.clone(),
            reactors.clone(),
            bus.clone(),
        ));
        let workers = WorkerSupervisor::new(bus.clone(), events.clone());
        let gate = ExpirationGate::new();

        let cache = match (cache, &settings.cloud_cache) {
            (Some(cache), _) => Some(cache),
            (None, Some(config)) => Some(Arc::new(CloudCache::from_config(config.clone()).await?)),
            (None, None) => None,
        };
        let jsonl = settings
            .jsonl_writer()
            .map(|config| RotatingWriter::spawn(JSONL, config))
            .transpose()?
            .map(Arc::new);

        let state = StateStore::new(&settings.state_dir);
        register_builtin_hooks(&registry, state.clone());
        register_builtin_triggers(&registry);
        register_builtin_returners(&registry, &gate, cache.clone(), jsonl).await;

        let admin = AdminWorkflow::new(
            registry.clone(),
            executor.clone(),
            workers.clone(),
            reactors.clone(),
            bus.clone(),
            gate.clone(),
            cache.clone(),
        );

        let core = Arc::new(ProcessorCore {
            settings,
            bus: bus.clone(),
            registry,
            context,
            events,
            reactors,
            executor,
            workers,
            admin,
            gate,
            cache,
            state,
            closing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        });

        let dispatcher: Weak<dyn Dispatcher> = Arc::downgrade(&core) as Weak<dyn Dispatcher>;
        bus.bind(dispatcher)?;
        Ok(Self { core })
    }

    /// Build from a configuration file layered with the environment
    pub async fn from_config_file(path: Option<&Path>) -> Result<Self> {
        Self::build(ManagerSettings::load(path)?, None).await
    }

    /// Start background tasks and configured workers; calling twice is a no-op
    pub async fn start(&self) -> Result<()> {
        let core = &self.core;
        if core.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let settings = &core.settings;

        for hook in &settings.hooks {
            if let Err(e) = core
                .registry
                .configure_hook(&hook.name, hook.synchronize, hook.returner.clone())
            {
                warn!(hook = %hook.name, error = %e, "hook override ignored");
            }
        }

        for reactor in &settings.reactors {
            core.reactors.register_reactor(reactor.clone()).await?;
        }

        let mut background = Vec::new();
        background.push(core.reactors.clone().spawn_loop(core.cancel.child_token()));
        if let Some(cache) = core.cache.as_ref().filter(|cache| cache.has_uploader()) {
            background.push(cache.clone().spawn_uploader(core.events.clone(), core.cancel.child_token()));
        }
        core.background
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(background);

        if let Some(after) = settings.expiration.after {
            let reason = settings
                .expiration
                .reason
                .clone()
                .unwrap_or_else(|| "configured expiration".to_string());
            core.gate.set_expiration(secs(after), reason).await?;
        }

        for definition in &settings.workers {
            let (spec, message) = definition.clone().into_parts()?;
            core.workers.start(spec, message)?;
        }

        if let Err(e) = core.events.emit_service(ServiceEvent::Started, json!({})) {
            warn!(manager = %settings.name, error = %e, "failed to publish service started event");
        }
        info!(
            manager = %settings.name,
            hooks = core.registry.hook_names().len(),
            workers = core.workers.len(),
            "message processor started"
        );
        Ok(())
    }

    /// Ordered shutdown; safe to call more than once
    pub async fn shutdown(&self) {
        let core = &self.core;
        if core.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let timeout = secs(core.settings.shutdown_timeout);
        info!(manager = %core.settings.name, "shutting down message processor");
        if let Err(e) = core.events.emit_service(ServiceEvent::Stopped, json!({})) {
            warn!(manager = %core.settings.name, error = %e, "failed to publish service stopped event");
        }

        // Workers first, so an iteration refused below counts as killed
        core.workers.kill("*");
        core.closing.store(true, Ordering::SeqCst);
        if !core.workers.shutdown(timeout).await {
            warn!("workers did not stop in time");
        }

        core.bus.close();
        if !core.bus.drain(timeout).await {
            warn!("in-flight messages did not finish in time");
        }

        core.registry.close_returners().await;
        core.gate.close_writers().await;

        core.cancel.cancel();
        let background: Vec<JoinHandle<()>> = core
            .background
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        join_all(background).await;
        if let Some(cache) = &core.cache {
            match cache.status().await {
                Ok(status) => debug!(pending = status.pending, failed = status.failed_entries, "cloud cache closed"),
                Err(e) => warn!(error = %e, "cloud cache status unavailable"),
            }
        }
        info!(manager = %core.settings.name, "message processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.core.started.load(Ordering::SeqCst) && !self.core.stopped.load(Ordering::SeqCst)
    }

    /// In-process client bound to this processor's bus
    pub fn client(&self) -> Client {
        Client::new(self.core.bus.clone(), self.core.settings.name.clone())
    }

    pub fn name(&self) -> &str {
        &self.core.settings.name
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.core.settings
    }

    pub fn bus(&self) -> &Bus {
        &self.core.bus
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.core.registry
    }

    pub fn context(&self) -> &Context {
        &self.core.context
    }

    pub fn events(&self) -> &EventPublisher {
        &self.core.events
    }

    pub fn reactors(&self) -> &ReactorEngine {
        &self.core.reactors
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.core.executor
    }

    pub fn workers(&self) -> &WorkerSupervisor {
        &self.core.workers
    }

    pub fn expiration(&self) -> &Arc<ExpirationGate> {
        &self.core.gate
    }

    pub fn cloud_cache(&self) -> Option<&Arc<CloudCache>> {
        self.core.cache.as_ref()
    }

    pub fn state_store(&self) -> &StateStore {
        &self.core.state
    }
}
