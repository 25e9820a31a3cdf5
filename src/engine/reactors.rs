// Listeners over results and reactors over events

//! # Reactor Engine Module
//!
//! This module decides who gets to react once something happened. Two kinds
//! of subscribers are kept here:
//!
//! - **Listeners** observe finished workflows. Each has a [`Matcher`] over
//!   `(message, result)` and a [`Trigger`] action. Matching listeners run in
//!   registration order, each in its own short-lived task.
//! - **Reactors** observe events. Each has a [`Rule`] over the event
//!   (`{tag, data, timestamp}`) and a full message envelope as its action. When
//!   the rule fires, the envelope is submitted on the bus and therefore runs
//!   through the whole workflow, validators and returners included.
//!
//! ## Event References in Reactor Actions
//!
//! Strings of the form `"$event.<path>"` inside a reactor's kwargs are replaced
//! with the matching part of the event before submission, so
//! `{"_handler": "log", "tag": "$event.tag", "level": "$event.data.level"}`
//! forwards the event fields to the hook.
//!
//! ## Rust Learning Notes:
//!
//! ### Arc<dyn Fn> for Predicates
//! Closure matchers are stored as `Arc<dyn Fn(&Message, &ResultMap) -> bool>`.
//! The `Arc` makes the listener cheap to clone into each spawned task.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::Bus;
use super::events::EventPublisher;
use super::registry::Trigger;
use crate::models::message::keys;
use crate::models::result::ResultMap;
use crate::models::{Event, Message, Rule};
use crate::utils::{glob_match, lookup_path};
use crate::{EdmpError, Result};

/// Marker for event references inside reactor actions
pub const EVENT_REFERENCE: &str = "$event.";

type Predicate = Arc<dyn Fn(&Message, &ResultMap) -> bool + Send + Sync>;

/// Decides whether a listener fires for a given result
#[derive(Clone)]
pub enum Matcher {
    /// Declarative rule evaluated against the result (plus `_handler`)
    Rule(Rule),
    /// Arbitrary predicate
    Predicate(Predicate),
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Rule(rule) => f.debug_tuple("Rule").field(&rule.id).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl Matcher {
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Message, &ResultMap) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(predicate))
    }

    pub fn matches(&self, message: &Message, result: &ResultMap) -> bool {
        match self {
            Matcher::Rule(rule) => {
                let mut subject = result.clone();
                if let Some(handler) = message.handler() {
                    subject
                        .entry(keys::HANDLER.to_string())
                        .or_insert_with(|| Value::String(handler.to_string()));
                }
                rule.evaluate(&Value::Object(subject))
            }
            Matcher::Predicate(predicate) => predicate(message, result),
        }
    }
}

/// A lightweight result subscriber
pub struct Listener {
    pub name: String,
    pub matcher: Matcher,
    /// Also receive `{error}` results and handler failures
    pub on_error: bool,
    pub action: Arc<dyn Trigger>,
}

impl Listener {
    pub fn new(name: impl Into<String>, matcher: Matcher, action: Arc<dyn Trigger>) -> Self {
        Self {
            name: name.into(),
            matcher,
            on_error: false,
            action,
        }
    }

    pub fn with_on_error(mut self, on_error: bool) -> Self {
        self.on_error = on_error;
        self
    }
}

fn default_true() -> bool {
    true
}

/// An event-driven message, as declared in configuration
///
/// ```json
/// {
///   "name": "sleep_on_power_off",
///   "matcher": {"id": "power_off", "condition": {"type": "FieldEquals", "field": "tag", "value": "system/power/off"}},
///   "action": {"_handler": "sleep", "seconds": 1},
///   "synchronize": false
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactorDescriptor {
    pub name: String,
    pub matcher: Rule,
    /// Message envelope submitted when the matcher fires
    pub action: Value,
    #[serde(default = "default_true")]
    pub synchronize: bool,
}

/// Listener and reactor registry
pub struct ReactorEngine {
    bus: Bus,
    events: EventPublisher,
    listeners: RwLock<Vec<Arc<Listener>>>,
    reactors: RwLock<Vec<ReactorDescriptor>>,
}

impl ReactorEngine {
    pub fn new(bus: Bus, events: EventPublisher) -> Self {
        Self {
            bus,
            events,
            listeners: RwLock::new(Vec::new()),
            reactors: RwLock::new(Vec::new()),
        }
    }

    pub async fn register_listener(&self, listener: Listener) {
        debug!(listener = %listener.name, "registering listener");
        self.listeners.write().await.push(Arc::new(listener));
    }

    pub async fn listener_names(&self) -> Vec<String> {
        self.listeners.read().await.iter().map(|l| l.name.clone()).collect()
    }

    /// Register a reactor; names are unique and the action must be a valid envelope
    pub async fn register_reactor(&self, descriptor: ReactorDescriptor) -> Result<()> {
        Message::unpack(descriptor.action.clone())?;

        let mut reactors = self.reactors.write().await;
        if reactors.iter().any(|r| r.name == descriptor.name) {
            return Err(EdmpError::InvalidInput(format!(
                "reactor '{}' is already registered",
                descriptor.name
            )));
        }
        debug!(reactor = %descriptor.name, "registering reactor");
        reactors.push(descriptor);
        Ok(())
    }

    /// Names of reactors matching a `*` glob
    pub async fn list(&self, pattern: &str) -> Vec<String> {
        self.reactors
            .read()
            .await
            .iter()
            .filter(|r| glob_match(pattern, &r.name))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Full descriptors of reactors matching a `*` glob
    pub async fn show(&self, pattern: &str) -> Vec<ReactorDescriptor> {
        self.reactors
            .read()
            .await
            .iter()
            .filter(|r| glob_match(pattern, &r.name))
            .cloned()
            .collect()
    }

    /// Hand a finished workflow to every matching listener
    ///
    /// Error results only reach listeners that opted in with `on_error`.
    pub async fn notify(&self, message: Arc<Message>, result: ResultMap, is_error: bool) {
        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .read()
            .await
            .iter()
            .filter(|l| !is_error || l.on_error)
            .filter(|l| l.matcher.matches(&message, &result))
            .cloned()
            .collect();

        for listener in listeners {
            let message = message.clone();
            let result = result.clone();
            let events = self.events.clone();
            self.bus.spawn(async move {
                if let Err(e) = listener.action.fire(&message, &result, &events).await {
                    warn!(correlation_id = %message.id, listener = %listener.name, error = %e, "listener failed");
                }
            });
        }
    }

    /// Submit the action of every reactor whose matcher accepts `event`
    pub async fn react(&self, event: &Event) -> Vec<Uuid> {
        let subject = event.as_value();
        let matching: Vec<ReactorDescriptor> = self
            .reactors
            .read()
            .await
            .iter()
            .filter(|r| r.matcher.evaluate(&subject))
            .cloned()
            .collect();

        let mut submitted = Vec::new();
        for reactor in matching {
            match self.build_action(&reactor, &subject) {
                Ok(message) => match self.bus.submit(message) {
                    Ok(id) => {
                        debug!(reactor = %reactor.name, tag = %event.tag, correlation_id = %id, "reactor fired");
                        submitted.push(id);
                    }
                    Err(e) => warn!(reactor = %reactor.name, error = %e, "reactor submission failed"),
                },
                Err(e) => warn!(reactor = %reactor.name, error = %e, "reactor action is invalid"),
            }
        }
        submitted
    }

    fn build_action(&self, reactor: &ReactorDescriptor, subject: &Value) -> Result<Message> {
        let mut message = Message::unpack(reactor.action.clone())?;
        message.kwargs = resolve_event_references(&message.kwargs, subject)?;
        if !reactor.synchronize {
            message.routing.synchronize = false;
        }
        Ok(message)
    }

    /// Feed every event on the bus to [`ReactorEngine::react`] until cancelled
    pub fn spawn_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut subscription = self.events.subscribe();
        tokio::spawn(async move {
            info!("reactor loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = subscription.recv() => match received {
                        Ok(publication) => {
                            if let Some(event) = publication.event() {
                                self.react(event).await;
                            }
                        }
                        Err(_) => break,
                    },
                }
            }
            info!("reactor loop stopped");
        })
    }
}

fn resolve_event_references(kwargs: &Map<String, Value>, subject: &Value) -> Result<Map<String, Value>> {
    kwargs
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_event_value(value, subject)?)))
        .collect()
}

fn resolve_event_value(value: &Value, subject: &Value) -> Result<Value> {
    match value {
        Value::String(text) => match text.strip_prefix(EVENT_REFERENCE) {
            Some(path) => lookup_path(subject, path)
                .cloned()
                .ok_or_else(|| EdmpError::UnresolvedKeyword(text.clone())),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_event_value(item, subject))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => resolve_event_references(map, subject).map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::{Admission, Dispatcher};
    use crate::engine::registry::FnTrigger;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Mutex, Weak};
    use std::time::Duration;

    struct Collector {
        messages: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Dispatcher for Collector {
        fn admit(&self, _message: &Message) -> Result<Admission> {
            Ok(Admission::Concurrent)
        }

        async fn dispatch(&self, message: Message) -> Result<ResultMap> {
            self.messages.lock().unwrap().push(message);
            Ok(ResultMap::new())
        }
    }

    fn engine() -> (Arc<ReactorEngine>, Arc<Collector>, Bus) {
        let bus = Bus::default();
        let collector = Arc::new(Collector { messages: Mutex::new(Vec::new()) });
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&collector) as Weak<dyn Dispatcher>;
        bus.bind(weak).unwrap();
        let events = EventPublisher::new(bus.clone(), "test", Vec::new(), false);
        (Arc::new(ReactorEngine::new(bus.clone(), events)), collector, bus)
    }

    fn power_off_reactor(name: &str) -> ReactorDescriptor {
        serde_json::from_value(json!({
            "name": name,
            "matcher": {"id": "power_off", "condition": {"type": "FieldEquals", "field": "tag", "value": "system/power/off"}},
            "action": {"_handler": "shutdown", "reason": "$event.data.reason", "source": "$event.tag"},
            "synchronize": false,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_reactor_fires_with_event_references() {
        let (engine, collector, _bus) = engine();
        engine.register_reactor(power_off_reactor("power_off")).await.unwrap();

        let ids = engine
            .react(&Event::new("system/power/off", json!({"reason": "ignition"})))
            .await;
        assert_eq!(ids.len(), 1);
        assert!(engine.react(&Event::new("system/power/on", json!({}))).await.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let messages = collector.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].handler(), Some("shutdown"));
        assert_eq!(messages[0].kwargs["reason"], json!("ignition"));
        assert_eq!(messages[0].kwargs["source"], json!("system/power/off"));
        assert!(!messages[0].routing.synchronize);
    }

    #[tokio::test]
    async fn test_reactor_registry_introspection() {
        let (engine, _collector, _bus) = engine();
        engine.register_reactor(power_off_reactor("power_off")).await.unwrap();
        engine.register_reactor(power_off_reactor("power_log")).await.unwrap();
        assert!(engine.register_reactor(power_off_reactor("power_off")).await.is_err());

        let mut bad = power_off_reactor("broken");
        bad.action = json!({"no_handler": true});
        assert!(engine.register_reactor(bad).await.is_err());

        assert_eq!(engine.list("power_*").await, vec!["power_off".to_string(), "power_log".to_string()]);
        assert_eq!(engine.show("power_log").await.len(), 1);
        assert!(engine.list("engine_*").await.is_empty());
    }

    #[tokio::test]
    async fn test_listeners_respect_matcher_and_error_opt_in() {
        let (engine, _collector, _bus) = engine();
        let heard = Arc::new(Mutex::new(Vec::new()));

        for (name, on_error) in [("plain", false), ("errors_too", true)] {
            let heard = heard.clone();
            let action = Arc::new(FnTrigger::new(move |_m: Message, _r: ResultMap, _e: EventPublisher| {
                let heard = heard.clone();
                async move {
                    heard.lock().unwrap().push(name);
                    Ok(())
                }
            }));
            let matcher = Matcher::predicate(|message: &Message, _result: &ResultMap| message.handler() == Some("query"));
            engine
                .register_listener(Listener::new(name, matcher, action).with_on_error(on_error))
                .await;
        }

        let message = Arc::new(Message::new("query"));
        let mut error = ResultMap::new();
        error.insert("error".to_string(), json!("boom"));
        engine.notify(message.clone(), error, true).await;
        engine.notify(Arc::new(Message::new("other")), ResultMap::new(), false).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*heard.lock().unwrap(), vec!["errors_too"]);
        assert_eq!(engine.listener_names().await, vec!["plain".to_string(), "errors_too".to_string()]);
    }

    #[tokio::test]
    async fn test_rule_matcher_sees_handler() {
        let matcher = Matcher::Rule(Rule::field_equals("from_query", "_handler", json!("query")));
        assert!(matcher.matches(&Message::new("query"), &ResultMap::new()));
        assert!(!matcher.matches(&Message::new("echo"), &ResultMap::new()));
    }

    #[tokio::test]
    async fn test_loop_consumes_published_events() {
        let (engine, collector, bus) = engine();
        engine.register_reactor(power_off_reactor("power_off")).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = engine.clone().spawn_loop(cancel.clone());
        let events = EventPublisher::new(bus, "test", Vec::new(), false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        events.emit("system/power/off", json!({"reason": "low_voltage"})).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(collector.messages.lock().unwrap()[0].kwargs["reason"], json!("low_voltage"));
    }
}
