// Named extension catalogs

//! # Extension Registry
//!
//! Every stage of a workflow is looked up by name in this registry. Hooks are
//! the handlers proper; validators, converters and filters are plain closures;
//! triggers and returners are async trait objects because they talk to the bus
//! or to external sinks.
//!
//! Unknown names are rejected with `unknown_handler`; nothing is ever resolved by
//! reflection.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects in Concurrent Maps
//! Registrations are stored as `Arc<dyn Trait>` inside `DashMap`s. Lookups
//! clone the `Arc` out of the map right away so no shard guard is ever held
//! across an `.await`.
//!
//! ### Closures as Extensions
//! `FnHook`, `FnTrigger` and `FnReturner` adapt plain async closures to the
//! traits, so a manager can register `|call| async move { ... }` directly.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::context::Context;
use super::events::EventPublisher;
use crate::models::{Message, ResultMap};
use crate::{EdmpError, Result};

/// Everything a hook receives for one invocation
#[derive(Clone)]
pub struct HookCall {
    pub correlation_id: Uuid,
    pub args: Vec<Value>,
    /// Keyword arguments with reserved keys stripped and keywords resolved
    pub kwargs: Map<String, Value>,
    pub context: Context,
}

impl HookCall {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>, context: Context) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            args,
            kwargs,
            context,
        }
    }

    /// Keyword argument `name`, falling back to positional argument `index`
    pub fn arg(&self, name: &str, index: usize) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }
}

/// The handler stage of a workflow
///
/// The returned value is wrapped into a result: scalar → `{value}`,
/// sequence → `{values}`, object → verbatim, null → `{}`.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, call: HookCall) -> Result<Value>;
}

/// Side-effect stage; may publish events but never mutates the result
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn fire(&self, message: &Message, result: &ResultMap, events: &EventPublisher) -> Result<()>;

    /// Whether `{error}` results are fired too instead of short-circuiting
    fn accepts_errors(&self) -> bool {
        false
    }
}

/// Terminal sink for results
#[async_trait]
pub trait Returner: Send + Sync {
    async fn deliver(&self, message: &Message, result: &ResultMap) -> Result<()>;

    /// Whether `{error}` results are delivered too instead of short-circuiting
    fn accepts_errors(&self) -> bool {
        false
    }

    /// Release any resources held by the returner
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Pure predicate over `(args, kwargs, context snapshot)`; `Some(reason)` rejects
pub type ValidatorFn = Arc<dyn Fn(&[Value], &Map<String, Value>, &Value) -> Option<String> + Send + Sync>;

/// Result transformation; `Ok(None)` drops the result
pub type ConverterFn = Arc<dyn Fn(ResultMap) -> Result<Option<ResultMap>> + Send + Sync>;

/// Result gate; `Ok(None)` terminates the chain silently
pub type FilterFn = Arc<dyn Fn(ResultMap) -> Result<Option<ResultMap>> + Send + Sync>;

/// Adapter turning an async closure into a [`Hook`]
pub struct FnHook<F>(F);

impl<F> FnHook<F> {
    pub fn new(function: F) -> Self {
        Self(function)
    }
}

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(HookCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, call: HookCall) -> Result<Value> {
        (self.0)(call).await
    }
}

/// Adapter turning an async closure into a [`Trigger`]
///
/// The closure receives owned copies so it can move them into its future.
pub struct FnTrigger<F> {
    function: F,
    errors: bool,
}

impl<F> FnTrigger<F> {
    pub fn new(function: F) -> Self {
        Self { function, errors: false }
    }

    /// Also fire on `{error}` results
    pub fn with_errors(mut self) -> Self {
        self.errors = true;
        self
    }
}

#[async_trait]
impl<F, Fut> Trigger for FnTrigger<F>
where
    F: Fn(Message, ResultMap, EventPublisher) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn fire(&self, message: &Message, result: &ResultMap, events: &EventPublisher) -> Result<()> {
        (self.function)(message.clone(), result.clone(), events.clone()).await
    }

    fn accepts_errors(&self) -> bool {
        self.errors
    }
}

/// Adapter turning an async closure into a [`Returner`]
pub struct FnReturner<F> {
    function: F,
    errors: bool,
}

impl<F> FnReturner<F> {
    pub fn new(function: F) -> Self {
        Self { function, errors: false }
    }

    /// Also deliver `{error}` results
    pub fn with_errors(mut self) -> Self {
        self.errors = true;
        self
    }
}

#[async_trait]
impl<F, Fut> Returner for FnReturner<F>
where
    F: Fn(Message, ResultMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn deliver(&self, message: &Message, result: &ResultMap) -> Result<()> {
        (self.function)(message.clone(), result.clone()).await
    }

    fn accepts_errors(&self) -> bool {
        self.errors
    }
}

/// A registered hook with its dispatch options
#[derive(Clone)]
pub struct HookRegistration {
    pub name: String,
    pub hook: Arc<dyn Hook>,
    /// Default for messages that do not override `_synchronize`
    pub synchronize: bool,
    /// Returner used when the message names none
    pub returner: Option<String>,
    /// Kwargs that must be present before dispatch
    pub required_kwargs: Vec<String>,
    lock: Arc<Mutex<()>>,
}

impl HookRegistration {
    pub fn new(name: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        Self {
            name: name.into(),
            hook,
            synchronize: true,
            returner: None,
            required_kwargs: Vec::new(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_synchronize(mut self, synchronize: bool) -> Self {
        self.synchronize = synchronize;
        self
    }

    pub fn with_returner(mut self, returner: impl Into<String>) -> Self {
        self.returner = Some(returner.into());
        self
    }

    pub fn with_required_kwargs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_kwargs = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Fail with `validation_failed` when a required kwarg is missing
    pub fn check_kwargs(&self, kwargs: &Map<String, Value>) -> Result<()> {
        let missing: Vec<&str> = self
            .required_kwargs
            .iter()
            .filter(|key| !kwargs.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EdmpError::ValidationFailed(format!(
                "hook '{}' is missing required kwargs: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }

    /// Invoke the hook, holding its FIFO lock when both sides ask for it
    pub async fn invoke(&self, call: HookCall, synchronize: bool) -> Result<Value> {
        if synchronize && self.synchronize {
            let _guard = self.lock.lock().await;
            self.hook.call(call).await
        } else {
            self.hook.call(call).await
        }
    }
}

/// Named catalogs of every extension kind
#[derive(Default)]
pub struct ExtensionRegistry {
    hooks: DashMap<String, HookRegistration>,
    validators: DashMap<String, ValidatorFn>,
    converters: DashMap<String, ConverterFn>,
    filters: DashMap<String, FilterFn>,
    triggers: DashMap<String, Arc<dyn Trigger>>,
    returners: DashMap<String, Arc<dyn Returner>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a hook
    ///
    /// A replacement keeps the FIFO lock of the registration it replaces so
    /// in-flight callers stay serialized with new ones.
    pub fn register_hook(&self, mut registration: HookRegistration) {
        if let Some(existing) = self.hooks.get(&registration.name) {
            registration.lock = existing.lock.clone();
        }
        debug!(hook = %registration.name, "registering hook");
        self.hooks.insert(registration.name.clone(), registration);
    }

    /// Register an async closure as a synchronized hook
    pub fn register_fn_hook<F, Fut>(&self, name: &str, function: F)
    where
        F: Fn(HookCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register_hook(HookRegistration::new(name, Arc::new(FnHook::new(function))));
    }

    pub fn hook(&self, name: &str) -> Result<HookRegistration> {
        self.hooks
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EdmpError::UnknownHandler(format!("no hook named '{}'", name)))
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// Sorted hook names
    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Apply configuration overrides to a registered hook
    pub fn configure_hook(&self, name: &str, synchronize: Option<bool>, returner: Option<String>) -> Result<()> {
        let mut entry = self
            .hooks
            .get_mut(name)
            .ok_or_else(|| EdmpError::UnknownHandler(format!("no hook named '{}'", name)))?;
        if let Some(synchronize) = synchronize {
            entry.synchronize = synchronize;
        }
        if returner.is_some() {
            entry.returner = returner;
        }
        Ok(())
    }

    pub fn register_validator<F>(&self, name: &str, validator: F)
    where
        F: Fn(&[Value], &Map<String, Value>, &Value) -> Option<String> + Send + Sync + 'static,
    {
        self.validators.insert(name.to_string(), Arc::new(validator));
    }

    pub fn validator(&self, name: &str) -> Result<ValidatorFn> {
        self.validators
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EdmpError::UnknownHandler(format!("no validator named '{}'", name)))
    }

    pub fn register_converter<F>(&self, name: &str, converter: F)
    where
        F: Fn(ResultMap) -> Result<Option<ResultMap>> + Send + Sync + 'static,
    {
        self.converters.insert(name.to_string(), Arc::new(converter));
    }

    pub fn converter(&self, name: &str) -> Result<ConverterFn> {
        self.converters
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EdmpError::UnknownHandler(format!("no converter named '{}'", name)))
    }

    pub fn register_filter<F>(&self, name: &str, filter: F)
    where
        F: Fn(ResultMap) -> Result<Option<ResultMap>> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(filter));
    }

    pub fn filter(&self, name: &str) -> Result<FilterFn> {
        self.filters
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EdmpError::UnknownHandler(format!("no filter named '{}'", name)))
    }

    pub fn register_trigger(&self, name: &str, trigger: Arc<dyn Trigger>) {
        self.triggers.insert(name.to_string(), trigger);
    }

    pub fn trigger(&self, name: &str) -> Result<Arc<dyn Trigger>> {
        self.triggers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EdmpError::UnknownHandler(format!("no trigger named '{}'", name)))
    }

    pub fn register_returner(&self, name: &str, returner: Arc<dyn Returner>) {
        self.returners.insert(name.to_string(), returner);
    }

    pub fn returner(&self, name: &str) -> Result<Arc<dyn Returner>> {
        self.returners
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EdmpError::UnknownHandler(format!("no returner named '{}'", name)))
    }

    pub fn returner_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.returners.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Close every returner; failures are logged and skipped
    pub async fn close_returners(&self) {
        let returners: Vec<(String, Arc<dyn Returner>)> = self
            .returners
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (name, returner) in returners {
            if let Err(e) = returner.close().await {
                warn!(returner = %name, error = %e, "failed to close returner");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn call_with(kwargs: Value) -> HookCall {
        let kwargs = match kwargs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        HookCall::new(Vec::new(), kwargs, Context::new())
    }

    #[tokio::test]
    async fn test_unknown_names_are_rejected() {
        let registry = ExtensionRegistry::new();
        assert_eq!(registry.hook("nope").err().map(|e| e.kind()), Some("unknown_handler"));
        assert!(registry.converter("nope").is_err());
        assert!(registry.returner("nope").is_err());
    }

    #[tokio::test]
    async fn test_fn_hook_roundtrip() {
        let registry = ExtensionRegistry::new();
        registry.register_fn_hook("double", |call: HookCall| async move {
            let n = call.arg("n", 0).and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(n * 2))
        });

        let registration = registry.hook("double").unwrap();
        let value = registration.invoke(call_with(json!({"n": 21})), true).await.unwrap();
        assert_eq!(value, json!(42));
        assert_eq!(registry.hook_names(), vec!["double".to_string()]);
    }

    #[test]
    fn test_required_kwargs() {
        let registration = HookRegistration::new(
            "query",
            Arc::new(FnHook::new(|_call: HookCall| async move { Ok(Value::Null) })),
        )
        .with_required_kwargs(["mode", "pid"]);

        let err = registration.check_kwargs(&call_with(json!({"mode": "01"})).kwargs).unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
        assert!(err.to_string().contains("pid"));
        assert!(registration.check_kwargs(&call_with(json!({"mode": "01", "pid": 12})).kwargs).is_ok());
    }

    #[tokio::test]
    async fn test_synchronized_hook_never_overlaps() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let registry = Arc::new(ExtensionRegistry::new());
        {
            let active = active.clone();
            let peak = peak.clone();
            registry.register_fn_hook("slow", move |_call: HookCall| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            });
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registration = registry.hook("slow").unwrap();
            handles.push(tokio::spawn(async move {
                registration.invoke(call_with(json!({})), true).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_configure_hook_and_replacement_keep_lock() {
        let registry = ExtensionRegistry::new();
        registry.register_fn_hook("echo", |call: HookCall| async move { Ok(Value::Object(call.kwargs)) });
        let before = registry.hook("echo").unwrap();

        registry.configure_hook("echo", Some(false), Some("log".to_string())).unwrap();
        let after = registry.hook("echo").unwrap();
        assert!(!after.synchronize);
        assert_eq!(after.returner.as_deref(), Some("log"));
        assert!(Arc::ptr_eq(&before.lock, &after.lock));

        registry.register_fn_hook("echo", |_call: HookCall| async move { Ok(Value::Null) });
        assert!(Arc::ptr_eq(&before.lock, &registry.hook("echo").unwrap().lock));
        assert!(registry.configure_hook("missing", None, None).is_err());
    }
}
