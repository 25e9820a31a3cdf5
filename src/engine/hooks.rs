// Built-in hooks every manager registers

//! # Built-in Hooks
//!
//! | hook          | arguments                     | returns                          |
//! |---------------|-------------------------------|----------------------------------|
//! | `echo`        | anything                      | kwargs, or args when no kwargs   |
//! | `context_get` | `path`                        | `{path, value}`                  |
//! | `context_set` | `path`, `value`               | `{path, value}`                  |
//! | `sleep`       | `seconds`                     | `{slept}`                        |
//! | `state_save`  | `name`, `value`               | `{name}`                         |
//! | `state_load`  | `name`                        | `{name, value}` (value may be null) |
//!
//! `sleep` does not take the per-handler lock so workers and tests can run it
//! side by side.

use std::sync::Arc;

use serde_json::{json, Value};

use super::persistence::StateStore;
use super::registry::{ExtensionRegistry, FnHook, HookCall, HookRegistration};
use crate::utils::secs;
use crate::{EdmpError, Result};

fn required_str<'a>(call: &'a HookCall, name: &str, index: usize) -> Result<&'a str> {
    call.arg(name, index)
        .and_then(Value::as_str)
        .ok_or_else(|| EdmpError::InvalidInput(format!("'{}' must be a string", name)))
}

async fn echo(call: HookCall) -> Result<Value> {
    if call.kwargs.is_empty() && !call.args.is_empty() {
        return Ok(Value::Array(call.args));
    }
    Ok(Value::Object(call.kwargs))
}

async fn context_get(call: HookCall) -> Result<Value> {
    let path = required_str(&call, "path", 0)?;
    let value = call.context.get(path).await.unwrap_or(Value::Null);
    Ok(json!({"path": path, "value": value}))
}

async fn context_set(call: HookCall) -> Result<Value> {
    let path = required_str(&call, "path", 0)?.to_string();
    let value = call.arg("value", 1).cloned().unwrap_or(Value::Null);
    call.context.set(&path, value.clone()).await?;
    Ok(json!({"path": path, "value": value}))
}

async fn sleep(call: HookCall) -> Result<Value> {
    let seconds = call
        .arg("seconds", 0)
        .and_then(Value::as_f64)
        .ok_or_else(|| EdmpError::InvalidInput("'seconds' must be a number".to_string()))?;
    tokio::time::sleep(secs(seconds)).await;
    Ok(json!({"slept": seconds}))
}

/// Register the built-in hooks
pub fn register_builtin_hooks(registry: &ExtensionRegistry, state: StateStore) {
    registry.register_hook(HookRegistration::new("echo", Arc::new(FnHook::new(echo))).with_synchronize(false));
    registry.register_hook(
        HookRegistration::new("context_get", Arc::new(FnHook::new(context_get)))
            .with_synchronize(false)
            .with_required_kwargs(["path"]),
    );
    registry.register_hook(
        HookRegistration::new("context_set", Arc::new(FnHook::new(context_set)))
            .with_required_kwargs(["path"]),
    );
    registry.register_hook(
        HookRegistration::new("sleep", Arc::new(FnHook::new(sleep))).with_synchronize(false),
    );

    let store = state.clone();
    registry.register_hook(
        HookRegistration::new(
            "state_save",
            Arc::new(FnHook::new(move |call: HookCall| {
                let store = store.clone();
                async move {
                    let name = required_str(&call, "name", 0)?.to_string();
                    let value = call.arg("value", 1).cloned().unwrap_or(Value::Null);
                    store.save(&name, &value).await?;
                    Ok(json!({"name": name}))
                }
            })),
        )
        .with_required_kwargs(["name"]),
    );

    registry.register_hook(
        HookRegistration::new(
            "state_load",
            Arc::new(FnHook::new(move |call: HookCall| {
                let store = state.clone();
                async move {
                    let name = required_str(&call, "name", 0)?.to_string();
                    let value = store.load(&name).await?.unwrap_or(Value::Null);
                    Ok(json!({"name": name, "value": value}))
                }
            })),
        )
        .with_synchronize(false)
        .with_required_kwargs(["name"]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::Context;
    use serde_json::Map;

    fn call(kwargs: Value, context: &Context) -> HookCall {
        let kwargs: Map<String, Value> = serde_json::from_value(kwargs).unwrap();
        HookCall::new(Vec::new(), kwargs, context.clone())
    }

    fn registry(dir: &std::path::Path) -> ExtensionRegistry {
        let registry = ExtensionRegistry::new();
        register_builtin_hooks(&registry, StateStore::new(dir));
        registry
    }

    #[tokio::test]
    async fn test_echo_returns_kwargs_or_args() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let context = Context::new();
        let echo = registry.hook("echo").unwrap();

        let out = echo.invoke(call(json!({"speed": 42}), &context), true).await.unwrap();
        assert_eq!(out, json!({"speed": 42}));

        let positional = HookCall::new(vec![json!(1), json!(2)], Map::new(), context);
        assert_eq!(echo.invoke(positional, true).await.unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_context_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let context = Context::new();

        registry
            .hook("context_set")
            .unwrap()
            .invoke(call(json!({"path": "vehicle.vin", "value": "WVW123"}), &context), true)
            .await
            .unwrap();
        let out = registry
            .hook("context_get")
            .unwrap()
            .invoke(call(json!({"path": "vehicle.vin"}), &context), true)
            .await
            .unwrap();
        assert_eq!(out["value"], json!("WVW123"));
        assert_eq!(context.get("vehicle.vin").await, Some(json!("WVW123")));
    }

    #[tokio::test]
    async fn test_state_hooks_persist() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let context = Context::new();

        registry
            .hook("state_save")
            .unwrap()
            .invoke(call(json!({"name": "odometer", "value": {"km": 1200}}), &context), true)
            .await
            .unwrap();
        let out = registry
            .hook("state_load")
            .unwrap()
            .invoke(call(json!({"name": "odometer"}), &context), true)
            .await
            .unwrap();
        assert_eq!(out["value"], json!({"km": 1200}));
    }

    #[tokio::test]
    async fn test_required_kwargs_declared() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let err = registry.hook("context_get").unwrap().check_kwargs(&Map::new()).unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
    }

    #[tokio::test]
    async fn test_sleep_requires_number() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let sleep = registry.hook("sleep").unwrap();
        assert!(sleep.invoke(call(json!({"seconds": "soon"}), &Context::new()), false).await.is_err());
        let out = sleep.invoke(call(json!({"seconds": 0.01}), &Context::new()), false).await.unwrap();
        assert_eq!(out, json!({"slept": 0.01}));
    }
}
