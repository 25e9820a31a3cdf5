// Shared context tree for keyword resolution

//! # Context
//!
//! Every manager keeps one mutable JSON tree that hooks can read and write
//! (the `context_get` / `context_set` hooks, triggers that remember previous
//! readings, ...). A message with `keyword_resolve` set gets each `"$a.b"`
//! kwarg replaced by `context["a"]["b"]` right before the handler runs.
//!
//! Resolution works on a snapshot taken once per message, so a kwarg pass never
//! observes a half-applied update.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::utils::lookup_path;
use crate::{EdmpError, Result};

/// Prefix marking a kwarg value as a context reference
pub const KEYWORD_MARKER: char = '$';

/// Shared, lock-protected context tree
#[derive(Clone)]
pub struct Context {
    tree: Arc<RwLock<Value>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }

    pub fn from_value(tree: Value) -> Self {
        Self {
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    /// A consistent copy of the whole tree
    pub async fn snapshot(&self) -> Value {
        self.tree.read().await.clone()
    }

    pub async fn get(&self, path: &str) -> Option<Value> {
        let tree = self.tree.read().await;
        lookup_path(&tree, path).cloned()
    }

    /// Set `path` to `value`, creating intermediate objects as needed
    pub async fn set(&self, path: &str, value: Value) -> Result<()> {
        let mut tree = self.tree.write().await;
        set_path(&mut tree, path, value)
    }

    pub async fn remove(&self, path: &str) -> Option<Value> {
        let mut guard = self.tree.write().await;
        let tree: &mut Value = &mut guard;
        let (parent, leaf) = match path.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, path),
        };
        let node = match parent {
            Some(parent) => lookup_path_mut(tree, parent)?,
            None => tree,
        };
        node.as_object_mut()?.remove(leaf)
    }

    /// Run `update` with exclusive access to the tree
    pub async fn update<F, R>(&self, update: F) -> R
    where
        F: FnOnce(&mut Value) -> R,
    {
        let mut tree = self.tree.write().await;
        update(&mut tree)
    }
}

fn lookup_path_mut<'a>(tree: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(tree, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

fn set_path(tree: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        return Err(EdmpError::InvalidInput("context path must not be empty".to_string()));
    }

    let mut node = tree;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        let map = node.as_object_mut().ok_or_else(|| {
            EdmpError::InvalidInput(format!("context path '{}' crosses a non-object", path))
        })?;

        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

/// Resolve every `$path` string in `kwargs` against a context snapshot
///
/// Nested objects and arrays are walked as well. A missing path fails with
/// `unresolved_keyword`.
pub fn resolve_keywords(kwargs: &Map<String, Value>, snapshot: &Value) -> Result<Map<String, Value>> {
    kwargs
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, snapshot)?)))
        .collect()
}

fn resolve_value(value: &Value, snapshot: &Value) -> Result<Value> {
    match value {
        Value::String(text) => match text.strip_prefix(KEYWORD_MARKER) {
            Some(path) if !path.is_empty() => lookup_path(snapshot, path)
                .cloned()
                .ok_or_else(|| EdmpError::UnresolvedKeyword(text.clone())),
            Some(_) => Err(EdmpError::UnresolvedKeyword(text.clone())),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, snapshot))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => resolve_keywords(map, snapshot).map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let context = Context::new();
        context.set("vehicle.speed", json!(42)).await.unwrap();
        context.set("vehicle.engine.state", json!("running")).await.unwrap();

        assert_eq!(context.get("vehicle.speed").await, Some(json!(42)));
        assert_eq!(context.get("vehicle.engine.state").await, Some(json!("running")));

        assert_eq!(context.remove("vehicle.speed").await, Some(json!(42)));
        assert_eq!(context.get("vehicle.speed").await, None);
        assert!(context.set("vehicle.engine.state.deep", json!(1)).await.is_err());
    }

    #[test]
    fn test_resolve_keywords() {
        let snapshot = json!({"a": {"b": 7}, "unit": "kmh"});
        let kwargs = match json!({
            "plain": "text",
            "bound": "$a.b",
            "nested": {"unit": "$unit"},
            "list": ["$a.b", 1],
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let resolved = resolve_keywords(&kwargs, &snapshot).unwrap();
        assert_eq!(resolved["plain"], json!("text"));
        assert_eq!(resolved["bound"], json!(7));
        assert_eq!(resolved["nested"], json!({"unit": "kmh"}));
        assert_eq!(resolved["list"], json!([7, 1]));
    }

    #[test]
    fn test_missing_keyword_fails() {
        let mut kwargs = Map::new();
        kwargs.insert("x".to_string(), json!("$a.missing"));
        let err = resolve_keywords(&kwargs, &json!({"a": {}})).unwrap_err();
        assert_eq!(err.kind(), "unresolved_keyword");
    }

    #[tokio::test]
    async fn test_update_is_exclusive() {
        let context = Context::new();
        let previous = context
            .update(|tree| {
                let old = tree.get("counter").cloned();
                tree["counter"] = json!(1);
                old
            })
            .await;
        assert_eq!(previous, None);
        assert_eq!(context.snapshot().await, json!({"counter": 1}));
    }
}
