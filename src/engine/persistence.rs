// Small JSON state files keyed by object name

//! # State Store
//!
//! Managers keep a few small documents across restarts (last known engine
//! state, counters, the odd history list). Each document is one JSON file
//! `<dir>/<name>.json`. Writes go to a temporary file in the same directory
//! that is synced and then renamed over the target, so a reader sees either
//! the old document or the new one.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{EdmpError, Result};

const EXTENSION: &str = "json";

/// Directory of JSON state files
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, EXTENSION)))
    }

    /// The stored document, or `None` if it was never saved
    pub async fn load(&self, name: &str) -> Result<Option<Value>> {
        let path = self.path(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the document
    pub async fn save(&self, name: &str, value: &Value) -> Result<()> {
        let path = self.path(name)?;
        fs::create_dir_all(&self.dir).await?;

        let tmp = self.dir.join(format!(".{}.{}.tmp", name, EXTENSION));
        let bytes = serde_json::to_vec_pretty(value)?;
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &path).await?;
        debug!(name, path = %path.display(), "state saved");
        Ok(())
    }

    /// Append to a list document, keeping at most `limit` newest entries (0 = no limit)
    pub async fn append(&self, name: &str, entry: Value, limit: usize) -> Result<usize> {
        let mut items = match self.load(name).await? {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        items.push(entry);
        if limit > 0 && items.len() > limit {
            let excess = items.len() - limit;
            items.drain(..excess);
        }
        let len = items.len();
        self.save(name, &Value::Array(items)).await?;
        Ok(len)
    }

    /// Delete the document; returns whether it existed
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every stored document, sorted
    pub async fn names(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Names are plain file stems: letters, digits, `_`, `-` and `.`, not starting with `.`
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EdmpError::InvalidInput(format!("invalid state name '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));

        assert_eq!(store.load("engine").await.unwrap(), None);
        assert_ok!(store.save("engine", &json!({"state": "running"})).await);
        assert_eq!(store.load("engine").await.unwrap(), Some(json!({"state": "running"})));

        assert_ok!(store.save("engine", &json!({"state": "stopped"})).await);
        assert_eq!(store.load("engine").await.unwrap(), Some(json!({"state": "stopped"})));
        // No temporary files left behind
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_append_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        for n in 0..5 {
            store.append("history", json!(n), 3).await.unwrap();
        }
        assert_eq!(store.load("history").await.unwrap(), Some(json!([2, 3, 4])));
    }

    #[tokio::test]
    async fn test_names_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save("b", &json!(1)).await.unwrap();
        store.save("a", &json!(2)).await.unwrap();
        assert_eq!(store.names().await.unwrap(), vec!["a".to_string(), "b".to_string()]);

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(store.names().await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_path_names() {
        let store = StateStore::new("/tmp/unused");
        assert_err!(store.load("../etc/passwd").await);
        assert_err!(store.save("a/b", &json!(1)).await);
        assert_err!(store.remove("").await);
    }
}
