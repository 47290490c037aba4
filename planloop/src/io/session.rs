//! Persistence of binding contexts between runs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::debug;

use crate::core::bindings::BindingContext;

/// Saves and restores the variables of a session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session_id: &str, bindings: &BindingContext) -> Result<()>;

    /// `Ok(None)` when nothing was saved under `session_id`.
    async fn load(&self, session_id: &str) -> Result<Option<BindingContext>>;
}

/// Session ids become file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid session id {session_id:?}"))
    }
}

/// One pretty-printed JSON file per session under a directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session_id: &str, bindings: &BindingContext) -> Result<()> {
        let path = self.path_for(session_id)?;
        debug!(path = %path.display(), variables = bindings.len(), "writing session");
        let mut buf = serde_json::to_string_pretty(bindings).context("serialize session")?;
        buf.push('\n');
        crate::io::write_atomic(&path, &buf)
    }

    async fn load(&self, session_id: &str) -> Result<Option<BindingContext>> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read session {}", path.display()))?;
        let bindings: BindingContext = serde_json::from_str(&contents)
            .with_context(|| format!("parse session {}", path.display()))?;
        debug!(path = %path.display(), variables = bindings.len(), "session loaded");
        Ok(Some(bindings))
    }
}

/// Process-local store, mostly for tests and short-lived hosts.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, BindingContext>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, session_id: &str, bindings: &BindingContext) -> Result<()> {
        validate_session_id(session_id)?;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), bindings.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<BindingContext>> {
        validate_session_id(session_id)?;
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> BindingContext {
        let mut bindings = BindingContext::new();
        bindings.set("fileList", json!(["a.txt", "b.txt"]));
        bindings.set("summary", "short");
        bindings
    }

    /// Saving then loading restores every variable.
    #[tokio::test]
    async fn file_store_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path().join("sessions"));

        store.save("run-1", &sample()).await.expect("save");
        let loaded = store.load("run-1").await.expect("load");

        assert_eq!(loaded, Some(sample()));
        assert!(temp.path().join("sessions").join("run-1.json").exists());
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path());
        assert_eq!(store.load("absent").await.expect("load"), None);
    }

    /// Ids that could escape the directory are rejected before touching disk.
    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path());
        assert!(store.save("../escape", &sample()).await.is_err());
        assert!(store.load("a/b").await.is_err());
        assert!(InMemorySessionStore::new().save("", &sample()).await.is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = InMemorySessionStore::new();
        store.save("s", &sample()).await.expect("save");
        assert_eq!(store.load("s").await.expect("load"), Some(sample()));
    }
}
