// SPDX-License-Identifier: MIT
//! Knowledge store — the durable backend holding all causes.
//!
//! Backends implement one trait and are selected by configuration; the
//! in-memory cache decorates any of them. The file backend keeps the whole
//! cause set in a single JSON document with write-to-temp + atomic rename,
//! which is plenty for a curated knowledge base (hundreds of causes, not
//! millions).

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::causes::Cause;

/// Read/write contract every cause backend satisfies.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// All causes, in storage order.
    async fn list(&self) -> Result<Vec<Cause>>;

    /// Persist a new cause; the store assigns its id. Names are unique
    /// across the knowledge base, so a duplicate name is rejected.
    async fn add(&self, cause: Cause) -> Result<Cause>;

    /// Replace the stored cause with the same id. Rejects a rename that
    /// collides with another cause's name.
    async fn save(&self, cause: Cause) -> Result<()>;

    /// Remove and return the cause with the given id.
    async fn remove(&self, id: &str) -> Result<Cause>;

    /// Deduplicated, sorted category labels across all causes.
    async fn distinct_categories(&self) -> Result<Vec<String>>;
}

/// Derive the distinct category list from a cause set.
pub(crate) fn categories_of(causes: &[Cause]) -> Vec<String> {
    let mut categories: Vec<String> = causes
        .iter()
        .flat_map(|c| c.categories.iter().cloned())
        .collect();
    categories.sort();
    categories.dedup();
    categories
}

// ─── Local file backend ───────────────────────────────────────────────────────

/// JSON-file backend (`causes.json`). Read-modify-write runs under an
/// internal mutex; writes go to a temp file and are renamed into place so a
/// crash never leaves a half-written knowledge base.
pub struct LocalFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<Cause>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("malformed cause file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                Err(e).with_context(|| format!("reading cause file {}", self.path.display()))
            }
        }
    }

    async fn persist(&self, causes: &[Cause]) -> Result<()> {
        let json = serde_json::to_string_pretty(causes).context("serializing causes")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KnowledgeStore for LocalFileStore {
    async fn list(&self) -> Result<Vec<Cause>> {
        self.load().await
    }

    async fn add(&self, mut cause: Cause) -> Result<Cause> {
        let _guard = self.write_lock.lock().await;
        let mut causes = self.load().await?;
        if cause.id.is_empty() {
            cause.id = Uuid::new_v4().to_string();
        }
        if causes.iter().any(|c| c.id == cause.id) {
            bail!("cause id `{}` already exists", cause.id);
        }
        // Names are the human-facing identity; keep them unique too.
        if causes.iter().any(|c| c.name == cause.name) {
            bail!("cause name `{}` already exists", cause.name);
        }
        causes.push(cause.clone());
        self.persist(&causes).await?;
        Ok(cause)
    }

    async fn save(&self, cause: Cause) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut causes = self.load().await?;
        if causes.iter().any(|c| c.name == cause.name && c.id != cause.id) {
            bail!("cause name `{}` already exists", cause.name);
        }
        let Some(slot) = causes.iter_mut().find(|c| c.id == cause.id) else {
            bail!("no cause with id `{}`", cause.id);
        };
        *slot = cause;
        self.persist(&causes).await
    }

    async fn remove(&self, id: &str) -> Result<Cause> {
        let _guard = self.write_lock.lock().await;
        let mut causes = self.load().await?;
        let Some(pos) = causes.iter().position(|c| c.id == id) else {
            bail!("no cause with id `{id}`");
        };
        let removed = causes.remove(pos);
        self.persist(&causes).await?;
        Ok(removed)
    }

    async fn distinct_categories(&self) -> Result<Vec<String>> {
        Ok(categories_of(&self.load().await?))
    }
}

// ─── In-memory backend ────────────────────────────────────────────────────────

/// In-memory backend, used by tests and the demo path.
#[derive(Default)]
pub struct InMemoryStore {
    causes: tokio::sync::RwLock<Vec<Cause>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_causes(causes: Vec<Cause>) -> Self {
        Self {
            causes: tokio::sync::RwLock::new(causes),
        }
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn list(&self) -> Result<Vec<Cause>> {
        Ok(self.causes.read().await.clone())
    }

    async fn add(&self, mut cause: Cause) -> Result<Cause> {
        let mut causes = self.causes.write().await;
        if cause.id.is_empty() {
            cause.id = Uuid::new_v4().to_string();
        }
        if causes.iter().any(|c| c.id == cause.id) {
            bail!("cause id `{}` already exists", cause.id);
        }
        if causes.iter().any(|c| c.name == cause.name) {
            bail!("cause name `{}` already exists", cause.name);
        }
        causes.push(cause.clone());
        Ok(cause)
    }

    async fn save(&self, cause: Cause) -> Result<()> {
        let mut causes = self.causes.write().await;
        if causes.iter().any(|c| c.name == cause.name && c.id != cause.id) {
            bail!("cause name `{}` already exists", cause.name);
        }
        let Some(slot) = causes.iter_mut().find(|c| c.id == cause.id) else {
            bail!("no cause with id `{}`", cause.id);
        };
        *slot = cause;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Cause> {
        let mut causes = self.causes.write().await;
        let Some(pos) = causes.iter().position(|c| c.id == id) else {
            bail!("no cause with id `{id}`");
        };
        Ok(causes.remove(pos))
    }

    async fn distinct_categories(&self) -> Result<Vec<String>> {
        Ok(categories_of(&self.causes.read().await))
    }
}
