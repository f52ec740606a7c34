// SPDX-License-Identifier: MIT
//! Knowledge cache — in-memory, asynchronously refreshed view of the cause
//! store.
//!
//! Readers get the last published snapshot in O(1) and never block on I/O.
//! Exactly one background updater task performs fetches; refresh signals
//! raised while a fetch is in flight coalesce into at most one follow-up
//! fetch (`Notify` stores a single permit — a binary, non-accumulating
//! semaphore), so a burst of writes triggers one refresh, not one per write.
//!
//! A periodic timer provides the freshness floor; write paths call
//! [`KnowledgeCache::invalidate`] right after committing. A fetch error
//! leaves the previous snapshot in effect: stale-but-available beats
//! unavailable.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::KnowledgeStore;
use crate::causes::Cause;

/// Default freshness floor between store fetches.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// The materialized view published by the updater. Replaced atomically as a
/// whole; readers never observe a partially updated set.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    /// All causes, ordered by name.
    pub causes: Vec<Cause>,
    /// Deduplicated, sorted category labels.
    pub categories: Vec<String>,
    /// When this snapshot was fetched; `None` for the initial empty snapshot.
    pub refreshed_at: Option<DateTime<Utc>>,
}

struct CacheShared {
    store: Arc<dyn KnowledgeStore>,
    snapshot: RwLock<Arc<CacheSnapshot>>,
    refresh: Notify,
    refresh_interval: Duration,
}

impl CacheShared {
    /// Fetch the full cause set and categories, then atomically publish.
    async fn refresh_once(&self) {
        let mut causes = match self.store.list().await {
            Ok(causes) => causes,
            Err(e) => {
                warn!(error = %e, "cause fetch failed — keeping previous snapshot");
                return;
            }
        };
        let categories = match self.store.distinct_categories().await {
            Ok(categories) => categories,
            Err(e) => {
                warn!(error = %e, "category fetch failed — keeping previous snapshot");
                return;
            }
        };
        causes.sort_by(|a, b| a.name.cmp(&b.name));
        let next = Arc::new(CacheSnapshot {
            causes,
            categories,
            refreshed_at: Some(Utc::now()),
        });
        debug!(
            causes = next.causes.len(),
            categories = next.categories.len(),
            "published new knowledge snapshot"
        );
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// Read-through cache over any [`KnowledgeStore`].
///
/// Lifecycle: stopped → [`start`](Self::start) → running →
/// [`stop`](Self::stop) → stopped. Reads work in any state and return the
/// last published snapshot (empty before the first refresh — `start` does
/// not fetch eagerly; the first signal or timer tick does).
pub struct KnowledgeCache {
    shared: Arc<CacheShared>,
    updater: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl KnowledgeCache {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self::with_refresh_interval(store, DEFAULT_REFRESH_INTERVAL)
    }

    /// Interval is a policy constant; tests shrink it to milliseconds.
    pub fn with_refresh_interval(store: Arc<dyn KnowledgeStore>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                store,
                snapshot: RwLock::new(Arc::new(CacheSnapshot::default())),
                refresh: Notify::new(),
                refresh_interval: interval,
            }),
            updater: Mutex::new(None),
        }
    }

    /// Start the background updater. Idempotent — a second call while
    /// running is a no-op.
    pub async fn start(&self) {
        let mut updater = self.updater.lock().await;
        if updater.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.refresh.notified() => {}
                    _ = tokio::time::sleep(shared.refresh_interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
                shared.refresh_once().await;
            }
            debug!("knowledge cache updater stopped");
        });
        *updater = Some((shutdown_tx, handle));
        info!("knowledge cache updater started");
    }

    /// Stop the updater and join it. No background work remains after this
    /// returns. Idempotent.
    pub async fn stop(&self) {
        let Some((shutdown_tx, handle)) = self.updater.lock().await.take() else {
            return;
        };
        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "knowledge cache updater did not shut down cleanly");
        }
    }

    /// Request a refresh. Any number of calls while a fetch is in flight
    /// collapse into at most one follow-up fetch.
    pub fn invalidate(&self) {
        self.shared.refresh.notify_one();
    }

    /// The last published snapshot. O(1), never blocks on I/O; repeated
    /// calls between refreshes return the identical snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current causes, ordered by name.
    pub fn causes(&self) -> Vec<Cause> {
        self.snapshot().causes.clone()
    }

    /// Current distinct categories.
    pub fn categories(&self) -> Vec<String> {
        self.snapshot().categories.clone()
    }
}

/// The cache is also a store decorator: reads serve from the snapshot,
/// writes delegate to the inner store and then invalidate.
#[async_trait]
impl KnowledgeStore for KnowledgeCache {
    async fn list(&self) -> Result<Vec<Cause>> {
        Ok(self.causes())
    }

    async fn add(&self, cause: Cause) -> Result<Cause> {
        let added = self.shared.store.add(cause).await?;
        self.invalidate();
        Ok(added)
    }

    async fn save(&self, cause: Cause) -> Result<()> {
        self.shared.store.save(cause).await?;
        self.invalidate();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Cause> {
        let removed = self.shared.store.remove(id).await?;
        self.invalidate();
        Ok(removed)
    }

    async fn distinct_categories(&self) -> Result<Vec<String>> {
        Ok(self.categories())
    }
}

impl Drop for KnowledgeCache {
    fn drop(&mut self) {
        // Abort rather than leak if the owner forgot to stop().
        if let Ok(updater) = self.updater.try_lock() {
            if let Some((_, handle)) = updater.as_ref() {
                handle.abort();
            }
        }
    }
}
