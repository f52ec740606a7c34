// SPDX-License-Identifier: MIT
//! logtriage — classifies why an automated build failed by matching curated
//! regex rules ("causes") against the build's console log.
//!
//! The core pieces:
//! - [`causes`] — the cause model and scan-result value objects;
//! - [`scan`] — the timeout-protected scanner and the orchestrator that fans
//!   scan tasks out to a bounded worker pool;
//! - [`knowledge`] — the cause store contract, its backends, and the
//!   coalescing read-through cache.

pub mod causes;
pub mod config;
pub mod knowledge;
pub mod scan;

use std::sync::Arc;

use config::TriageConfig;
use knowledge::{KnowledgeCache, KnowledgeStore, LocalFileStore};
use scan::orchestrator::ScanOrchestrator;

/// Shared application state wired up once at startup and passed to every
/// consumer of the core.
pub struct AppContext {
    pub config: TriageConfig,
    pub cache: Arc<KnowledgeCache>,
    pub orchestrator: Arc<ScanOrchestrator>,
}

impl AppContext {
    /// Wire the configured store, the cache over it, and the orchestrator.
    /// The cache updater is not started; callers do that and own `stop()`.
    pub fn new(config: TriageConfig) -> Self {
        let store: Arc<dyn KnowledgeStore> = Arc::new(LocalFileStore::new(config.cause_file()));
        let cache = Arc::new(KnowledgeCache::with_refresh_interval(
            store,
            config.refresh_interval(),
        ));
        let orchestrator = Arc::new(ScanOrchestrator::new(config.scan_settings()));
        Self {
            config,
            cache,
            orchestrator,
        }
    }
}
