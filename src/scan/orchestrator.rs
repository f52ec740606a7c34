// SPDX-License-Identifier: MIT
//! Scan orchestrator — partitions a cause set, fans scan tasks out to a
//! bounded worker pool, and aggregates matches into one `ScanOutcome`.
//!
//! Causes whose rules are all single-line are evaluated together in one pass
//! over the stream (amortizing the read); each cause with a multi-line rule
//! gets its own task, because window matching is stateful per rule. Every
//! task opens its own fresh stream handle.
//!
//! Nothing here propagates errors to the caller: task failures are logged
//! with build context and contribute no result, and cancelling the returned
//! future (e.g. on shutdown) aborts all outstanding tasks via `JoinSet`.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{scanner, LogSource, ScanError, ScanSettings};
use crate::causes::{Cause, FoundCause, ScanOutcome};

pub struct ScanOrchestrator {
    /// Re-read at the start of every scan so configuration changes (pool
    /// size, timeouts, fallback categories) apply without a restart.
    settings: RwLock<ScanSettings>,
    /// Worker pool shared across scans, so concurrent scans on one
    /// orchestrator are jointly bounded. Resized to the configured thread
    /// count before each scan.
    pool: Arc<Semaphore>,
    /// Logical permit count the pool currently holds (issued minus
    /// forgotten), tracked so resizes know the delta to apply.
    pool_size: Mutex<usize>,
}

impl ScanOrchestrator {
    pub fn new(settings: ScanSettings) -> Self {
        let size = settings.threads.max(1);
        Self {
            settings: RwLock::new(settings),
            pool: Arc::new(Semaphore::new(size)),
            pool_size: Mutex::new(size),
        }
    }

    pub fn update_settings(&self, settings: ScanSettings) {
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bring the shared pool to `target` permits. Only idle permits can be
    /// forgotten when shrinking; permits held by in-flight tasks are trimmed
    /// by a later resize once they come back.
    fn resize_pool(&self, target: usize) {
        let target = target.max(1);
        let mut size = self
            .pool_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if target > *size {
            self.pool.add_permits(target - *size);
            *size = target;
        } else if target < *size {
            *size -= self.pool.forget_permits(*size - target);
        }
    }

    /// Scan one build's log against the full cause set.
    ///
    /// Always returns a `ScanOutcome` record — "no cause found" and "log
    /// unavailable" are recorded outcomes, never errors.
    pub async fn scan(
        &self,
        causes: &[Cause],
        source: Arc<dyn LogSource>,
        build_id: &str,
    ) -> ScanOutcome {
        let settings = self.settings();

        // Probe the stream once up front: if the log cannot be opened at all,
        // record the diagnostic and skip dispatch entirely.
        if let Err(e) = source.open() {
            warn!(build_id, error = %e, "log stream unavailable — recording empty outcome");
            return ScanOutcome::failed(build_id, format!("log stream unavailable: {e}"));
        }

        let mut single_line = Vec::new();
        let mut multi_line = Vec::new();
        for cause in causes {
            if let Err(e) = cause.validate() {
                warn!(build_id, cause = %cause.name, error = %e, "skipping invalid cause");
                continue;
            }
            if cause.is_single_line_only() {
                single_line.push(cause.clone());
            } else {
                multi_line.push(cause.clone());
            }
        }

        self.resize_pool(settings.threads);
        let pool = self.pool.clone();
        let mut tasks: JoinSet<Result<Vec<FoundCause>, ScanError>> = JoinSet::new();

        if !single_line.is_empty() {
            let pool = pool.clone();
            let source = source.clone();
            let build_id = build_id.to_string();
            let budget = settings.budget;
            tasks.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| ScanError::Task(e.to_string()))?;
                scanner::scan_single_line_group(&*source, single_line, budget, &build_id).await
            });
        }

        for cause in multi_line {
            let pool = pool.clone();
            let source = source.clone();
            let build_id = build_id.to_string();
            let budget = settings.budget;
            let window = settings.multiline_window;
            tasks.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| ScanError::Task(e.to_string()))?;
                let mut matches = Vec::new();
                // Rules are evaluated in order, each against a fresh stream
                // handle, at most one match per rule per stream.
                for indication in &cause.indications {
                    if let Some(found) =
                        scanner::scan_rule(&*source, indication, budget, window, &build_id).await?
                    {
                        matches.push(found);
                    }
                }
                Ok(if matches.is_empty() {
                    Vec::new()
                } else {
                    vec![FoundCause::new(&cause, matches)]
                })
            });
        }

        let mut found = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(mut task_found)) => found.append(&mut task_found),
                Ok(Err(e)) => warn!(build_id, error = %e, "scan task failed — partial result"),
                Err(e) => warn!(build_id, error = %e, "scan task panicked or was aborted"),
            }
        }

        let found = apply_fallback_filter(found, &settings.fallback_categories);
        debug!(build_id, causes = found.len(), "scan complete");
        ScanOutcome::new(build_id, found)
    }
}

/// Demote generic catch-all causes: when at least one non-fallback cause
/// matched, causes in a fallback category are dropped; when every match is
/// fallback, all of them are kept so something still surfaces.
fn apply_fallback_filter(found: Vec<FoundCause>, fallback: &[String]) -> Vec<FoundCause> {
    if fallback.is_empty() {
        return found;
    }
    let any_specific = found.iter().any(|fc| !fc.is_fallback(fallback));
    if any_specific {
        found
            .into_iter()
            .filter(|fc| !fc.is_fallback(fallback))
            .collect()
    } else {
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causes::Indication;
    use crate::scan::MemoryLogSource;

    fn found(name: &str, categories: &[&str]) -> FoundCause {
        let mut cause = Cause::new(name, "d");
        for c in categories {
            cause = cause.with_category(*c);
        }
        FoundCause::new(&cause, Vec::new())
    }

    fn fallback() -> Vec<String> {
        vec!["generic".to_string()]
    }

    #[test]
    fn fallback_dropped_when_specific_match_exists() {
        let result = apply_fallback_filter(
            vec![found("catchall", &["generic"]), found("oom", &["memory"])],
            &fallback(),
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "oom");
    }

    #[test]
    fn fallback_kept_when_nothing_specific_matched() {
        let result = apply_fallback_filter(vec![found("catchall", &["generic"])], &fallback());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "catchall");
    }

    #[test]
    fn no_fallback_categories_keeps_everything() {
        let result = apply_fallback_filter(
            vec![found("a", &["generic"]), found("b", &[])],
            &[],
        );
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn pool_grows_and_shrinks_with_configured_threads() {
        let mut settings = ScanSettings::default();
        settings.threads = 2;
        let orchestrator = ScanOrchestrator::new(settings);
        assert_eq!(orchestrator.pool.available_permits(), 2);

        orchestrator.resize_pool(5);
        assert_eq!(orchestrator.pool.available_permits(), 5);

        orchestrator.resize_pool(1);
        assert_eq!(orchestrator.pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn pool_shrink_defers_permits_held_by_running_tasks() {
        let mut settings = ScanSettings::default();
        settings.threads = 2;
        let orchestrator = ScanOrchestrator::new(settings);

        let held = orchestrator.pool.clone().try_acquire_owned().unwrap();
        orchestrator.resize_pool(1);
        // Only the idle permit could be forgotten; the held one stays out.
        assert_eq!(orchestrator.pool.available_permits(), 0);

        drop(held);
        assert_eq!(orchestrator.pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn invalid_causes_are_skipped_not_fatal() {
        let orchestrator = ScanOrchestrator::new(ScanSettings::default());
        let causes = vec![
            Cause::new("", "no name").with_indication(Indication::single_line("ERROR")),
            Cause::new("ok", "d").with_indication(Indication::single_line("ERROR: .*")),
        ];
        let source = Arc::new(MemoryLogSource::new("ERROR: boom\n"));
        let outcome = orchestrator.scan(&causes, source, "11").await;
        assert_eq!(outcome.found_causes.len(), 1);
        assert_eq!(outcome.found_causes[0].name, "ok");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn settings_update_applies_to_next_scan() {
        let orchestrator = ScanOrchestrator::new(ScanSettings::default());
        let mut settings = orchestrator.settings();
        settings.threads = 1;
        settings.fallback_categories = vec!["generic".to_string()];
        orchestrator.update_settings(settings);
        assert_eq!(orchestrator.settings().threads, 1);

        let causes = vec![
            Cause::new("catchall", "d")
                .with_category("generic")
                .with_indication(Indication::single_line("ERROR: .*")),
            Cause::new("oom", "d")
                .with_category("memory")
                .with_indication(Indication::single_line("OutOfMemoryError")),
        ];
        let source = Arc::new(MemoryLogSource::new("ERROR: OutOfMemoryError\n"));
        let outcome = orchestrator.scan(&causes, source, "12").await;
        assert_eq!(outcome.found_causes.len(), 1);
        assert_eq!(outcome.found_causes[0].name, "oom");
    }
}
