//! Layered configuration: CLI / env > `config.toml` > built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

use crate::scan::{ScanBudget, ScanSettings};

const DEFAULT_THREADS: usize = 4;
const DEFAULT_LINE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_STREAM_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MULTILINE_WINDOW: usize = 10;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
const DEFAULT_CAUSE_FILE: &str = "causes.json";

// ─── ScanConfig ───────────────────────────────────────────────────────────────

/// Scan engine tuning (`[scan]` in config.toml).
///
/// Re-read by the orchestrator on every scan, so edits apply to the next
/// build without a restart.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Worker pool size. Default: 4.
    pub threads: usize,
    /// Per-line watchdog bound in milliseconds. Default: 1000.
    pub line_timeout_ms: u64,
    /// Per-rule-per-stream wall-clock budget in milliseconds. Default: 10000.
    pub stream_timeout_ms: u64,
    /// Maximum lines a multi-line rule may span. Default: 10.
    pub multiline_window: usize,
    /// Categories demoted whenever a more specific cause also matched.
    pub fallback_categories: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            line_timeout_ms: DEFAULT_LINE_TIMEOUT_MS,
            stream_timeout_ms: DEFAULT_STREAM_TIMEOUT_MS,
            multiline_window: DEFAULT_MULTILINE_WINDOW,
            fallback_categories: Vec::new(),
        }
    }
}

// ─── CacheConfig ──────────────────────────────────────────────────────────────

/// Knowledge cache tuning (`[cache]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness floor between background fetches, in seconds. Default: 60.
    pub refresh_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

// ─── KnowledgeConfig ──────────────────────────────────────────────────────────

/// Knowledge store selection (`[knowledge]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Cause file for the local file backend, relative to the config dir
    /// unless absolute. Default: "causes.json".
    pub path: PathBuf,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CAUSE_FILE),
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{config_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,logtriage=trace".
    log: Option<String>,
    scan: Option<ScanConfig>,
    cache: Option<CacheConfig>,
    knowledge: Option<KnowledgeConfig>,
}

fn load_toml(config_dir: &Path) -> Option<TomlConfig> {
    let path = config_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── TriageConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub config_dir: PathBuf,
    pub log: String,
    pub scan: ScanConfig,
    pub cache: CacheConfig,
    pub knowledge: KnowledgeConfig,
}

impl TriageConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{config_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(config_dir: Option<PathBuf>, log: Option<String>, threads: Option<usize>) -> Self {
        let config_dir = config_dir.unwrap_or_else(default_config_dir);
        let toml = load_toml(&config_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let mut scan = toml.scan.unwrap_or_default();
        if let Some(threads) = threads {
            scan.threads = threads;
        }
        let cache = toml.cache.unwrap_or_default();
        let knowledge = toml.knowledge.unwrap_or_default();

        Self {
            config_dir,
            log,
            scan,
            cache,
            knowledge,
        }
    }

    /// Orchestrator settings derived from the `[scan]` section.
    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            threads: self.scan.threads.max(1),
            budget: ScanBudget {
                line_timeout: Duration::from_millis(self.scan.line_timeout_ms),
                stream_timeout: Duration::from_millis(self.scan.stream_timeout_ms),
            },
            multiline_window: self.scan.multiline_window.max(2),
            fallback_categories: self.scan.fallback_categories.clone(),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache.refresh_interval_secs.max(1))
    }

    /// Absolute path of the cause file for the local file backend.
    pub fn cause_file(&self) -> PathBuf {
        if self.knowledge.path.is_absolute() {
            self.knowledge.path.clone()
        } else {
            self.config_dir.join(&self.knowledge.path)
        }
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("logtriage");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("logtriage");
    }
    PathBuf::from(".logtriage")
}
