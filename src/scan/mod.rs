// SPDX-License-Identifier: MIT
//! Concurrent pattern scanning of build console logs.
//!
//! `orchestrator` partitions a cause set and fans scan tasks out to a bounded
//! worker pool; `scanner` evaluates one rule against one stream under strict
//! timeout bounds; `markup` strips console escape sequences from matched text.

pub mod markup;
pub mod orchestrator;
pub mod scanner;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-line watchdog bound.
const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default wall-clock budget for one rule against one stream.
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Scan budget ──────────────────────────────────────────────────────────────

/// Timeout policy for scanning one rule against one stream.
///
/// Both bounds are policy constants, independent of the matching logic, and
/// independently overridable (tests use millisecond budgets).
#[derive(Debug, Clone, Copy)]
pub struct ScanBudget {
    /// If the scan loop makes no line progress for this long, the watchdog
    /// cancels the current matching step; the rule is treated as "not found
    /// this line" and the scan advances.
    pub line_timeout: Duration,
    /// Wall-clock budget for the entire rule-vs-stream scan; once exceeded
    /// the scanner gives up on the rule and returns no match.
    pub stream_timeout: Duration,
}

impl Default for ScanBudget {
    fn default() -> Self {
        Self {
            line_timeout: DEFAULT_LINE_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

// ─── Scan settings ────────────────────────────────────────────────────────────

/// Per-scan orchestration settings, re-read on every scan so configuration
/// changes apply without restarting.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Worker pool size (permits). Clamped to at least 1.
    pub threads: usize,
    pub budget: ScanBudget,
    /// Maximum number of consecutive lines a multi-line rule may span.
    pub multiline_window: usize,
    /// Categories treated as generic catch-alls: causes carrying one are
    /// dropped from the result whenever a more specific cause also matched.
    pub fallback_categories: Vec<String>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            threads: 4,
            budget: ScanBudget::default(),
            multiline_window: 10,
            fallback_categories: Vec::new(),
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Failure of one scan task. Absorbed and logged by the orchestrator; never
/// propagated to external callers.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("log stream could not be opened: {0}")]
    StreamUnavailable(#[source] io::Error),
    #[error("read error while scanning: {0}")]
    Read(#[source] io::Error),
    #[error("indication pattern does not compile: {0}")]
    BadPattern(#[from] regex::Error),
    #[error("scan task failed: {0}")]
    Task(String),
}

// ─── Log sources ──────────────────────────────────────────────────────────────

/// A sequential, forward-only, line-oriented source of console output.
///
/// Each scan task opens its own fresh handle — scanning is stateful and
/// position-dependent, so handles are never shared. The handle is closed on
/// drop.
pub trait LogSource: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn BufRead + Send>>;

    /// Stream identifier recorded in `FoundIndication::source`, e.g. "log".
    fn id(&self) -> &str;
}

/// A build log on disk.
pub struct FileLogSource {
    path: PathBuf,
}

impl FileLogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LogSource for FileLogSource {
    fn open(&self) -> io::Result<Box<dyn BufRead + Send>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }

    fn id(&self) -> &str {
        "log"
    }
}

/// An in-memory log, used by tests and the demo path.
pub struct MemoryLogSource {
    content: String,
    id: String,
}

impl MemoryLogSource {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            id: "log".to_string(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl LogSource for MemoryLogSource {
    fn open(&self) -> io::Result<Box<dyn BufRead + Send>> {
        Ok(Box::new(Cursor::new(self.content.clone().into_bytes())))
    }

    fn id(&self) -> &str {
        &self.id
    }
}
