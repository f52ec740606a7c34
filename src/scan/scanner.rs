// SPDX-License-Identifier: MIT
//! Timeout-protected single-rule scanner.
//!
//! Evaluates one indication against one log stream, bounded by a per-line
//! watchdog and a per-stream wall-clock budget. The original design ran a
//! monitor thread that interrupted the matcher; here the watchdog raises a
//! cooperative cancellation flag that the blocking scan loop observes at each
//! line boundary, and the regex engine is linear-time, so a pathological
//! pattern or a huge log can delay a worker by at most one line's worth of
//! work past the budget.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use super::{markup, LogSource, ScanBudget, ScanError};
use crate::causes::{Cause, FoundCause, FoundIndication, Indication, IndicationKind};

// ─── Watchdog plumbing ────────────────────────────────────────────────────────

/// Progress signal shared between the blocking scan loop and its watchdog.
///
/// The loop touches `last_progress` after each line; the watchdog raises
/// `cancel` when no progress has been observed for the per-line bound. The
/// loop consumes the flag at the next line boundary and treats the current
/// position as "not found" rather than failing the whole scan.
struct ScanPulse {
    started: Instant,
    /// Milliseconds since `started` at the last progress point.
    last_progress_ms: AtomicU64,
    cancel: AtomicBool,
}

impl ScanPulse {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            last_progress_ms: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
        })
    }

    fn touch(&self) {
        self.last_progress_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn stalled_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_progress_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn raise_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Consume the cancellation flag, resetting it for the next line.
    fn take_cancelled(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }
}

/// Run blocking scan work with the per-line watchdog attached.
async fn with_watchdog<T>(
    budget: ScanBudget,
    pulse: Arc<ScanPulse>,
    work: impl FnOnce() -> Result<T, ScanError> + Send + 'static,
) -> Result<T, ScanError>
where
    T: Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(work);
    let tick = (budget.line_timeout / 4).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            joined = &mut handle => {
                return joined.map_err(|e| ScanError::Task(e.to_string()))?;
            }
            _ = tokio::time::sleep(tick) => {
                if pulse.stalled_for() > budget.line_timeout {
                    debug!("per-line watchdog fired — cancelling current matching step");
                    pulse.raise_cancel();
                }
            }
        }
    }
}

// ─── Single-rule scan ─────────────────────────────────────────────────────────

/// Scan one rule against one stream. Returns at most one match.
///
/// Opens a fresh stream handle and closes it before returning. A timeout is
/// a normal no-match outcome, never an error.
pub async fn scan_rule(
    source: &dyn LogSource,
    indication: &Indication,
    budget: ScanBudget,
    multiline_window: usize,
    build_id: &str,
) -> Result<Option<FoundIndication>, ScanError> {
    let regex = indication.compile()?;
    let reader = source.open().map_err(ScanError::StreamUnavailable)?;

    let pulse = ScanPulse::new();
    let loop_pulse = pulse.clone();
    let deadline = Instant::now() + budget.stream_timeout;
    let kind = indication.kind;

    let matched = with_watchdog(budget, pulse, move || match kind {
        IndicationKind::SingleLine => scan_single_line(reader, &regex, deadline, &loop_pulse),
        IndicationKind::MultiLine => {
            scan_multi_line(reader, &regex, multiline_window, deadline, &loop_pulse)
        }
    })
    .await?;

    Ok(matched.map(|text| FoundIndication::new(build_id, &indication.pattern, source.id(), text)))
}

/// Blocking pass for a single-line rule: test each stripped line against the
/// framed regex, stop at the first match.
fn scan_single_line(
    mut reader: Box<dyn BufRead + Send>,
    regex: &Regex,
    deadline: Instant,
    pulse: &ScanPulse,
) -> Result<Option<String>, ScanError> {
    let mut line = String::new();
    loop {
        if Instant::now() >= deadline {
            debug!("stream budget exhausted — giving up on rule");
            return Ok(None);
        }
        line.clear();
        if reader.read_line(&mut line).map_err(ScanError::Read)? == 0 {
            return Ok(None);
        }
        pulse.touch();
        if pulse.take_cancelled() {
            // Watchdog fired while this line was being read or matched —
            // treat it as not-found and advance.
            continue;
        }
        let clean = markup::strip(line.trim_end_matches(['\r', '\n']));
        if let Some(m) = regex.find(&clean) {
            return Ok(Some(m.as_str().to_string()));
        }
        pulse.touch();
    }
}

/// Blocking pass for a multi-line rule: keep a sliding window of consecutive
/// stripped lines and test the framed regex against the joined window. On
/// failure the window advances one line, restarting the search from the next
/// unconsumed position.
fn scan_multi_line(
    mut reader: Box<dyn BufRead + Send>,
    regex: &Regex,
    window: usize,
    deadline: Instant,
    pulse: &ScanPulse,
) -> Result<Option<String>, ScanError> {
    let window = window.max(2);
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(window);
    let mut line = String::new();
    loop {
        if Instant::now() >= deadline {
            debug!("stream budget exhausted — giving up on rule");
            return Ok(None);
        }
        line.clear();
        if reader.read_line(&mut line).map_err(ScanError::Read)? == 0 {
            return Ok(None);
        }
        pulse.touch();
        if pulse.take_cancelled() {
            continue;
        }
        if buffer.len() == window {
            buffer.pop_front();
        }
        buffer.push_back(
            markup::strip(line.trim_end_matches(['\r', '\n'])).into_owned(),
        );
        let text = buffer.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        if let Some(m) = regex.find(&text) {
            return Ok(Some(m.as_str().to_string()));
        }
        pulse.touch();
    }
}

// ─── Combined single-line pass ────────────────────────────────────────────────

/// Scan all single-line-only causes in one pass over one stream handle,
/// amortizing the stream read across every rule.
///
/// Enforces at most one match per (cause, rule) per stream; the stream budget
/// applies to the pass as a whole, so every rule in it is bounded by the same
/// constant.
pub async fn scan_single_line_group(
    source: &dyn LogSource,
    causes: Vec<Cause>,
    budget: ScanBudget,
    build_id: &str,
) -> Result<Vec<FoundCause>, ScanError> {
    struct Slot {
        cause_idx: usize,
        rule_idx: usize,
        regex: Regex,
        matched: Option<String>,
    }

    let mut slots = Vec::new();
    for (cause_idx, cause) in causes.iter().enumerate() {
        for (rule_idx, indication) in cause.indications.iter().enumerate() {
            match indication.compile() {
                Ok(regex) => slots.push(Slot {
                    cause_idx,
                    rule_idx,
                    regex,
                    matched: None,
                }),
                // Causes are validated before dispatch; tolerate anyway so one
                // stale rule cannot take the combined pass down.
                Err(e) => warn!(
                    build_id,
                    cause = %cause.name,
                    rule_idx,
                    error = %e,
                    "skipping rule that does not compile"
                ),
            }
        }
    }

    let reader = source.open().map_err(ScanError::StreamUnavailable)?;
    let pulse = ScanPulse::new();
    let loop_pulse = pulse.clone();
    let deadline = Instant::now() + budget.stream_timeout;

    let slots = with_watchdog(budget, pulse, move || {
        let mut reader = reader;
        let mut slots = slots;
        let mut line = String::new();
        loop {
            if Instant::now() >= deadline {
                debug!("stream budget exhausted — ending combined single-line pass");
                break;
            }
            if slots.iter().all(|s| s.matched.is_some()) {
                break;
            }
            line.clear();
            if reader.read_line(&mut line).map_err(ScanError::Read)? == 0 {
                break;
            }
            loop_pulse.touch();
            if loop_pulse.take_cancelled() {
                continue;
            }
            let clean = markup::strip(line.trim_end_matches(['\r', '\n']));
            for slot in slots.iter_mut().filter(|s| s.matched.is_none()) {
                if let Some(m) = slot.regex.find(&clean) {
                    slot.matched = Some(m.as_str().to_string());
                }
            }
            loop_pulse.touch();
        }
        Ok(slots)
    })
    .await?;

    // Assemble one FoundCause per cause with at least one match, preserving
    // the cause's rule evaluation order.
    let mut found = Vec::new();
    for (cause_idx, cause) in causes.iter().enumerate() {
        let mut matches: Vec<&Slot> = slots
            .iter()
            .filter(|s| s.cause_idx == cause_idx && s.matched.is_some())
            .collect();
        if matches.is_empty() {
            continue;
        }
        matches.sort_by_key(|s| s.rule_idx);
        let indications = matches
            .into_iter()
            .map(|slot| {
                FoundIndication::new(
                    build_id,
                    &cause.indications[slot.rule_idx].pattern,
                    source.id(),
                    slot.matched.clone().unwrap_or_default(),
                )
            })
            .collect();
        found.push(FoundCause::new(cause, indications));
    }
    Ok(found)
}
