// SPDX-License-Identifier: MIT
//! Cause model — the value objects the scanner and knowledge layers share.
//!
//! A `Cause` names one known class of build failure and carries the ordered
//! pattern rules ("indications") that identify it in a console log. Scan
//! results are snapshots: `FoundCause` / `FoundIndication` are created once
//! per scan and immutable afterward.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hard cap on compiled pattern size. A curated rule should never get close;
/// this guards against a pasted blob blowing up the compiler.
const MAX_PATTERN_SIZE: usize = 1 << 20;

// ─── Validation ───────────────────────────────────────────────────────────────

/// Why a cause is not usable for scanning.
///
/// The in-memory model tolerates transient invalid states while a cause is
/// being edited; validation is enforced at the scan and store boundaries.
#[derive(Debug, thiserror::Error)]
pub enum CauseValidationError {
    #[error("cause name must not be empty")]
    EmptyName,
    #[error("cause `{0}` has an empty description")]
    EmptyDescription(String),
    #[error("cause `{0}` has no indications")]
    NoIndications(String),
    #[error("cause `{name}` indication {index} does not compile: {source}")]
    BadPattern {
        name: String,
        index: usize,
        source: regex::Error,
    },
}

// ─── Indication ───────────────────────────────────────────────────────────────

/// How an indication's pattern is applied to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicationKind {
    /// Pattern must match within a single line.
    SingleLine,
    /// Pattern may span a bounded window of consecutive lines.
    MultiLine,
}

/// One pattern rule owned by a cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indication {
    /// The raw pattern as entered by the rule author, without framing.
    pub pattern: String,
    pub kind: IndicationKind,
}

impl Indication {
    pub fn single_line(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            kind: IndicationKind::SingleLine,
        }
    }

    pub fn multi_line(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            kind: IndicationKind::MultiLine,
        }
    }

    /// Compile the framed regex used for scanning.
    ///
    /// Single-line rules are framed as `^\s*(?:<pattern>).*$` in multi-line
    /// anchor mode, so the rule need not match from the start of the line and
    /// the match extends to the line end. Multi-line rules are framed as
    /// `^\s*(?:<pattern>)` with dot-matches-newline, so anchors inside the
    /// pattern express the span and the match ends where the pattern ends.
    pub fn compile(&self) -> Result<Regex, regex::Error> {
        match self.kind {
            IndicationKind::SingleLine => {
                RegexBuilder::new(&format!(r"^\s*(?:{}).*$", self.pattern))
                    .multi_line(true)
                    .size_limit(MAX_PATTERN_SIZE)
                    .build()
            }
            IndicationKind::MultiLine => RegexBuilder::new(&format!(r"^\s*(?:{})", self.pattern))
                .multi_line(true)
                .dot_matches_new_line(true)
                .size_limit(MAX_PATTERN_SIZE)
                .build(),
        }
    }
}

// ─── Cause ────────────────────────────────────────────────────────────────────

/// One entry in a cause's modification history, most-recent first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Who made the change (user id or "system").
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// A named, described rule-set identifying one known class of build failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cause {
    /// Opaque id, stable across storage backends. Empty until the store
    /// assigns one on `add`.
    #[serde(default)]
    pub id: String,
    /// Unique, human-chosen name.
    pub name: String,
    /// Description template; `${N}` placeholders reference capture group N of
    /// the first rule match.
    pub description: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Ordered pattern rules. Match order inside a `FoundCause` follows this.
    #[serde(default)]
    pub indications: Vec<Indication>,
    /// Modification history, most-recent first.
    #[serde(default)]
    pub modifications: Vec<Modification>,
}

impl Cause {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: description.into(),
            comment: String::new(),
            categories: Vec::new(),
            indications: Vec::new(),
            modifications: Vec::new(),
        }
    }

    pub fn with_indication(mut self, indication: Indication) -> Self {
        self.indications.push(indication);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    /// Record a modification by `actor` now, keeping most-recent first.
    pub fn touch(&mut self, actor: impl Into<String>) {
        self.modifications.insert(
            0,
            Modification {
                actor: actor.into(),
                at: Utc::now(),
            },
        );
    }

    /// When this cause was last modified, derived lazily from history.
    pub fn last_occurred(&self) -> Option<DateTime<Utc>> {
        self.modifications.first().map(|m| m.at)
    }

    /// Whether every indication is single-line. Drives scan partitioning.
    pub fn is_single_line_only(&self) -> bool {
        self.indications
            .iter()
            .all(|i| i.kind == IndicationKind::SingleLine)
    }

    /// Check the cause is usable for scanning: non-empty name and
    /// description, at least one indication, and all patterns compile.
    pub fn validate(&self) -> Result<(), CauseValidationError> {
        if self.name.trim().is_empty() {
            return Err(CauseValidationError::EmptyName);
        }
        if self.description.trim().is_empty() {
            return Err(CauseValidationError::EmptyDescription(self.name.clone()));
        }
        if self.indications.is_empty() {
            return Err(CauseValidationError::NoIndications(self.name.clone()));
        }
        for (index, indication) in self.indications.iter().enumerate() {
            if let Err(source) = indication.compile() {
                return Err(CauseValidationError::BadPattern {
                    name: self.name.clone(),
                    index,
                    source,
                });
            }
        }
        Ok(())
    }
}

// ─── Scan results ─────────────────────────────────────────────────────────────

/// Evidence that one indication matched one build's log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundIndication {
    /// The build this match belongs to.
    pub build_id: String,
    /// The exact raw pattern that was used.
    pub pattern: String,
    /// Identifier of the scanned stream, e.g. "log".
    pub source: String,
    /// Matched text with console markup stripped.
    pub matched_text: String,
    /// SHA-256 hex of `matched_text` — deterministic cross-reference key for
    /// UI anchoring.
    pub matched_hash: String,
}

impl FoundIndication {
    pub fn new(
        build_id: impl Into<String>,
        pattern: impl Into<String>,
        source: impl Into<String>,
        matched_text: impl Into<String>,
    ) -> Self {
        let matched_text = matched_text.into();
        let matched_hash = content_hash(&matched_text);
        Self {
            build_id: build_id.into(),
            pattern: pattern.into(),
            source: source.into(),
            matched_text,
            matched_hash,
        }
    }
}

/// A cause that matched, snapshotted at scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundCause {
    pub id: String,
    pub name: String,
    pub categories: Vec<String>,
    /// The cause description with `${N}` placeholders resolved against the
    /// first match's capture groups.
    pub description: String,
    /// Matches in the rule evaluation order of the cause's indication list.
    pub indications: Vec<FoundIndication>,
}

impl FoundCause {
    /// Snapshot `cause` with the given matches (already in rule order).
    ///
    /// The description is resolved against the first match: the indication
    /// that produced it is re-run over the matched text to recover capture
    /// groups.
    pub fn new(cause: &Cause, matches: Vec<FoundIndication>) -> Self {
        let description = resolve_description(cause, matches.first());
        Self {
            id: cause.id.clone(),
            name: cause.name.clone(),
            categories: cause.categories.clone(),
            description,
            indications: matches,
        }
    }

    /// True when at least one of this cause's categories is in `fallback`.
    pub fn is_fallback(&self, fallback: &[String]) -> bool {
        self.categories.iter().any(|c| fallback.contains(c))
    }
}

/// The recorded outcome of scanning one build. Produced even when nothing
/// matched, so "no cause found" is a distinguishable result rather than an
/// absence of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub build_id: String,
    pub found_causes: Vec<FoundCause>,
    /// Diagnostic for the consumer when the scan itself degraded (e.g. the
    /// log could not be opened). Never set for ordinary no-match results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanOutcome {
    pub fn new(build_id: impl Into<String>, found_causes: Vec<FoundCause>) -> Self {
        Self {
            build_id: build_id.into(),
            found_causes,
            error: None,
            scanned_at: Utc::now(),
        }
    }

    pub fn failed(build_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            found_causes: Vec::new(),
            error: Some(error.into()),
            scanned_at: Utc::now(),
        }
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// SHA-256 hex digest of matched text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{(\d+)\}").unwrap());

/// Resolve `${N}` placeholders in the cause description against the capture
/// groups of the first match. Unresolvable placeholders are left verbatim.
fn resolve_description(cause: &Cause, first: Option<&FoundIndication>) -> String {
    let Some(found) = first else {
        return cause.description.clone();
    };
    if !PLACEHOLDER.is_match(&cause.description) {
        return cause.description.clone();
    }
    // Recover groups by re-running the producing indication on the match text.
    let compiled = cause
        .indications
        .iter()
        .find(|i| i.pattern == found.pattern)
        .and_then(|i| i.compile().ok());
    let groups = compiled
        .as_ref()
        .and_then(|re| re.captures(&found.matched_text));

    PLACEHOLDER
        .replace_all(&cause.description, |caps: &regex::Captures<'_>| {
            let n: usize = caps[1].parse().unwrap_or(usize::MAX);
            match &groups {
                Some(groups) => groups
                    .get(n)
                    .map(|g| g.as_str().to_string())
                    .unwrap_or_else(|| caps[0].to_string()),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
