//! Integration tests for the scan orchestrator and scanner.

use std::io::{self, BufRead, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use logtriage::causes::{Cause, Indication};
use logtriage::scan::{
    LogSource, MemoryLogSource, ScanBudget, ScanSettings, orchestrator::ScanOrchestrator,
};

fn orchestrator() -> ScanOrchestrator {
    ScanOrchestrator::new(ScanSettings::default())
}

fn single(name: &str, pattern: &str) -> Cause {
    Cause::new(name, "d").with_indication(Indication::single_line(pattern))
}

// ── Core scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_line_rule_matches_first_line_only() {
    // Scenario A: matched text is the brief line, not the detail line.
    let causes = vec![single("err", "ERROR: (.*?)$")];
    let source = Arc::new(MemoryLogSource::new("ERROR: brief\n  detail\n"));
    let outcome = orchestrator().scan(&causes, source, "1").await;

    assert_eq!(outcome.found_causes.len(), 1);
    let found = &outcome.found_causes[0];
    assert_eq!(found.name, "err");
    assert_eq!(found.indications.len(), 1);
    assert_eq!(found.indications[0].matched_text, "ERROR: brief");
    assert_eq!(found.indications[0].source, "log");
    assert_eq!(found.indications[0].build_id, "1");
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_multi_line_rule_matches_two_line_block() {
    // Scenario B: the same log, a rule spanning both lines.
    let causes = vec![Cause::new("err", "d")
        .with_indication(Indication::multi_line("ERROR: (.*?)$.*?  detail"))];
    let source = Arc::new(MemoryLogSource::new("ERROR: brief\n  detail\n"));
    let outcome = orchestrator().scan(&causes, source, "2").await;

    assert_eq!(outcome.found_causes.len(), 1);
    assert_eq!(
        outcome.found_causes[0].indications[0].matched_text,
        "ERROR: brief\n  detail"
    );
}

#[tokio::test]
async fn test_two_causes_matching_same_line_both_reported() {
    // Scenario C: independent FoundCauses referencing the same matched text.
    let causes = vec![
        single("generic-error", "ERROR: .*"),
        single("brief-error", "ERROR: brief"),
    ];
    let source = Arc::new(MemoryLogSource::new("ERROR: brief\n"));
    let outcome = orchestrator().scan(&causes, source, "3").await;

    assert_eq!(outcome.found_causes.len(), 2);
    for found in &outcome.found_causes {
        assert_eq!(found.indications[0].matched_text, "ERROR: brief");
    }
    // Same text, same deterministic hash from either cause.
    assert_eq!(
        outcome.found_causes[0].indications[0].matched_hash,
        outcome.found_causes[1].indications[0].matched_hash
    );
}

#[tokio::test]
async fn test_no_match_yields_empty_recorded_outcome() {
    // Scenario D: empty result, no exception.
    let causes = vec![single("absent", ".*something completely different.*")];
    let source = Arc::new(MemoryLogSource::new("ERROR: brief\n  detail\n"));
    let outcome = orchestrator().scan(&causes, source, "4").await;

    assert!(outcome.found_causes.is_empty());
    assert!(outcome.error.is_none());
    assert_eq!(outcome.build_id, "4");
}

// ── Concurrency and degradation ──────────────────────────────────────────────

#[tokio::test]
async fn test_match_is_independent_of_unrelated_causes() {
    let mut causes = vec![single("oom", "OutOfMemoryError")];
    for i in 0..50 {
        causes.push(single(&format!("unrelated-{i}"), &format!("pattern-{i}")));
        causes.push(
            Cause::new(format!("unrelated-ml-{i}"), "d")
                .with_indication(Indication::multi_line(format!("first-{i}$.*?second-{i}"))),
        );
    }
    let source = Arc::new(MemoryLogSource::new(
        "starting build\njava.lang.OutOfMemoryError: heap\ndone\n",
    ));
    let outcome = orchestrator().scan(&causes, source, "5").await;

    assert_eq!(outcome.found_causes.len(), 1);
    assert_eq!(outcome.found_causes[0].name, "oom");
}

#[tokio::test]
async fn test_pathological_rule_gives_up_within_budget_without_hiding_others() {
    let mut settings = ScanSettings::default();
    settings.budget = ScanBudget {
        line_timeout: Duration::from_millis(50),
        stream_timeout: Duration::from_millis(200),
    };
    let orchestrator = ScanOrchestrator::new(settings);

    let causes = vec![
        Cause::new("pathological", "d")
            .with_indication(Indication::multi_line("(x+x+)+y$.*?never")),
        single("real", "ERROR: .*"),
    ];
    let big_log = format!("{}ERROR: at the end\n", "xxxxxxxxxxxxxxxx filler\n".repeat(100_000));
    let source = Arc::new(MemoryLogSource::new(big_log));

    let started = Instant::now();
    let outcome = orchestrator.scan(&causes, source, "6").await;
    // The multi-line rule must give up inside its stream budget; the
    // single-line pass shares the same budget constant, so the whole scan
    // ends promptly either way.
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "scan must be bounded by the stream budget, took {:?}",
        started.elapsed()
    );
    assert!(!outcome
        .found_causes
        .iter()
        .any(|f| f.name == "pathological"));
}

/// Hands out readers that stall inside `fill_buf` and track how many are
/// mid-read at once, so tests can observe effective scan concurrency.
struct TrackedLogSource {
    content: String,
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct TrackedReader {
    inner: Cursor<Vec<u8>>,
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl io::Read for TrackedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.inner, buf)
    }
}

impl BufRead for TrackedReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

impl LogSource for TrackedLogSource {
    fn open(&self) -> io::Result<Box<dyn BufRead + Send>> {
        Ok(Box::new(TrackedReader {
            inner: Cursor::new(self.content.clone().into_bytes()),
            delay: self.delay,
            active: self.active.clone(),
            peak: self.peak.clone(),
        }))
    }

    fn id(&self) -> &str {
        "log"
    }
}

#[tokio::test]
async fn test_concurrent_scans_share_one_worker_pool() {
    let mut settings = ScanSettings::default();
    settings.threads = 1;
    let orchestrator = ScanOrchestrator::new(settings);

    let causes = vec![Cause::new("never", "d")
        .with_indication(Indication::multi_line("no such line$.*?ever"))];
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let source = || {
        Arc::new(TrackedLogSource {
            content: "one\ntwo\nthree\nfour\n".to_string(),
            delay: Duration::from_millis(30),
            active: active.clone(),
            peak: peak.clone(),
        })
    };

    let (a, b, c) = tokio::join!(
        orchestrator.scan(&causes, source(), "a"),
        orchestrator.scan(&causes, source(), "b"),
        orchestrator.scan(&causes, source(), "c"),
    );

    assert!(a.found_causes.is_empty());
    assert!(b.found_causes.is_empty());
    assert!(c.found_causes.is_empty());
    // With one permit, overlapping scans still read one stream at a time.
    assert_eq!(
        peak.load(Ordering::SeqCst),
        1,
        "scan tasks from concurrent scans must share the configured pool"
    );
}

/// Fails exactly one `open` call (the first one after the orchestrator's
/// probe), so exactly one scan task degrades.
struct FailSecondOpen {
    content: String,
    opens: AtomicUsize,
}

impl LogSource for FailSecondOpen {
    fn open(&self) -> io::Result<Box<dyn BufRead + Send>> {
        if self.opens.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(io::Error::new(io::ErrorKind::Other, "transient read failure"));
        }
        Ok(Box::new(Cursor::new(self.content.clone().into_bytes())))
    }

    fn id(&self) -> &str {
        "log"
    }
}

#[tokio::test]
async fn test_failing_task_does_not_suppress_other_results() {
    let causes = vec![
        single("sl", "ERROR: .*"),
        Cause::new("ml", "d").with_indication(Indication::multi_line("ERROR.*?$.*?detail")),
    ];
    let source = Arc::new(FailSecondOpen {
        content: "ERROR: brief\ndetail\n".to_string(),
        opens: AtomicUsize::new(0),
    });
    let outcome = orchestrator().scan(&causes, source, "7").await;

    // One of the two tasks lost its stream; the other's result survives.
    assert_eq!(outcome.found_causes.len(), 1);
    assert!(outcome.error.is_none());
}

struct NeverOpens;

impl LogSource for NeverOpens {
    fn open(&self) -> io::Result<Box<dyn BufRead + Send>> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no console log"))
    }

    fn id(&self) -> &str {
        "log"
    }
}

#[tokio::test]
async fn test_unavailable_stream_recorded_as_diagnostic() {
    let causes = vec![single("err", "ERROR: .*")];
    let outcome = orchestrator().scan(&causes, Arc::new(NeverOpens), "8").await;

    assert!(outcome.found_causes.is_empty());
    let error = outcome.error.expect("diagnostic must be recorded");
    assert!(error.contains("unavailable"), "got: {error}");
}

// ── Fallback categorization ──────────────────────────────────────────────────

#[tokio::test]
async fn test_fallback_causes_demoted_when_specific_cause_matches() {
    let mut settings = ScanSettings::default();
    settings.fallback_categories = vec!["generic".to_string()];
    let orchestrator = ScanOrchestrator::new(settings);

    let causes = vec![
        single("catchall", "ERROR.*").with_category("generic"),
        single("oom", "OutOfMemoryError").with_category("memory"),
    ];

    // Both match: only the specific cause survives.
    let source = Arc::new(MemoryLogSource::new("ERROR: OutOfMemoryError\n"));
    let outcome = orchestrator.scan(&causes, source, "9").await;
    assert_eq!(outcome.found_causes.len(), 1);
    assert_eq!(outcome.found_causes[0].name, "oom");

    // Only the catch-all matches: it still surfaces.
    let source = Arc::new(MemoryLogSource::new("ERROR: disk on fire\n"));
    let outcome = orchestrator.scan(&causes, source, "10").await;
    assert_eq!(outcome.found_causes.len(), 1);
    assert_eq!(outcome.found_causes[0].name, "catchall");
}

// ── Result shape ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_outcome_serializes_for_consumers() {
    let causes = vec![single("err", "ERROR: (.*?)$")];
    let source = Arc::new(MemoryLogSource::new("ERROR: brief\n"));
    let outcome = orchestrator().scan(&causes, source, "11").await;

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["build_id"], "11");
    assert_eq!(json["found_causes"][0]["name"], "err");
    assert!(json["found_causes"][0]["indications"][0]["matched_hash"]
        .as_str()
        .unwrap()
        .len() == 64);
    assert!(json.get("error").is_none(), "absent error is not serialized");
}
