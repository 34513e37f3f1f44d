//! Self-Healing Watcher Module - polling error detection and operator-approved fixing
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        WatchLoop                         │
//! │  every poll interval, unless a fix cycle is in flight    │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │ SyntaxRegistry│ │  Supervisor  │  │   LogMonitor   │  │
//! │  │ (tracked src) │ │ reap_exited  │  │ *_events.log   │  │
//! │  └──────┬───────┘  └──────┬───────┘  └───────┬────────┘  │
//! │         └─────────────────┼──────────────────┘           │
//! │                           ▼                              │
//! │                 ErrorDetector::scan + rank               │
//! └───────────────────────────┬──────────────────────────────┘
//!                             ▼ mpsc (capacity 1)
//!                 Healer: pause → generate → approve
//!                         → backup/apply → verify → resume
//! ```

pub mod backup;
pub mod healer;
pub mod logs;
pub mod patch;
pub mod patterns;
pub mod syntax;
pub mod tracker;

pub use healer::{CycleOutcome, Healer, HealerConfig};
pub use logs::LogMonitor;
pub use patch::PatchClient;
pub use patterns::{DetectedError, ErrorKind, Severity};
pub use syntax::SyntaxRegistry;

use crate::supervisor::ProcessSupervisor;
use patterns::{exception_summary, last_project_frame};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Runs the three checks of one detection cycle.
pub struct ErrorDetector {
    project_root: PathBuf,
    sources: Vec<PathBuf>,
    syntax: Arc<SyntaxRegistry>,
    logs: LogMonitor,
}

impl ErrorDetector {
    pub fn new(
        project_root: impl Into<PathBuf>,
        sources: Vec<PathBuf>,
        syntax: Arc<SyntaxRegistry>,
        logs: LogMonitor,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            sources,
            syntax,
            logs,
        }
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Syntax check every tracked file that exists.
    pub async fn check_syntax(&self) -> Vec<DetectedError> {
        let mut errors = Vec::new();

        for path in &self.sources {
            if !path.exists() {
                debug!(file = %path.display(), "Tracked file missing, skipping");
                continue;
            }

            let source = match std::fs::read_to_string(path) {
                Ok(source) => source,
                Err(e) => {
                    errors.push(
                        DetectedError::new(
                            ErrorKind::RuntimeError,
                            Severity::Low,
                            format!("Could not read file: {}", e),
                        )
                        .with_location(path.clone(), None)
                        .with_fingerprint(format!("read:{}:{}", path.display(), e)),
                    );
                    continue;
                }
            };

            let issue = match self.syntax.check(path, &source).await {
                Ok(issue) => issue,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Syntax checker failed");
                    continue;
                }
            };

            if let Some(issue) = issue {
                let mut error =
                    DetectedError::new(ErrorKind::SyntaxError, Severity::High, issue.message)
                        .with_location(path.clone(), Some(issue.line))
                        .with_fingerprint(format!(
                            "syntax:{}:{}",
                            path.display(),
                            tracker::content_digest(source.as_bytes())
                        ));
                if let Some(text) = source.lines().nth(issue.line.saturating_sub(1)) {
                    error = error.with_context(text.trim_end().to_string());
                }
                errors.push(error);
            }
        }

        errors
    }

    /// Turn every child that died since the last poll into a crash record.
    pub async fn check_liveness(&self, supervisor: &ProcessSupervisor) -> Vec<DetectedError> {
        supervisor
            .reap_exited()
            .await
            .into_iter()
            .map(|report| {
                let mut message = format!("Server '{}' {}", report.name, report.describe());
                if let Some(summary) = exception_summary(&report.stderr_tail) {
                    message.push_str(&format!(": {}", summary));
                }

                let mut error =
                    DetectedError::new(ErrorKind::ProcessCrash, Severity::Critical, message)
                        .with_component(report.name.clone())
                        .with_fingerprint(format!(
                            "crash:{}:{}",
                            report.name,
                            report.pid.unwrap_or(0)
                        ));
                if let Some((file, line)) =
                    last_project_frame(&report.stderr_tail, &self.project_root)
                {
                    error = error.with_location(file, Some(line));
                }
                if !report.stderr_tail.trim().is_empty() {
                    error = error.with_context(report.stderr_tail);
                }
                error
            })
            .collect()
    }

    pub fn check_logs(&self) -> Vec<DetectedError> {
        self.logs.scan()
    }

    /// One full cycle: syntax, liveness (when supervising), then logs; ranked.
    pub async fn scan(&self, supervisor: Option<&ProcessSupervisor>) -> Vec<DetectedError> {
        let mut errors = self.check_syntax().await;
        if let Some(supervisor) = supervisor {
            errors.extend(self.check_liveness(supervisor).await);
        }
        errors.extend(self.check_logs());
        rank(errors)
    }

    /// Path shown to the operator, relative to the project root when possible.
    pub fn display_path<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, str> {
        path.strip_prefix(&self.project_root)
            .unwrap_or(path)
            .to_string_lossy()
    }
}

/// Critical/high first, then medium, then low; first-found order inside a tier.
pub fn rank(mut errors: Vec<DetectedError>) -> Vec<DetectedError> {
    errors.sort_by_key(|e| e.severity.tier());
    errors
}

/// The error a healing cycle should take on. Low severity notes are never handled.
pub fn select_for_handling(errors: &[DetectedError]) -> Option<&DetectedError> {
    errors.iter().find(|e| e.severity >= Severity::Medium)
}

/// Remembers recently delivered fingerprints so an unchanged problem is
/// offered to the operator once.
#[derive(Debug)]
struct SeenFingerprints {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenFingerprints {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, fingerprint: &str) -> bool {
        !fingerprint.is_empty() && self.set.contains(fingerprint)
    }

    fn insert(&mut self, fingerprint: &str) {
        if fingerprint.is_empty() || !self.set.insert(fingerprint.to_string()) {
            return;
        }
        self.order.push_back(fingerprint.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

/// Background poller feeding ranked errors to the healing loop.
///
/// Only the error the healer will take on is marked as seen. Everything else
/// in the batch is offered again on a later poll. Crash records cannot be
/// re-detected once reaped, so unhandled ones are carried over.
pub struct WatchLoop {
    detector: Arc<ErrorDetector>,
    supervisor: Arc<ProcessSupervisor>,
    busy: Arc<AtomicBool>,
    interval: Duration,
    seen: SeenFingerprints,
    pending_crashes: Vec<DetectedError>,
}

impl WatchLoop {
    pub fn new(
        detector: Arc<ErrorDetector>,
        supervisor: Arc<ProcessSupervisor>,
        busy: Arc<AtomicBool>,
        interval: Duration,
    ) -> Self {
        Self {
            detector,
            supervisor,
            busy,
            interval,
            seen: SeenFingerprints::new(1024),
            pending_crashes: Vec::new(),
        }
    }

    /// Merge carried-over crashes into a fresh scan and drop what was
    /// already offered.
    fn fresh_errors(&mut self, scanned: Vec<DetectedError>) -> Vec<DetectedError> {
        let mut errors = std::mem::take(&mut self.pending_crashes);
        errors.extend(scanned);
        rank(errors)
            .into_iter()
            .filter(|e| !self.seen.contains(&e.fingerprint))
            .collect()
    }

    /// Remember crashes from `batch` other than `handled` for the next poll.
    fn carry_over(&mut self, batch: &[DetectedError], handled: Option<&str>) {
        self.pending_crashes = batch
            .iter()
            .filter(|e| e.kind == ErrorKind::ProcessCrash)
            .filter(|e| handled != Some(e.fingerprint.as_str()))
            .cloned()
            .collect();
    }

    /// Poll until the receiving side goes away.
    pub async fn run(mut self, tx: mpsc::Sender<Vec<DetectedError>>) {
        info!(interval_secs = self.interval.as_secs(), "Error detector started");

        loop {
            if self.busy.load(Ordering::SeqCst) {
                tokio::time::sleep(self.interval).await;
                continue;
            }

            let detector = self.detector.clone();
            let supervisor = self.supervisor.clone();
            let cycle = tokio::spawn(async move { detector.scan(Some(&supervisor)).await });

            let errors = match cycle.await {
                Ok(errors) => errors,
                Err(e) => {
                    warn!(error = %e, "Detection cycle failed");
                    tokio::time::sleep(self.interval * 2).await;
                    continue;
                }
            };

            let fresh = self.fresh_errors(errors);
            let Some(selected) = select_for_handling(&fresh).map(|e| e.fingerprint.clone())
            else {
                self.carry_over(&fresh, None);
                tokio::time::sleep(self.interval).await;
                continue;
            };

            self.carry_over(&fresh, Some(&selected));
            match tx.try_send(fresh) {
                Ok(()) => self.seen.insert(&selected),
                Err(TrySendError::Full(batch)) => {
                    debug!("Healing cycle in flight, deferring detection");
                    self.carry_over(&batch, None);
                }
                Err(TrySendError::Closed(_)) => break,
            }

            tokio::time::sleep(self.interval).await;
        }

        info!("Error detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn detector_for(root: &Path, sources: Vec<PathBuf>) -> ErrorDetector {
        ErrorDetector::new(
            root,
            sources,
            Arc::new(SyntaxRegistry::default()),
            LogMonitor::new(vec![root.join("logs")], 10),
        )
    }

    #[tokio::test]
    async fn test_missing_colon_yields_single_high_syntax_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("server.py");
        fs::write(&file, "if True\n    print(1)\n").unwrap();

        let detector = detector_for(dir.path(), vec![file.clone()]);
        let errors = detector.scan(None).await;

        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.kind, ErrorKind::SyntaxError);
        assert_eq!(error.severity, Severity::High);
        assert_eq!(error.source_file.as_deref(), Some(file.as_path()));
        assert_eq!(error.line, Some(1));
        assert_eq!(error.context.as_deref(), Some("if True"));
    }

    #[tokio::test]
    async fn test_valid_sources_scan_clean_twice() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("ok.py");
        fs::write(&file, "def main():\n    return 0\n").unwrap();
        let detector = detector_for(dir.path(), vec![file, dir.path().join("gone.py")]);

        assert!(detector.scan(None).await.is_empty());
        assert!(detector.scan(None).await.is_empty());
    }

    #[test]
    fn test_rank_is_stable_by_tier() {
        let errors = vec![
            DetectedError::new(ErrorKind::LogError, Severity::Medium, "log-1"),
            DetectedError::new(ErrorKind::SyntaxError, Severity::High, "syntax-1"),
            DetectedError::new(ErrorKind::RuntimeError, Severity::Low, "note"),
            DetectedError::new(ErrorKind::ProcessCrash, Severity::Critical, "crash-1"),
            DetectedError::new(ErrorKind::LogError, Severity::Medium, "log-2"),
        ];
        let ranked: Vec<String> = rank(errors).into_iter().map(|e| e.message).collect();
        assert_eq!(ranked, vec!["syntax-1", "crash-1", "log-1", "log-2", "note"]);
    }

    #[test]
    fn test_low_severity_is_never_selected() {
        let errors = vec![DetectedError::new(
            ErrorKind::RuntimeError,
            Severity::Low,
            "unreadable",
        )];
        assert!(select_for_handling(&errors).is_none());
    }

    #[test]
    fn test_seen_fingerprints_are_bounded() {
        let mut seen = SeenFingerprints::new(2);
        seen.insert("a");
        seen.insert("b");
        seen.insert("c");
        assert!(!seen.contains("a"));
        assert!(seen.contains("b") && seen.contains("c"));
        assert!(!seen.contains(""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_record_points_at_project_frame() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let script = root.join("app.py");
        fs::write(&script, "raise RuntimeError('bad config')\n").unwrap();

        let supervisor =
            ProcessSupervisor::new(root.join("out"), Duration::from_secs(1)).unwrap();
        let trace = format!(
            "printf 'Traceback (most recent call last):\\n  File \"{}\", line 1, in <module>\\nRuntimeError: bad config\\n' >&2; exit 1",
            script.display()
        );
        supervisor
            .register("api", vec!["sh".into(), "-c".into(), trace], None, None)
            .await
            .unwrap();
        supervisor.start("api").await.unwrap();

        let detector = detector_for(&root, Vec::new());
        let mut crashes = Vec::new();
        for _ in 0..50 {
            crashes = detector.check_liveness(&supervisor).await;
            if !crashes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(crashes.len(), 1);
        let crash = &crashes[0];
        assert_eq!(crash.kind, ErrorKind::ProcessCrash);
        assert_eq!(crash.severity, Severity::Critical);
        assert_eq!(crash.component.as_deref(), Some("api"));
        assert_eq!(crash.source_file.as_deref(), Some(script.as_path()));
        assert_eq!(crash.line, Some(1));
        assert!(crash.message.ends_with("RuntimeError: bad config"));
    }

    #[tokio::test]
    async fn test_watch_loop_delivers_once_per_fingerprint() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("broken.py");
        fs::write(&file, "x = (\n").unwrap();

        let detector = Arc::new(detector_for(dir.path(), vec![file]));
        let supervisor =
            Arc::new(ProcessSupervisor::new(dir.path().join("out"), Duration::from_secs(1)).unwrap());
        let busy = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel(4);

        let watch = WatchLoop::new(detector, supervisor, busy, Duration::from_millis(20));
        let handle = tokio::spawn(watch.run(tx));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message, "'(' was never closed");

        // unchanged file: nothing new within several polls
        let again = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(again.is_err());

        handle.abort();
    }

    fn start_watch(
        detector: ErrorDetector,
        supervisor: Arc<ProcessSupervisor>,
    ) -> (tokio::task::JoinHandle<()>, mpsc::Receiver<Vec<DetectedError>>) {
        let busy = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(4);
        let watch = WatchLoop::new(Arc::new(detector), supervisor, busy, Duration::from_millis(20));
        (tokio::spawn(watch.run(tx)), rx)
    }

    async fn next_batch(rx: &mut mpsc::Receiver<Vec<DetectedError>>) -> Vec<DetectedError> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unhandled_errors_are_offered_on_next_poll() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.py");
        let b = dir.path().join("b.py");
        fs::write(&a, "x = (\n").unwrap();
        fs::write(&b, "if True\n    pass\n").unwrap();

        let supervisor =
            Arc::new(ProcessSupervisor::new(dir.path().join("out"), Duration::from_secs(1)).unwrap());
        let detector = detector_for(dir.path(), vec![a.clone(), b.clone()]);
        let (handle, mut rx) = start_watch(detector, supervisor);

        let first = next_batch(&mut rx).await;
        assert_eq!(first.len(), 2);
        let handled = select_for_handling(&first).unwrap();
        assert_eq!(handled.source_file.as_deref(), Some(a.as_path()));

        // a.py stays broken but was already offered; b.py comes back
        let second = next_batch(&mut rx).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source_file.as_deref(), Some(b.as_path()));

        let again = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(again.is_err());

        handle.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_behind_syntax_error_is_carried_over() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("server.py");
        fs::write(&file, "x = (\n").unwrap();

        let supervisor =
            Arc::new(ProcessSupervisor::new(dir.path().join("out"), Duration::from_secs(1)).unwrap());
        supervisor
            .register("api", vec!["sh".into(), "-c".into(), "exit 3".into()], None, None)
            .await
            .unwrap();
        supervisor.start("api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (handle, mut rx) = start_watch(detector_for(dir.path(), vec![file]), supervisor);

        let first = next_batch(&mut rx).await;
        assert_eq!(first.len(), 2);
        assert_eq!(select_for_handling(&first).unwrap().kind, ErrorKind::SyntaxError);
        assert!(first.iter().any(|e| e.kind == ErrorKind::ProcessCrash));

        let second = next_batch(&mut rx).await;
        assert_eq!(second.len(), 1);
        let crash = select_for_handling(&second).unwrap();
        assert_eq!(crash.kind, ErrorKind::ProcessCrash);
        assert_eq!(crash.component.as_deref(), Some("api"));

        handle.abort();
    }
}
