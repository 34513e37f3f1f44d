//! Healer Module - operator-approved fix cycles
//!
//! A cycle takes the top-ranked detected error through
//! `Detected → Generating → AwaitingApproval → Applied|Rejected → Verifying →
//! Resolved|VerificationFailed`. Every supervised process is paused for the
//! whole cycle and resumed when it ends, whatever the outcome. Only one cycle
//! runs at a time.

use crate::error::{HealError, Result};
use crate::supervisor::ProcessSupervisor;
use crate::terminal::{self, ApprovalDecision, OperatorCommand, OperatorConsole};
use crate::watcher::backup::BackupStore;
use crate::watcher::patch::PatchClient;
use crate::watcher::patterns::{DetectedError, ErrorKind};
use crate::watcher::select_for_handling;
use crate::watcher::syntax::SyntaxRegistry;
use crate::watcher::tracker::SourceTracker;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixState {
    Detected,
    Generating,
    AwaitingApproval,
    Applied,
    Rejected,
    Verifying,
    Resolved,
    VerificationFailed,
}

impl FixState {
    pub fn can_transition_to(self, next: FixState) -> bool {
        use FixState::*;
        matches!(
            (self, next),
            (Detected, Generating)
                | (Generating, AwaitingApproval)
                | (Generating, Resolved)
                | (AwaitingApproval, Applied)
                | (AwaitingApproval, Rejected)
                | (AwaitingApproval, Resolved)
                | (Applied, Verifying)
                | (Rejected, Resolved)
                | (Verifying, Resolved)
                | (Verifying, VerificationFailed)
                | (Resolved, Generating)
                | (VerificationFailed, Generating)
        )
    }
}

impl fmt::Display for FixState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// State of the fix attempt for one detected error.
#[derive(Debug, Clone)]
pub struct FixCycle {
    pub error: DetectedError,
    pub state: FixState,
    pub transitions: Vec<FixState>,
}

impl FixCycle {
    pub fn new(error: DetectedError) -> Self {
        Self {
            error,
            state: FixState::Detected,
            transitions: vec![FixState::Detected],
        }
    }

    pub fn advance(&mut self, next: FixState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(HealError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.transitions.push(next);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserDecision {
    Applied,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Verification {
    Valid,
    Invalid(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrectionAttempt {
    pub id: String,
    pub target_file: PathBuf,
    pub original_source: String,
    pub backup_path: Option<PathBuf>,
    pub proposed_source: String,
    pub user_decision: UserDecision,
    pub verification_result: Option<Verification>,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealerStats {
    pub errors_detected: usize,
    pub fixes_applied: usize,
    pub recent_errors: Vec<DetectedError>,
    pub recent_fixes: Vec<CorrectionAttempt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing worth handling in the batch
    Idle,
    /// Another cycle was already in flight
    Dropped,
    Finished(FixState),
    /// Operator asked to shut everything down
    Quit,
}

#[derive(Debug, Clone)]
pub struct HealerConfig {
    pub history_limit: usize,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self { history_limit: 50 }
    }
}

/// Backup, write and verify path shared by the healer and the batch fixer.
pub struct PatchApplier {
    backups: BackupStore,
    tracker: SourceTracker,
    syntax: Arc<SyntaxRegistry>,
}

impl PatchApplier {
    pub fn new(backups: BackupStore, syntax: Arc<SyntaxRegistry>) -> Self {
        Self {
            backups,
            tracker: SourceTracker::new(),
            syntax,
        }
    }

    /// Read the file a fix will be generated from and remember its content.
    pub fn read_target(&self, path: &Path) -> Result<String> {
        let source = std::fs::read_to_string(path)?;
        self.tracker.record_read(path, &source);
        Ok(source)
    }

    /// Back up and overwrite `path`, unless it changed since `read_target`.
    pub fn write_candidate(&self, path: &Path, candidate: &str) -> Result<PathBuf> {
        self.tracker.check_staleness(path)?;
        let backup = self.backups.create_backup(path)?;
        std::fs::write(path, candidate)?;
        self.tracker.forget(path);
        info!(file = %path.display(), backup = %backup.display(), "Applied fix");
        Ok(backup)
    }

    pub async fn verify(&self, path: &Path, candidate: &str) -> Verification {
        match self.syntax.check(path, candidate).await {
            Ok(None) => Verification::Valid,
            Ok(Some(issue)) => Verification::Invalid(format!("line {}: {}", issue.line, issue.message)),
            Err(e) => Verification::Invalid(e.to_string()),
        }
    }
}

struct Proposal {
    target: Option<PathBuf>,
    original: Option<String>,
    text: String,
    applicable: bool,
}

fn manual_fix_placeholder(error: &DetectedError) -> String {
    format!(
        "# Manual fix required for: {}\n# Error type: {}\n# Please review and fix manually",
        error.message, error.kind
    )
}

#[derive(Default)]
struct HealerHistory {
    errors: VecDeque<DetectedError>,
    attempts: VecDeque<CorrectionAttempt>,
    errors_detected: usize,
    fixes_applied: usize,
    last_transitions: Vec<FixState>,
}

/// Clears the busy flag when a cycle ends, including on early return.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Healer {
    config: HealerConfig,
    supervisor: Arc<ProcessSupervisor>,
    patch_client: Option<Arc<PatchClient>>,
    applier: PatchApplier,
    busy: Arc<AtomicBool>,
    history: Mutex<HealerHistory>,
}

impl Healer {
    pub fn new(
        config: HealerConfig,
        supervisor: Arc<ProcessSupervisor>,
        patch_client: Option<Arc<PatchClient>>,
        applier: PatchApplier,
    ) -> Self {
        Self {
            config,
            supervisor,
            patch_client,
            applier,
            busy: Arc::new(AtomicBool::new(false)),
            history: Mutex::new(HealerHistory::default()),
        }
    }

    /// Set while a cycle is in flight; the detector skips polls while it is.
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }

    pub fn stats(&self) -> HealerStats {
        let Ok(history) = self.history.lock() else {
            return HealerStats::default();
        };
        HealerStats {
            errors_detected: history.errors_detected,
            fixes_applied: history.fixes_applied,
            recent_errors: history.errors.iter().rev().take(5).rev().cloned().collect(),
            recent_fixes: history.attempts.iter().rev().take(5).rev().cloned().collect(),
        }
    }

    pub fn attempts(&self) -> Vec<CorrectionAttempt> {
        self.history
            .lock()
            .map(|h| h.attempts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_transitions(&self) -> Vec<FixState> {
        self.history
            .lock()
            .map(|h| h.last_transitions.clone())
            .unwrap_or_default()
    }

    /// Run one fix cycle for the top-ranked error of `errors`.
    pub async fn handle(
        &self,
        errors: Vec<DetectedError>,
        console: &mut dyn OperatorConsole,
    ) -> Result<CycleOutcome> {
        let Some(error) = select_for_handling(&errors).cloned() else {
            return Ok(CycleOutcome::Idle);
        };

        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(message = %error.message, "Fix cycle in flight, dropping detection");
            return Ok(CycleOutcome::Dropped);
        }
        let _guard = BusyGuard(self.busy.clone());

        self.record_error(&error);
        println!("[HEALER] {} detected: {}", error.kind, error.message);

        let paused = self.supervisor.pause_all().await;
        if !paused.changed.is_empty() {
            println!("[HEALER] Paused: {}", paused.changed.join(", "));
        }

        let mut cycle = FixCycle::new(error);
        let result = self.drive(&mut cycle, console).await;
        self.remember_transitions(&cycle);

        match &result {
            Ok(CycleOutcome::Quit) => {
                println!("[HEALER] Stopping all servers...");
                self.supervisor.stop_all().await;
            }
            _ => {
                let resumed = self.supervisor.resume_all().await;
                if !resumed.changed.is_empty() {
                    println!("[HEALER] Resumed: {}", resumed.changed.join(", "));
                }
            }
        }

        result
    }

    async fn drive(
        &self,
        cycle: &mut FixCycle,
        console: &mut dyn OperatorConsole,
    ) -> Result<CycleOutcome> {
        loop {
            cycle.advance(FixState::Generating)?;
            let proposal = self.propose(&cycle.error).await;
            terminal::render_error_screen(&cycle.error, Some(proposal.text.as_str()), true);

            match (&proposal.target, &proposal.original, proposal.applicable) {
                (Some(target), Some(original), true) => {
                    cycle.advance(FixState::AwaitingApproval)?;
                    self.approve_and_apply(cycle, target, original, &proposal.text, console)
                        .await?;
                }
                _ => cycle.advance(FixState::Resolved)?,
            }

            loop {
                terminal::render_menu();
                match terminal::ask_command(console)? {
                    OperatorCommand::Resume => return Ok(CycleOutcome::Finished(cycle.state)),
                    OperatorCommand::Quit => return Ok(CycleOutcome::Quit),
                    OperatorCommand::Regenerate => break,
                    OperatorCommand::Status => {
                        let statuses = self.supervisor.status().await;
                        terminal::render_status(&statuses, &self.stats());
                    }
                }
            }
        }
    }

    async fn propose(&self, error: &DetectedError) -> Proposal {
        let placeholder = |target: Option<PathBuf>, original: Option<String>| Proposal {
            target,
            original,
            text: manual_fix_placeholder(error),
            applicable: false,
        };

        let Some(target) = error.source_file.clone() else {
            return placeholder(None, None);
        };

        let original = match self.applier.read_target(&target) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("[HEALER] Cannot read {}: {}", target.display(), e);
                return placeholder(Some(target), None);
            }
        };

        let Some(client) = &self.patch_client else {
            println!("[HEALER] AI provider unavailable, manual fix required.");
            return placeholder(Some(target), Some(original));
        };

        println!(
            "[HEALER] Asking {} ({}) for a fix...",
            client.provider_name(),
            client.model()
        );
        match client
            .generate_fix(&target, &original, &error.error_text())
            .await
        {
            Ok(candidate) => Proposal {
                target: Some(target),
                original: Some(original),
                text: candidate,
                applicable: true,
            },
            Err(e) => {
                eprintln!("[HEALER] Fix generation failed: {}", e);
                placeholder(Some(target), Some(original))
            }
        }
    }

    async fn approve_and_apply(
        &self,
        cycle: &mut FixCycle,
        target: &Path,
        original: &str,
        candidate: &str,
        console: &mut dyn OperatorConsole,
    ) -> Result<()> {
        terminal::render_approval_prompt(target, &cycle.error.error_text(), candidate);

        loop {
            match terminal::ask_decision(console)? {
                ApprovalDecision::Yes => break,
                ApprovalDecision::Details => terminal::render_details(candidate),
                ApprovalDecision::No => {
                    println!("[HEALER] Fix rejected, {} left unchanged.", target.display());
                    cycle.advance(FixState::Rejected)?;
                    self.record_attempt(CorrectionAttempt {
                        id: Uuid::new_v4().to_string(),
                        target_file: target.to_path_buf(),
                        original_source: original.to_string(),
                        backup_path: None,
                        proposed_source: candidate.to_string(),
                        user_decision: UserDecision::Rejected,
                        verification_result: None,
                        timestamp: Local::now(),
                    });
                    cycle.advance(FixState::Resolved)?;
                    return Ok(());
                }
            }
        }

        let backup = match self.applier.write_candidate(target, candidate) {
            Ok(backup) => backup,
            Err(e) => {
                eprintln!("[HEALER] Fix not applied: {}", e);
                cycle.advance(FixState::Resolved)?;
                return Ok(());
            }
        };
        println!("[HEALER] Backup saved to {}", backup.display());
        cycle.advance(FixState::Applied)?;

        cycle.advance(FixState::Verifying)?;
        let verification = self.applier.verify(target, candidate).await;
        match &verification {
            Verification::Valid => {
                println!("[HEALER] Fix applied and verified: {}", target.display());
                cycle.advance(FixState::Resolved)?;
                self.restart_crashed(&cycle.error).await;
            }
            Verification::Invalid(reason) => {
                eprintln!(
                    "[HEALER] Patched file still fails the syntax check ({}). Original kept at {}",
                    reason,
                    backup.display()
                );
                cycle.advance(FixState::VerificationFailed)?;
            }
        }

        self.record_attempt(CorrectionAttempt {
            id: Uuid::new_v4().to_string(),
            target_file: target.to_path_buf(),
            original_source: original.to_string(),
            backup_path: Some(backup),
            proposed_source: candidate.to_string(),
            user_decision: UserDecision::Applied,
            verification_result: Some(verification),
            timestamp: Local::now(),
        });
        Ok(())
    }

    async fn restart_crashed(&self, error: &DetectedError) {
        if error.kind != ErrorKind::ProcessCrash {
            return;
        }
        let Some(name) = &error.component else {
            return;
        };
        match self.supervisor.start(name).await {
            Ok(true) => println!("[HEALER] Restarted {}", name),
            Ok(false) => {}
            Err(e) => warn!(process = %name, error = %e, "Restart after fix failed"),
        }
    }

    fn record_error(&self, error: &DetectedError) {
        if let Ok(mut history) = self.history.lock() {
            history.errors_detected += 1;
            history.errors.push_back(error.clone());
            while history.errors.len() > self.config.history_limit {
                history.errors.pop_front();
            }
        }
    }

    fn record_attempt(&self, attempt: CorrectionAttempt) {
        if let Ok(mut history) = self.history.lock() {
            if attempt.user_decision == UserDecision::Applied {
                history.fixes_applied += 1;
            }
            history.attempts.push_back(attempt);
            while history.attempts.len() > self.config.history_limit {
                history.attempts.pop_front();
            }
        }
    }

    fn remember_transitions(&self, cycle: &FixCycle) {
        if let Ok(mut history) = self.history.lock() {
            history.last_transitions = cycle.transitions.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionRequest, CompletionResponse, Provider, ProviderInfo};
    use crate::supervisor::ProcessStatus;
    use crate::terminal::tests::ScriptedConsole;
    use crate::watcher::patch::tests::ScriptedProvider;
    use crate::watcher::patterns::Severity;
    use async_trait::async_trait;
    use regex::Regex;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use super::FixState::*;

    const BROKEN: &str = "if True\n    print(1)\n";
    const FIXED: &str = "if True:\n    print(1)\n";

    struct Fixture {
        dir: TempDir,
        file: PathBuf,
        supervisor: Arc<ProcessSupervisor>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let file = dir.path().join("server.py");
            fs::write(&file, BROKEN).unwrap();
            let supervisor = Arc::new(
                ProcessSupervisor::new(dir.path().join("out"), Duration::from_secs(2)).unwrap(),
            );
            Self {
                dir,
                file,
                supervisor,
            }
        }

        fn backup_dir(&self) -> PathBuf {
            self.dir.path().join(".self_healing_backups")
        }

        fn healer(&self, provider: Option<Arc<dyn Provider>>) -> Healer {
            let client = provider
                .map(|p| Arc::new(PatchClient::new(p, "gemini-test", self.dir.path())));
            let applier = PatchApplier::new(
                BackupStore::new(self.backup_dir()),
                Arc::new(SyntaxRegistry::default()),
            );
            Healer::new(
                HealerConfig::default(),
                self.supervisor.clone(),
                client,
                applier,
            )
        }

        fn error(&self) -> DetectedError {
            DetectedError::new(ErrorKind::SyntaxError, Severity::High, "expected ':'")
                .with_location(self.file.clone(), Some(1))
        }

        fn backups(&self) -> Vec<PathBuf> {
            match fs::read_dir(self.backup_dir()) {
                Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    fn scripted(replies: &[&str]) -> Arc<dyn Provider> {
        Arc::new(ScriptedProvider::new(
            replies.iter().map(|r| Ok(r.to_string())).collect(),
        ))
    }

    /// Records what the supervisor looked like while the fix was generated.
    struct ObservingProvider {
        supervisor: Arc<ProcessSupervisor>,
        seen: Mutex<Vec<Vec<ProcessStatus>>>,
        reply: String,
    }

    #[async_trait]
    impl Provider for ObservingProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "observing".into(),
                display_name: "Observing".into(),
                default_model: "test".into(),
            }
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let status = self.supervisor.status().await;
            self.seen.lock().unwrap().push(status);
            Ok(CompletionResponse::text(request.model, self.reply.clone()))
        }
    }

    /// Edits the target behind the healer's back while "thinking".
    struct EditingProvider {
        path: PathBuf,
    }

    #[async_trait]
    impl Provider for EditingProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "editing".into(),
                display_name: "Editing".into(),
                default_model: "test".into(),
            }
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            fs::write(&self.path, "# edited by hand\n").unwrap();
            Ok(CompletionResponse::text(request.model, FIXED.to_string()))
        }
    }

    #[tokio::test]
    async fn test_reject_leaves_file_byte_identical() {
        let fx = Fixture::new();
        let healer = fx.healer(Some(scripted(&[FIXED])));
        let mut console = ScriptedConsole::new(&["n", ""]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Finished(Resolved));
        assert_eq!(fs::read(&fx.file).unwrap(), BROKEN.as_bytes());
        assert!(fx.backups().is_empty());
        assert_eq!(
            healer.last_transitions(),
            vec![Detected, Generating, AwaitingApproval, Rejected, Resolved]
        );
        let attempts = healer.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].user_decision, UserDecision::Rejected);
        assert_eq!(attempts[0].verification_result, None);
        assert_eq!(healer.stats().fixes_applied, 0);
    }

    #[tokio::test]
    async fn test_apply_backs_up_original_and_verifies() {
        let fx = Fixture::new();
        let healer = fx.healer(Some(scripted(&["```python\nif True:\n    print(1)\n```"])));
        let mut console = ScriptedConsole::new(&["d", "y", ""]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Finished(Resolved));
        assert_eq!(fs::read_to_string(&fx.file).unwrap(), FIXED);

        let backups = fx.backups();
        assert_eq!(backups.len(), 1);
        let name = backups[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(Regex::new(r"^server\.py\.backup_\d{8}_\d{6}$").unwrap().is_match(&name));
        assert_eq!(fs::read_to_string(&backups[0]).unwrap(), BROKEN);

        assert_eq!(
            healer.last_transitions(),
            vec![Detected, Generating, AwaitingApproval, Applied, Verifying, Resolved]
        );
        let attempt = &healer.attempts()[0];
        assert_eq!(attempt.verification_result, Some(Verification::Valid));
        assert_eq!(attempt.backup_path.as_deref(), Some(backups[0].as_path()));
        assert_eq!(attempt.original_source, BROKEN);
        assert_eq!(healer.stats().fixes_applied, 1);
    }

    #[tokio::test]
    async fn test_still_broken_candidate_fails_verification() {
        let fx = Fixture::new();
        let healer = fx.healer(Some(scripted(&["while True\n    pass\n"])));
        let mut console = ScriptedConsole::new(&["y", ""]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Finished(VerificationFailed));
        assert_eq!(fx.backups().len(), 1);
        assert_eq!(fs::read_to_string(&fx.file).unwrap(), "while True\n    pass");
        assert!(matches!(
            healer.attempts()[0].verification_result,
            Some(Verification::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_placeholder_without_provider_is_never_written() {
        let fx = Fixture::new();
        let healer = fx.healer(None);
        let mut console = ScriptedConsole::new(&[""]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Finished(Resolved));
        assert_eq!(fs::read(&fx.file).unwrap(), BROKEN.as_bytes());
        assert_eq!(console.prompts, vec!["Command"]);
        assert_eq!(
            healer.last_transitions(),
            vec![Detected, Generating, Resolved]
        );
    }

    #[tokio::test]
    async fn test_generation_failure_falls_back_to_placeholder() {
        let fx = Fixture::new();
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(vec![Err(
            HealError::GenerationFailure("quota".into()),
        )]));
        let healer = fx.healer(Some(provider));
        let mut console = ScriptedConsole::new(&[""]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Finished(Resolved));
        assert_eq!(fs::read(&fx.file).unwrap(), BROKEN.as_bytes());
        assert!(healer.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_edit_aborts_write() {
        let fx = Fixture::new();
        let provider: Arc<dyn Provider> = Arc::new(EditingProvider {
            path: fx.file.clone(),
        });
        let healer = fx.healer(Some(provider));
        let mut console = ScriptedConsole::new(&["y", ""]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Finished(Resolved));
        assert_eq!(fs::read_to_string(&fx.file).unwrap(), "# edited by hand\n");
        assert!(fx.backups().is_empty());
        assert_eq!(
            healer.last_transitions(),
            vec![Detected, Generating, AwaitingApproval, Resolved]
        );
    }

    #[tokio::test]
    async fn test_regenerate_asks_again_for_same_error() {
        let fx = Fixture::new();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok("print('first try')\nif x\n".to_string()),
            Ok(FIXED.to_string()),
        ]));
        let healer = fx.healer(Some(provider.clone() as Arc<dyn Provider>));
        let mut console = ScriptedConsole::new(&["n", "r", "y", "resume"]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Finished(Resolved));
        assert_eq!(provider.prompts.lock().unwrap().len(), 2);
        assert_eq!(fs::read_to_string(&fx.file).unwrap(), FIXED.trim_end());
        assert_eq!(healer.attempts().len(), 2);
        assert_eq!(healer.stats().errors_detected, 1);
    }

    #[tokio::test]
    async fn test_busy_healer_drops_detection() {
        let fx = Fixture::new();
        let healer = fx.healer(None);
        healer.busy_flag().store(true, Ordering::SeqCst);
        let mut console = ScriptedConsole::new(&[]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Dropped);
        assert!(console.prompts.is_empty());
    }

    #[tokio::test]
    async fn test_low_severity_batch_is_idle() {
        let fx = Fixture::new();
        let healer = fx.healer(None);
        let mut console = ScriptedConsole::new(&[]);
        let note = DetectedError::new(ErrorKind::RuntimeError, Severity::Low, "unreadable");

        let outcome = healer.handle(vec![note], &mut console).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
        assert!(!healer.busy_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut cycle = FixCycle::new(DetectedError::new(
            ErrorKind::LogError,
            Severity::Medium,
            "x",
        ));
        assert!(matches!(
            cycle.advance(Applied),
            Err(HealError::InvalidTransition { .. })
        ));
        cycle.advance(Generating).unwrap();
        cycle.advance(Resolved).unwrap();
        cycle.advance(Generating).unwrap();
        assert_eq!(cycle.transitions.len(), 4);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipeline_pauses_during_cycle_and_resumes_after() {
        use crate::watcher::{ErrorDetector, LogMonitor, WatchLoop};
        use tokio::sync::mpsc;

        let fx = Fixture::new();
        fx.supervisor
            .register("sleeper", vec!["sleep".into(), "60".into()], None, Some(5000))
            .await
            .unwrap();
        fx.supervisor.start("sleeper").await.unwrap();
        let pid = fx.supervisor.status().await[0].pid;

        let provider = Arc::new(ObservingProvider {
            supervisor: fx.supervisor.clone(),
            seen: Mutex::new(Vec::new()),
            reply: FIXED.to_string(),
        });
        let healer = fx.healer(Some(provider.clone() as Arc<dyn Provider>));

        let detector = Arc::new(ErrorDetector::new(
            fx.dir.path(),
            vec![fx.file.clone()],
            Arc::new(SyntaxRegistry::default()),
            LogMonitor::new(vec![fx.dir.path().join("logs")], 10),
        ));
        let (tx, mut rx) = mpsc::channel(1);
        let watch = WatchLoop::new(
            detector,
            fx.supervisor.clone(),
            healer.busy_flag(),
            Duration::from_millis(50),
        );
        let watch_handle = tokio::spawn(watch.run(tx));

        let errors = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(errors[0].kind, ErrorKind::SyntaxError);

        let mut console = ScriptedConsole::new(&["y", ""]);
        let outcome = healer.handle(errors, &mut console).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Finished(Resolved));

        let during = provider.seen.lock().unwrap().clone();
        assert_eq!(during.len(), 1);
        assert!(during[0][0].running && during[0][0].paused);

        let after = &fx.supervisor.status().await[0];
        assert!(after.running);
        assert!(!after.paused);
        assert_eq!(after.pid, pid);

        watch_handle.abort();
        fx.supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quit_stops_everything() {
        let fx = Fixture::new();
        fx.supervisor
            .register("sleeper", vec!["sleep".into(), "60".into()], None, None)
            .await
            .unwrap();
        fx.supervisor.start("sleeper").await.unwrap();
        let healer = fx.healer(None);
        let mut console = ScriptedConsole::new(&["q"]);

        let outcome = healer.handle(vec![fx.error()], &mut console).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Quit);
        let status = &fx.supervisor.status().await[0];
        assert!(!status.running && !status.paused);
    }
}
