//! Batch fixer: run a command until it passes, patching the file its
//! traceback points at between attempts.

use crate::error::{HealError, Result};
use crate::terminal::{self, ApprovalDecision, OperatorConsole};
use crate::watcher::healer::{PatchApplier, Verification};
use crate::watcher::patch::PatchClient;
use crate::watcher::patterns::last_project_frame;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FixOptions {
    pub command: String,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub auto_approve: bool,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            command: String::new(),
            max_attempts: 5,
            timeout: Duration::from_secs(180),
            auto_approve: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRun {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.stderr.trim().is_empty()
    }
}

/// Run `argv` in `cwd`. The child is killed and `Timeout` returned once
/// `timeout` elapses.
pub async fn run_command(argv: &[String], cwd: &Path, timeout: Duration) -> Result<CommandRun> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| HealError::Configuration("Empty fix command".to_string()))?;

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HealError::LaunchFailure {
            name: program.clone(),
            reason: e.to_string(),
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandRun {
                exit_code: output.status.code().unwrap_or(1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => Err(HealError::Timeout(timeout.as_secs())),
    }
}

pub struct BatchFixer {
    project_root: PathBuf,
    client: Option<PatchClient>,
    applier: PatchApplier,
    options: FixOptions,
}

impl BatchFixer {
    pub fn new(
        project_root: impl Into<PathBuf>,
        client: Option<PatchClient>,
        applier: PatchApplier,
        options: FixOptions,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            client,
            applier,
            options,
        }
    }

    /// Loop until the command passes or a stop condition hits. Returns the
    /// process exit code.
    pub async fn run(&self, console: &mut dyn OperatorConsole) -> Result<i32> {
        let argv = shell_words::split(&self.options.command)
            .map_err(|e| HealError::Configuration(format!("Invalid fix command: {}", e)))?;

        for attempt in 1..=self.options.max_attempts {
            println!("\n=== Run attempt {} ===", attempt);
            let run = match run_command(&argv, &self.project_root, self.options.timeout).await {
                Ok(run) => run,
                Err(e @ HealError::Timeout(_)) => {
                    println!("Command timed out. Not modifying code. Consider increasing --timeout.");
                    return Ok(e.exit_code());
                }
                Err(e) => return Err(e),
            };
            info!(attempt, exit_code = run.exit_code, "Command finished");

            if run.succeeded() {
                println!("Command succeeded with no errors. Output:\n");
                if run.stdout.is_empty() {
                    println!("(no output)");
                } else {
                    print!("{}", run.stdout);
                    if !run.stdout.ends_with('\n') {
                        println!();
                    }
                }
                return Ok(0);
            }
            if run.stderr.trim().is_empty() {
                println!(
                    "Command exited with code {} but no error output. Not modifying code.",
                    run.exit_code
                );
                return Ok(run.exit_code);
            }

            println!("Command failed. Captured stderr:\n");
            println!("{}", run.stderr);

            if let Some(code) = self.fix_once(&run.stderr, console).await? {
                return Ok(code);
            }
        }

        println!(
            "Reached max attempts ({}) without success.",
            self.options.max_attempts
        );
        Ok(1)
    }

    /// Patch the file blamed by `stderr`. `Some(code)` ends the run.
    async fn fix_once(&self, stderr: &str, console: &mut dyn OperatorConsole) -> Result<Option<i32>> {
        let Some((target, _line)) = last_project_frame(stderr, &self.project_root) else {
            println!("Could not identify an in-project file from the traceback. Aborting.");
            return Ok(Some(1));
        };
        if !target.is_file() {
            println!("Target file not found: {}", target.display());
            return Ok(Some(1));
        }
        let source = match self.applier.read_target(&target) {
            Ok(source) if !source.trim().is_empty() => source,
            _ => {
                println!("Target file is empty or unreadable: {}", target.display());
                return Ok(Some(1));
            }
        };

        let Some(client) = &self.client else {
            println!("AI generation error: no API key configured. Aborting.");
            return Ok(Some(2));
        };
        let candidate = match client.generate_fix(&target, &source, stderr).await {
            Ok(candidate) => candidate,
            Err(HealError::EmptyResponse) => {
                println!("AI returned an empty fix. Aborting to avoid wiping your code.");
                return Ok(Some(3));
            }
            Err(e) => {
                println!("AI generation error: {}", e);
                return Ok(Some(2));
            }
        };

        if !self.options.auto_approve && !approve(&target, stderr, &candidate, console)? {
            println!("Fix declined, {} left unchanged.", target.display());
            return Ok(Some(1));
        }

        let backup = match self.applier.write_candidate(&target, &candidate) {
            Ok(backup) => backup,
            Err(e) => {
                println!("Fix not applied: {}", e);
                return Ok(Some(1));
            }
        };
        if let Verification::Invalid(reason) = self.applier.verify(&target, &candidate).await {
            warn!(file = %target.display(), %reason, "Applied fix does not pass the syntax check");
        }

        let rel = target.strip_prefix(&self.project_root).unwrap_or(&target);
        println!(
            "Wrote AI-corrected code to {} (backup {}). Re-running...",
            rel.display(),
            backup.display()
        );
        Ok(None)
    }
}

fn approve(
    target: &Path,
    error_text: &str,
    candidate: &str,
    console: &mut dyn OperatorConsole,
) -> Result<bool> {
    terminal::render_approval_prompt(target, error_text, candidate);
    loop {
        match terminal::ask_decision(console)? {
            ApprovalDecision::Yes => return Ok(true),
            ApprovalDecision::No => return Ok(false),
            ApprovalDecision::Details => terminal::render_details(candidate),
        }
    }
}
