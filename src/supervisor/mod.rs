//! Process Supervisor - owns the long-lived server children
//!
//! Each child runs in its own process group with stdout/stderr appended to
//! `<output_dir>/<name>.stdout.log` and `<name>.stderr.log`. The healer pauses
//! every group while a fix is being negotiated and resumes them afterwards.

pub mod signals;

use crate::error::{HealError, Result};
use serde::Serialize;
use signals::{signal_group, GroupSignal};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 20;

/// A registered child process and its runtime state.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub name: String,
    pub launch_command: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub port: Option<u16>,
    pub running: bool,
    pub paused: bool,
    pid: Option<u32>,
    handle: Option<Child>,
    stderr_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub running: bool,
    pub paused: bool,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

/// Emitted by `reap_exited` for a child that died on its own.
#[derive(Debug, Clone, Serialize)]
pub struct ExitReport {
    pub name: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr_tail: String,
}

impl ExitReport {
    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(sig)) => format!("killed by signal {}", sig),
            _ => "exited".to_string(),
        }
    }
}

/// Result of a bulk operation; failures never abort the iteration.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkOutcome {
    pub changed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct ProcessSupervisor {
    entries: Mutex<Vec<SupervisedProcess>>,
    output_dir: PathBuf,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(output_dir: impl Into<PathBuf>, stop_grace: Duration) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            entries: Mutex::new(Vec::new()),
            output_dir,
            stop_grace,
        })
    }

    pub fn stdout_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.stdout.log", name))
    }

    pub fn stderr_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.stderr.log", name))
    }

    /// Register (or replace) a process descriptor. A live child owned by a
    /// replaced descriptor is stopped first.
    pub async fn register(
        &self,
        name: &str,
        launch_command: Vec<String>,
        working_directory: Option<PathBuf>,
        port: Option<u16>,
    ) -> Result<()> {
        if launch_command.is_empty() {
            return Err(HealError::Configuration(format!(
                "Empty launch command for '{}'",
                name
            )));
        }

        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
            if existing.handle.is_some() {
                info!(process = name, "Replacing registered process, stopping old child");
                stop_entry(existing, self.stop_grace).await;
            }
            existing.launch_command = launch_command;
            existing.working_directory = working_directory;
            existing.port = port;
            return Ok(());
        }

        entries.push(SupervisedProcess {
            name: name.to_string(),
            launch_command,
            working_directory,
            port,
            running: false,
            paused: false,
            pid: None,
            handle: None,
            stderr_offset: 0,
        });
        Ok(())
    }

    pub async fn names(&self) -> Vec<String> {
        self.entries.lock().await.iter().map(|e| e.name.clone()).collect()
    }

    /// Spawn the child. Returns `Ok(false)` if it is already running.
    pub async fn start(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let entry = find_entry(&mut entries, name)?;

        if entry.running {
            return Ok(false);
        }

        let stdout_path = self.stdout_path(name);
        let stderr_path = self.stderr_path(name);
        let launch_failure = |reason: String| HealError::LaunchFailure {
            name: name.to_string(),
            reason,
        };

        let stdout = open_append(&stdout_path).map_err(|e| launch_failure(e.to_string()))?;
        let stderr = open_append(&stderr_path).map_err(|e| launch_failure(e.to_string()))?;
        let stderr_offset = stderr.metadata().map(|m| m.len()).unwrap_or(0);

        let (program, args) = entry
            .launch_command
            .split_first()
            .ok_or_else(|| launch_failure("empty command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(cwd) = &entry.working_directory {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| launch_failure(e.to_string()))?;
        let pid = child.id();

        entry.handle = Some(child);
        entry.pid = pid;
        entry.running = true;
        entry.paused = false;
        entry.stderr_offset = stderr_offset;

        info!(process = name, pid = ?pid, "Started process");
        Ok(true)
    }

    /// Suspend the process group. No-op when not running or already paused.
    pub async fn pause(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let entry = find_entry(&mut entries, name)?;
        pause_entry(entry)
    }

    /// Continue a suspended process group. No-op when not paused.
    pub async fn resume(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let entry = find_entry(&mut entries, name)?;
        resume_entry(entry)
    }

    /// Terminate, wait out the grace period, then kill. Always leaves the
    /// entry stopped and unpaused.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let entry = find_entry(&mut entries, name)?;
        Ok(stop_entry(entry, self.stop_grace).await)
    }

    pub async fn pause_all(&self) -> BulkOutcome {
        let mut entries = self.entries.lock().await;
        let mut outcome = BulkOutcome::default();
        for entry in entries.iter_mut() {
            match pause_entry(entry) {
                Ok(true) => outcome.changed.push(entry.name.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(process = %entry.name, error = %e, "Failed to pause process");
                    outcome.failed.push((entry.name.clone(), e.to_string()));
                }
            }
        }
        outcome
    }

    pub async fn resume_all(&self) -> BulkOutcome {
        let mut entries = self.entries.lock().await;
        let mut outcome = BulkOutcome::default();
        for entry in entries.iter_mut() {
            match resume_entry(entry) {
                Ok(true) => outcome.changed.push(entry.name.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(process = %entry.name, error = %e, "Failed to resume process");
                    outcome.failed.push((entry.name.clone(), e.to_string()));
                }
            }
        }
        outcome
    }

    pub async fn stop_all(&self) -> BulkOutcome {
        let mut entries = self.entries.lock().await;
        let mut outcome = BulkOutcome::default();
        for entry in entries.iter_mut() {
            if stop_entry(entry, self.stop_grace).await {
                outcome.changed.push(entry.name.clone());
            }
        }
        outcome
    }

    /// Start every registered process that is not running.
    pub async fn start_all(&self) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for name in self.names().await {
            match self.start(&name).await {
                Ok(true) => outcome.changed.push(name),
                Ok(false) => {}
                Err(e) => {
                    warn!(process = %name, error = %e, "Failed to start process");
                    outcome.failed.push((name, e.to_string()));
                }
            }
        }
        outcome
    }

    /// Snapshot in registration order.
    pub async fn status(&self) -> Vec<ProcessStatus> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| ProcessStatus {
                name: e.name.clone(),
                running: e.running,
                paused: e.paused,
                pid: e.pid,
                port: e.port,
            })
            .collect()
    }

    /// Collect every running child that has exited since the last poll.
    pub async fn reap_exited(&self) -> Vec<ExitReport> {
        let mut entries = self.entries.lock().await;
        let mut reports = Vec::new();

        for entry in entries.iter_mut().filter(|e| e.running) {
            let Some(child) = entry.handle.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    #[cfg(unix)]
                    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                    #[cfg(not(unix))]
                    let signal = None;

                    let stderr_tail =
                        read_tail_from(&self.stderr_path(&entry.name), entry.stderr_offset)
                            .unwrap_or_default();

                    reports.push(ExitReport {
                        name: entry.name.clone(),
                        pid: entry.pid,
                        exit_code: status.code(),
                        signal,
                        stderr_tail,
                    });

                    entry.handle = None;
                    entry.running = false;
                    entry.paused = false;
                    entry.pid = None;
                }
                Ok(None) => {}
                Err(e) => warn!(process = %entry.name, error = %e, "Liveness check failed"),
            }
        }

        reports
    }
}

fn find_entry<'a>(
    entries: &'a mut [SupervisedProcess],
    name: &str,
) -> Result<&'a mut SupervisedProcess> {
    entries
        .iter_mut()
        .find(|e| e.name == name)
        .ok_or_else(|| HealError::NotRegistered(name.to_string()))
}

fn child_exited(entry: &mut SupervisedProcess) -> bool {
    match entry.handle.as_mut() {
        Some(child) => !matches!(child.try_wait(), Ok(None)),
        None => true,
    }
}

fn pause_entry(entry: &mut SupervisedProcess) -> Result<bool> {
    if !entry.running || entry.paused || child_exited(entry) {
        return Ok(false);
    }
    let Some(pid) = entry.pid else {
        return Ok(false);
    };
    if signal_group(pid, GroupSignal::Stop)? {
        entry.paused = true;
        debug!(process = %entry.name, pid, "Paused process group");
        Ok(true)
    } else {
        Ok(false)
    }
}

fn resume_entry(entry: &mut SupervisedProcess) -> Result<bool> {
    if !entry.running || !entry.paused {
        return Ok(false);
    }
    let Some(pid) = entry.pid else {
        entry.paused = false;
        return Ok(false);
    };
    signal_group(pid, GroupSignal::Continue)?;
    entry.paused = false;
    debug!(process = %entry.name, pid, "Resumed process group");
    Ok(true)
}

async fn stop_entry(entry: &mut SupervisedProcess, grace: Duration) -> bool {
    let had_child = entry.handle.is_some();

    if let Some(mut child) = entry.handle.take() {
        if matches!(child.try_wait(), Ok(None)) {
            match entry.pid {
                Some(pid) => {
                    if let Err(e) = signal_group(pid, GroupSignal::Terminate) {
                        warn!(process = %entry.name, error = %e, "SIGTERM failed, killing");
                        let _ = child.start_kill();
                    }
                    // a stopped group only acts on SIGTERM once continued
                    if entry.paused {
                        let _ = signal_group(pid, GroupSignal::Continue);
                    }
                }
                None => {
                    let _ = child.start_kill();
                }
            }

            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(process = %entry.name, "Did not exit within grace period, killing");
                if let Some(pid) = entry.pid {
                    let _ = signal_group(pid, GroupSignal::Kill);
                }
                let _ = child.kill().await;
            }
        }
        info!(process = %entry.name, "Stopped process");
    }

    entry.running = false;
    entry.paused = false;
    entry.pid = None;
    had_child
}

fn open_append(path: &Path) -> std::io::Result<fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Last lines written to `path` after byte `offset`.
fn read_tail_from(path: &Path, offset: u64) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(offset.min(len)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Ok(lines[start..].join("\n"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> ProcessSupervisor {
        ProcessSupervisor::new(dir.path().join("out"), Duration::from_secs(2)).unwrap()
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[cfg(target_os = "linux")]
    fn proc_state(pid: u32) -> char {
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap();
        let after_comm = stat.rsplit(')').next().unwrap();
        after_comm.trim_start().chars().next().unwrap()
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_same_pid() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("sleeper", argv(&["sleep", "60"]), None, None)
            .await
            .unwrap();
        assert!(sup.start("sleeper").await.unwrap());
        let pid = sup.status().await[0].pid.unwrap();

        assert!(sup.pause("sleeper").await.unwrap());
        assert!(!sup.pause("sleeper").await.unwrap());
        let paused = &sup.status().await[0];
        assert!(paused.running && paused.paused);
        #[cfg(target_os = "linux")]
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(proc_state(pid), 'T');
        }

        assert!(sup.resume("sleeper").await.unwrap());
        let resumed = &sup.status().await[0];
        assert!(resumed.running);
        assert!(!resumed.paused);
        assert_eq!(resumed.pid, Some(pid));

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_paused_process_clears_state() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("sleeper", argv(&["sleep", "60"]), None, None)
            .await
            .unwrap();
        sup.start("sleeper").await.unwrap();
        sup.pause("sleeper").await.unwrap();

        assert!(sup.stop("sleeper").await.unwrap());
        let status = &sup.status().await[0];
        assert!(!status.running);
        assert!(!status.paused);
        assert_eq!(status.pid, None);

        // stopping again is harmless
        assert!(!sup.stop("sleeper").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_registered() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        assert!(matches!(
            sup.pause("ghost").await,
            Err(HealError::NotRegistered(_))
        ));
        assert!(matches!(
            sup.start("ghost").await,
            Err(HealError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_for_missing_binary() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register(
            "broken",
            argv(&["/definitely/not/a/binary-healwatch"]),
            None,
            None,
        )
        .await
        .unwrap();
        assert!(matches!(
            sup.start("broken").await,
            Err(HealError::LaunchFailure { .. })
        ));
        assert!(!sup.status().await[0].running);
    }

    #[tokio::test]
    async fn test_pause_on_stopped_entry_is_noop() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("idle", argv(&["sleep", "60"]), None, None)
            .await
            .unwrap();
        assert!(!sup.pause("idle").await.unwrap());
        assert!(!sup.resume("idle").await.unwrap());
    }

    #[tokio::test]
    async fn test_reap_reports_crash_with_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register(
            "crasher",
            argv(&["sh", "-c", "echo 'boom at startup' >&2; exit 3"]),
            None,
            Some(5000),
        )
        .await
        .unwrap();
        sup.start("crasher").await.unwrap();

        let mut reports = Vec::new();
        for _ in 0..50 {
            reports = sup.reap_exited().await;
            if !reports.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].exit_code, Some(3));
        assert!(reports[0].stderr_tail.contains("boom at startup"));
        assert_eq!(reports[0].describe(), "exited with code 3");
        assert!(!sup.status().await[0].running);
        assert!(sup.reap_exited().await.is_empty());
    }

    #[tokio::test]
    async fn test_reregister_stops_live_child() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("svc", argv(&["sleep", "60"]), None, None)
            .await
            .unwrap();
        sup.start("svc").await.unwrap();

        sup.register("svc", argv(&["sleep", "30"]), None, Some(9000))
            .await
            .unwrap();
        let status = sup.status().await;
        assert_eq!(status.len(), 1);
        assert!(!status[0].running);
        assert_eq!(status[0].port, Some(9000));
    }

    #[tokio::test]
    async fn test_bulk_operations_follow_registration_order() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        for name in ["b", "a", "c"] {
            sup.register(name, argv(&["sleep", "60"]), None, None)
                .await
                .unwrap();
        }
        let started = sup.start_all().await;
        assert_eq!(started.changed, vec!["b", "a", "c"]);

        let paused = sup.pause_all().await;
        assert_eq!(paused.changed, vec!["b", "a", "c"]);
        assert!(sup.status().await.iter().all(|s| s.paused));

        let resumed = sup.resume_all().await;
        assert_eq!(resumed.changed.len(), 3);

        let stopped = sup.stop_all().await;
        assert_eq!(stopped.changed.len(), 3);
        assert!(sup.status().await.iter().all(|s| !s.running && !s.paused));
    }
}
