//! Log Monitor - flags `type == "error"` records in the category event logs.

use crate::events::{tail_file, LogEntry};
use crate::watcher::patterns::{DetectedError, ErrorKind, Severity};
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct LogMonitor {
    dirs: Vec<PathBuf>,
    tail_lines: usize,
}

impl LogMonitor {
    pub fn new(dirs: Vec<PathBuf>, tail_lines: usize) -> Self {
        Self { dirs, tail_lines }
    }

    /// Every `*_events.log` currently present in the watched directories.
    pub fn log_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in &self.dirs {
            let pattern = dir.join("*_events.log");
            match glob::glob(&pattern.to_string_lossy()) {
                Ok(paths) => files.extend(paths.flatten()),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Bad log glob"),
            }
        }
        files.sort();
        files
    }

    /// Error records among the last `tail_lines` lines of each log file.
    pub fn scan(&self) -> Vec<DetectedError> {
        let mut errors = Vec::new();

        for path in self.log_files() {
            let lines = match tail_file(&path, self.tail_lines) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Could not read event log");
                    continue;
                }
            };

            for raw in lines {
                let Ok(entry) = serde_json::from_str::<LogEntry>(&raw) else {
                    debug!(file = %path.display(), "Skipping malformed log line");
                    continue;
                };
                if !entry.is_error() {
                    continue;
                }

                let component = entry.field("component").unwrap_or("unknown").to_string();
                let message = entry
                    .field("error_message")
                    .or_else(|| entry.field("description"))
                    .unwrap_or("error recorded without message")
                    .to_string();

                errors.push(
                    DetectedError::new(ErrorKind::LogError, Severity::Medium, message)
                        .with_component(component)
                        .with_context(raw.clone())
                        .with_fingerprint(format!("log:{}:{}", path.display(), raw)),
                );
            }
        }

        errors
    }
}
