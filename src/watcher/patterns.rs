//! Detected error records and Python traceback parsing.

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A single problem found by one detector cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub source_file: Option<PathBuf>,
    pub line: Option<usize>,
    pub timestamp: DateTime<Local>,
    /// Server or log component the error belongs to
    pub component: Option<String>,
    /// Extra text for the prompt: stderr tail, raw log record, ...
    pub context: Option<String>,
    /// Stable identity used to suppress repeats across cycles
    #[serde(skip)]
    pub fingerprint: String,
}

impl DetectedError {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            source_file: None,
            line: None,
            timestamp: Local::now(),
            component: None,
            context: None,
            fingerprint: String::new(),
        }
    }

    pub fn with_location(mut self, file: impl Into<PathBuf>, line: Option<usize>) -> Self {
        self.source_file = Some(file.into());
        self.line = line;
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    /// Error text handed to the patch prompt.
    pub fn error_text(&self) -> String {
        let mut text = format!("{}: {}", self.kind, self.message);
        if let Some(file) = &self.source_file {
            text.push_str(&format!("\nFile: {}", file.display()));
            if let Some(line) = self.line {
                text.push_str(&format!(", line {}", line));
            }
        }
        if let Some(context) = &self.context {
            text.push('\n');
            text.push_str(context);
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyntaxError,
    RuntimeError,
    ProcessCrash,
    LogError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::ProcessCrash => "process_crash",
            ErrorKind::LogError => "log_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Handling tier: critical and high share the first tier.
    pub fn tier(&self) -> u8 {
        match self {
            Severity::Critical | Severity::High => 0,
            Severity::Medium => 1,
            Severity::Low => 2,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Unknown,
}

pub fn detect_language(file_path: &Path) -> Language {
    match file_path.extension().and_then(|e| e.to_str()) {
        Some("py") | Some("pyw") => Language::Python,
        _ => Language::Unknown,
    }
}

static PYTHON_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"File "([^"]+)", line (\d+)(?:, in (.+))?"#).expect("valid traceback regex")
});

const EXCLUDED_SEGMENTS: &[&str] = &["site-packages", "dist-packages", "__pycache__"];

/// One `File "...", line N, in fn` frame of a Python traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackFrame {
    pub file: PathBuf,
    pub line: usize,
    pub function: Option<String>,
}

pub fn parse_traceback(text: &str) -> Vec<TracebackFrame> {
    PYTHON_FRAME
        .captures_iter(text)
        .filter_map(|caps| {
            Some(TracebackFrame {
                file: PathBuf::from(caps.get(1)?.as_str()),
                line: caps.get(2)?.as_str().parse().ok()?,
                function: caps.get(3).map(|m| m.as_str().trim().to_string()),
            })
        })
        .collect()
}

/// Resolve `frame` to a file inside `root`, or `None` for library/external frames.
pub fn project_path(frame: &TracebackFrame, root: &Path) -> Option<PathBuf> {
    if frame.file.components().any(|c| match c {
        Component::Normal(seg) => EXCLUDED_SEGMENTS.iter().any(|ex| seg == *ex),
        _ => false,
    }) {
        return None;
    }
    // "<frozen importlib._bootstrap>", "<string>", ...
    if frame.file.to_string_lossy().starts_with('<') {
        return None;
    }

    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let candidate = if frame.file.is_absolute() {
        frame.file.clone()
    } else {
        root.join(&frame.file)
    };
    let candidate = candidate.canonicalize().unwrap_or(candidate);

    candidate.starts_with(&root).then_some(candidate)
}

/// The deepest in-project frame of a traceback; that is where the fix goes.
pub fn last_project_frame(text: &str, root: &Path) -> Option<(PathBuf, usize)> {
    parse_traceback(text)
        .iter()
        .rev()
        .find_map(|frame| project_path(frame, root).map(|path| (path, frame.line)))
}

/// Last non-empty line of a traceback, usually `ExceptionType: message`.
pub fn exception_summary(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
