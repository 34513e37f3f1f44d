//! Event Log Writer - append-only JSON-lines logs per category
//!
//! Each category owns one file, `<category>_events.log`, in the logging
//! directory. Every record carries `timestamp` and `type`; the error detector
//! tails these files looking for `type == "error"` records.

use crate::error::{HealError, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Sensor,
    Error,
    Data,
}

impl LogCategory {
    pub const ALL: [LogCategory; 3] = [LogCategory::Sensor, LogCategory::Error, LogCategory::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Sensor => "sensor",
            LogCategory::Error => "error",
            LogCategory::Data => "data",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_events.log", self.as_str())
    }

    fn index(&self) -> usize {
        match self {
            LogCategory::Sensor => 0,
            LogCategory::Error => 1,
            LogCategory::Data => 2,
        }
    }
}

/// One record of a category log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub category: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogEntry {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.category == LogCategory::Error.as_str()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogStatus {
    pub log_dir: PathBuf,
    pub files: Vec<String>,
}

pub struct EventLogger {
    dir: PathBuf,
    // one lock per category so concurrent appends never interleave
    locks: [Mutex<()>; 3],
}

impl EventLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        })
    }

    pub fn path_for(&self, category: LogCategory) -> PathBuf {
        self.dir.join(category.file_name())
    }

    pub fn log_sensor_event(
        &self,
        event_type: &str,
        description: &str,
        extra: Map<String, Value>,
    ) -> Result<LogEntry> {
        let mut fields = Map::new();
        fields.insert("event_type".into(), Value::from(event_type));
        fields.insert("description".into(), Value::from(description));
        self.append(LogCategory::Sensor, merge(fields, extra))
    }

    pub fn log_error_event(
        &self,
        component: &str,
        error_message: &str,
        extra: Map<String, Value>,
    ) -> Result<LogEntry> {
        let mut fields = Map::new();
        fields.insert("component".into(), Value::from(component));
        fields.insert("error_message".into(), Value::from(error_message));
        self.append(LogCategory::Error, merge(fields, extra))
    }

    pub fn log_data_event(
        &self,
        component: &str,
        event_type: &str,
        description: &str,
        extra: Map<String, Value>,
    ) -> Result<LogEntry> {
        let mut fields = Map::new();
        fields.insert("component".into(), Value::from(component));
        fields.insert("event_type".into(), Value::from(event_type));
        fields.insert("description".into(), Value::from(description));
        self.append(LogCategory::Data, merge(fields, extra))
    }

    /// Append one record. `timestamp` and `type` are always set here.
    pub fn append(&self, category: LogCategory, mut fields: Map<String, Value>) -> Result<LogEntry> {
        fields.remove("timestamp");
        fields.remove("type");

        let entry = LogEntry {
            timestamp: Local::now().to_rfc3339(),
            category: category.as_str().to_string(),
            fields,
        };
        let line = serde_json::to_string(&entry)?;

        let _guard = self.locks[category.index()]
            .lock()
            .map_err(|_| HealError::Configuration("event log lock poisoned".to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(category))?;
        writeln!(file, "{}", line)?;

        Ok(entry)
    }

    /// Last `k` records of a category. Malformed lines are skipped.
    pub fn tail(&self, category: LogCategory, k: usize) -> Result<Vec<LogEntry>> {
        Ok(tail_file(&self.path_for(category), k)?
            .into_iter()
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }

    pub fn status(&self) -> LogStatus {
        LogStatus {
            log_dir: self.dir.clone(),
            files: LogCategory::ALL.iter().map(|c| c.file_name()).collect(),
        }
    }
}

fn merge(mut base: Map<String, Value>, extra: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in extra {
        base.entry(key).or_insert(value);
    }
    base
}

/// Last `k` non-empty raw lines of a file; a missing file yields nothing.
pub fn tail_file(path: &Path, k: usize) -> Result<Vec<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(k);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}
