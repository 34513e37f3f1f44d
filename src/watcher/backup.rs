use crate::error::{HealError, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};

/// Timestamped copies of files taken right before a fix overwrites them.
///
/// Backups are named `<file_name>.backup_<YYYYMMDD_HHMMSS>`; a `_<n>` suffix
/// is added only when two backups of the same file land in the same second.
#[derive(Debug, Clone)]
pub struct BackupStore {
    backup_dir: PathBuf,
}

impl BackupStore {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_name(file_name: &str, at: DateTime<Local>) -> String {
        format!("{}.backup_{}", file_name, at.format("%Y%m%d_%H%M%S"))
    }

    pub fn create_backup(&self, original: &Path) -> Result<PathBuf> {
        self.create_backup_at(original, Local::now())
    }

    pub fn create_backup_at(&self, original: &Path, at: DateTime<Local>) -> Result<PathBuf> {
        let file_name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                HealError::Configuration(format!("Cannot back up {}", original.display()))
            })?;

        fs::create_dir_all(&self.backup_dir)?;

        let base = Self::backup_name(&file_name, at);
        let mut backup_path = self.backup_dir.join(&base);
        let mut n = 1;
        while backup_path.exists() {
            backup_path = self.backup_dir.join(format!("{}_{}", base, n));
            n += 1;
        }

        fs::copy(original, &backup_path)?;
        Ok(backup_path)
    }
}
