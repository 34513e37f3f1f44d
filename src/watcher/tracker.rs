//! Source Tracker - refuses to overwrite a file that changed after it was read
//!
//! The healer records a digest of the file content it sent to the AI. Before
//! the approved candidate is written, the file is re-read and compared; an
//! edit made in the meantime aborts the write instead of being clobbered.

use crate::error::{HealError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Hex SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, Default)]
pub struct SourceTracker {
    digests: Arc<RwLock<HashMap<PathBuf, String>>>,
}

impl SourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the content a fix was generated from.
    pub fn record_read(&self, path: &Path, content: &str) {
        if let Ok(mut digests) = self.digests.write() {
            digests.insert(canonical(path), content_digest(content.as_bytes()));
        }
    }

    /// `Ok(())` when the file still holds the recorded content (or was never recorded).
    pub fn check_staleness(&self, path: &Path) -> Result<()> {
        let key = canonical(path);
        let recorded = {
            let digests = self.digests.read().map_err(|_| {
                HealError::Configuration("Failed to acquire tracker lock".to_string())
            })?;
            digests.get(&key).cloned()
        };

        let Some(recorded) = recorded else {
            return Ok(());
        };

        let current = match std::fs::read(&key) {
            Ok(bytes) => content_digest(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HealError::FileStale {
                    path: key.display().to_string(),
                });
            }
            Err(e) => return Err(HealError::Io(e)),
        };

        if current != recorded {
            return Err(HealError::FileStale {
                path: key.display().to_string(),
            });
        }
        Ok(())
    }

    pub fn forget(&self, path: &Path) {
        if let Ok(mut digests) = self.digests.write() {
            digests.remove(&canonical(path));
        }
    }

}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
