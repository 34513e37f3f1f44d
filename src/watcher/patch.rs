//! AI Patch Client - asks the provider for a full replacement of one file.

use crate::error::{HealError, Result};
use crate::providers::{CompletionRequest, Provider};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[a-zA-Z0-9_\-]*\n([\s\S]*?)```").expect("valid code block regex"));

pub struct PatchClient {
    provider: Arc<dyn Provider>,
    model: String,
    project_root: PathBuf,
}

impl PatchClient {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            model: model.into(),
            project_root: project_root.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> String {
        self.provider.info().display_name
    }

    pub fn build_prompt(&self, file_path: &Path, original_source: &str, error_text: &str) -> String {
        let rel = file_path
            .strip_prefix(&self.project_root)
            .unwrap_or(file_path)
            .display()
            .to_string();

        format!(
            "You are an expert Python engineer. Fix the error in the file below.\n\
             \n\
             Rules:\n\
             - Return ONLY the full corrected contents of {rel}.\n\
             - Do not add explanations, comments about the change, or markdown fences.\n\
             - Keep behavior unchanged except for what the fix requires.\n\
             \n\
             --- BEGIN ERROR OUTPUT ---\n\
             {error}\n\
             --- END ERROR OUTPUT ---\n\
             \n\
             --- BEGIN {rel} ---\n\
             {source}\n\
             --- END {rel} ---\n",
            rel = rel,
            error = error_text.trim_end(),
            source = original_source,
        )
    }

    /// Candidate replacement for `file_path`. Never returns an empty candidate.
    pub async fn generate_fix(
        &self,
        file_path: &Path,
        original_source: &str,
        error_text: &str,
    ) -> Result<String> {
        let prompt = self.build_prompt(file_path, original_source, error_text);
        info!(file = %file_path.display(), model = %self.model, "Requesting fix");

        let request = CompletionRequest::prompt(self.model.as_str(), prompt).with_temperature(0.2);

        let response = self.provider.complete(request).await.map_err(|e| match e {
            HealError::ProviderUnavailable(_) | HealError::GenerationFailure(_) => e,
            other => HealError::GenerationFailure(other.to_string()),
        })?;

        let candidate = extract_code(&response.content);
        if candidate.trim().is_empty() {
            warn!(file = %file_path.display(), "Provider returned an empty fix");
            return Err(HealError::EmptyResponse);
        }
        Ok(candidate)
    }
}

/// First fenced code block of a reply, else the trimmed reply.
pub fn extract_code(reply: &str) -> String {
    match CODE_BLOCK.captures(reply).and_then(|caps| caps.get(1)) {
        Some(block) => block.as_str().to_string(),
        None => reply.trim().to_string(),
    }
}
