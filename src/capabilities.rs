//! Startup capability negotiation. Everything optional is probed once here and
//! the rest of the program consults the record instead of probing again.

use crate::config::HealConfig;
use crate::providers::google::GoogleProvider;
use crate::providers::Provider;
use crate::supervisor::signals::suspend_supported;
use crate::watcher::patch::PatchClient;
use crate::watcher::syntax::{CommandSyntaxChecker, SyntaxRegistry};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Availability {
    Available,
    Unavailable(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Unavailable(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub process_suspend: Availability,
    pub ai_provider: Availability,
    pub external_syntax_checker: Availability,
    /// Model the patch client will ask, when there is one
    pub model: Option<String>,
}

impl Capabilities {
    pub fn print(&self) {
        println!("Process suspend:         {}", self.process_suspend);
        match &self.model {
            Some(model) => println!("AI provider:             {} [{}]", self.ai_provider, model),
            None => println!("AI provider:             {}", self.ai_provider),
        }
        println!("External syntax checker: {}", self.external_syntax_checker);
    }
}

pub struct Negotiated {
    pub capabilities: Capabilities,
    pub patch_client: Option<PatchClient>,
    pub syntax: Arc<SyntaxRegistry>,
}

pub async fn negotiate(config: &HealConfig, model_flag: Option<&str>) -> Negotiated {
    negotiate_with(config, model_flag, config.ai.resolve_api_key()).await
}

pub async fn negotiate_with(
    config: &HealConfig,
    model_flag: Option<&str>,
    api_key: Option<String>,
) -> Negotiated {
    let process_suspend = if suspend_supported() {
        Availability::Available
    } else {
        Availability::Unavailable("process-group signals need a Unix host".to_string())
    };

    let (ai_provider, patch_client) = match api_key {
        None => (
            Availability::Unavailable("GEMINI_API_KEY not set".to_string()),
            None,
        ),
        Some(key) => match GoogleProvider::new(key, &config.ai) {
            Ok(provider) => {
                let model = config.ai.resolve_model(model_flag);
                let provider: Arc<dyn Provider> = Arc::new(provider);
                (
                    Availability::Available,
                    Some(PatchClient::new(provider, model, config.project_root.clone())),
                )
            }
            Err(e) => (Availability::Unavailable(e.to_string()), None),
        },
    };

    let (external_syntax_checker, external) = match &config.syntax.command {
        None => (Availability::Unavailable("not configured".to_string()), None),
        Some(command) => match CommandSyntaxChecker::new(command) {
            Ok(checker) => match checker.probe().await {
                Ok(()) => (Availability::Available, Some(checker)),
                Err(e) => {
                    warn!(command = %command, error = %e, "External syntax checker unusable, using built-in");
                    (Availability::Unavailable(e.to_string()), None)
                }
            },
            Err(e) => (Availability::Unavailable(e.to_string()), None),
        },
    };

    let capabilities = Capabilities {
        process_suspend,
        ai_provider,
        external_syntax_checker,
        model: patch_client.as_ref().map(|c| c.model().to_string()),
    };
    info!(
        suspend = capabilities.process_suspend.is_available(),
        ai = capabilities.ai_provider.is_available(),
        external_syntax = capabilities.external_syntax_checker.is_available(),
        "Capabilities negotiated"
    );

    Negotiated {
        capabilities,
        patch_client,
        syntax: Arc::new(SyntaxRegistry::new(external)),
    }
}
