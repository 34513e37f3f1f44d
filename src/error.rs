use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealError {
    #[error("Process '{0}' is not registered")]
    NotRegistered(String),

    #[error("Failed to launch '{name}': {reason}")]
    LaunchFailure { name: String, reason: String },

    #[error("AI provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("AI provider returned an empty fix")]
    EmptyResponse,

    #[error("Fix generation failed: {0}")]
    GenerationFailure(String),

    #[error("Signal delivery failed for pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("Command timed out after {0} seconds")]
    Timeout(u64),

    #[error("Invalid fix state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dialog error: {0}")]
    Dialog(String),

    #[error("File {path} has been modified since it was read for this fix.")]
    FileStale { path: String },
}

impl From<dialoguer::Error> for HealError {
    fn from(err: dialoguer::Error) -> Self {
        HealError::Dialog(err.to_string())
    }
}

impl HealError {
    /// Process exit code used by the command line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            HealError::ProviderUnavailable(_) | HealError::GenerationFailure(_) => 2,
            HealError::EmptyResponse => 3,
            HealError::Timeout(_) => 124,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, HealError>;
