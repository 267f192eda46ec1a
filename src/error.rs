//! Error types for Muon

use thiserror::Error;

/// Result type alias for Muon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code used when a remote task reports failure
pub const TASK_FAILURE_EXIT_CODE: i32 = 2;

/// Exit code used when a task outcome could not be determined
pub const UNKNOWN_OUTCOME_EXIT_CODE: i32 = 3;

/// Errors that can occur in Muon
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Timed out after {0}s waiting for the browser login to complete")]
    LoginTimeout(u64),

    #[error("Login cancelled")]
    Cancelled,

    #[error("API error: {0}")]
    Api(String),

    #[error("Task failed: {0}. Contact your system administrator")]
    TaskFailed(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::TaskFailed(_) => TASK_FAILURE_EXIT_CODE,
            _ => 1,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
