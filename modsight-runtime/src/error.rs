//! Error types for the runtime framework.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised while bootstrapping a service or stopping its workers.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Unreadable file or malformed JSON5.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Well-formed configuration with values the service rejects.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    /// One or more workers panicked or did not stop in time.
    #[error("Worker error: {0}")]
    Worker(String),
}

impl RuntimeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }
}

impl From<modsight_common::Error> for RuntimeError {
    fn from(err: modsight_common::Error) -> Self {
        use modsight_common::Error;

        match err {
            Error::ConfigNotFound { path } => Self::ConfigNotFound {
                path: path.display().to_string(),
            },
            e @ (Error::ConfigRead { .. } | Error::ConfigParse { .. }) => {
                Self::ConfigParse(e.to_string())
            }
            Error::Logging(msg) => Self::Logging(msg),
        }
    }
}
