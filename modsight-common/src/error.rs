use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading configuration or setting up logging.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Config file {} does not exist", .path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("Failed to read config file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON5 syntax or schema error; `path` is `None` for in-memory content.
    #[error("Failed to parse config{}: {message}", in_file(.path))]
    ConfigParse {
        path: Option<PathBuf>,
        message: String,
    },

    #[error("Logging error: {0}")]
    Logging(String),
}

fn in_file(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" {}", p.display()))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;
