use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// `logging` section shared by every service config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `"info"` or `"modsight_master=debug,info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Copy with `level` replacing the configured filter when present.
    pub fn with_level_override(&self, level: Option<&str>) -> Self {
        let mut config = self.clone();
        if let Some(level) = level {
            config.level = level.to_string();
        }
        config
    }
}

/// Read and deserialize a JSON5 file.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;

    json5::from_str(&content).map_err(|e| Error::ConfigParse {
        path: Some(path.to_path_buf()),
        message: e.to_string(),
    })
}

/// Deserialize JSON5 content held in memory.
pub fn parse_config<T: DeserializeOwned>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::ConfigParse {
        path: None,
        message: e.to_string(),
    })
}
