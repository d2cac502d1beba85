//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::LoggingConfig;
use crate::error::Result;

/// Trait for service configuration types.
///
/// Implement this trait for a service's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use modsight_runtime::{LoggingConfig, RuntimeConfig, RuntimeError};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyConfig {
///     pub logging: LoggingConfig,
///     pub tick_ms: u64,
/// }
///
/// impl RuntimeConfig for MyConfig {
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn validate(&self) -> modsight_runtime::Result<()> {
///         if self.tick_ms == 0 {
///             return Err(RuntimeError::validation("tick_ms must be positive"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait RuntimeConfig: Sized + DeserializeOwned {
    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load a JSON5 file and validate it.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = modsight_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }
}
