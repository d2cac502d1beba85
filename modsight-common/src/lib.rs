//! Configuration and logging shared by the ModSight crates.
//!
//! - [`config`]: the `logging` config section and JSON5 loading
//! - [`error`]: load and logging errors

pub mod config;
pub mod error;

pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG`, when set, replaces `config.level`. An invalid configured
/// filter is an error rather than a silent fallback.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Logging(format!("invalid level '{}': {}", config.level, e)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_thread_names(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    installed.map_err(|e| Error::Logging(format!("subscriber already installed: {}", e)))
}
