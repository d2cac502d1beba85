//! ModSight Runtime Framework
//!
//! Common lifecycle plumbing for tick-driven ModSight services.
//!
//! # Overview
//!
//! This framework provides:
//! - [`RuntimeConfig`] trait for configuration loading and validation
//! - [`Runner`] for managing worker lifecycle (startup, cooperative shutdown, signal handling)
//! - [`TickTrigger`] and [`TickClock`] for periodic wake-ups
//! - [`ShutdownSignal`] / [`ShutdownListener`] for cooperative cancellation
//! - [`RuntimeArgs`] for common CLI argument parsing
//!
//! # Example
//!
//! ```ignore
//! use modsight_runtime::{Runner, RuntimeArgs, RuntimeConfig, TickClock, TickTrigger};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = RuntimeArgs::parse_with_default("service.json5");
//!     let config = MyConfig::load(&args.config)?;
//!
//!     let mut runner = Runner::new_with_args("service", &config, Some(&args))?;
//!
//!     let trigger = TickTrigger::new();
//!     let clock = TickClock::spawn(period, vec![trigger.clone()], runner.shutdown_listener());
//!     runner.track("clock", clock);
//!     runner.spawn_worker("worker", move |shutdown| my_worker(trigger, shutdown));
//!
//!     // Run until Ctrl+C
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
mod runner;
mod trigger;

pub use args::RuntimeArgs;
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use runner::Runner;
pub use trigger::{ShutdownListener, ShutdownSignal, TickClock, TickTrigger};

// Re-export commonly used types from modsight-common
pub use modsight_common::{LogFormat, LoggingConfig};
