//! Command line shared by tick-driven services.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug, Clone)]
#[command(about = "Tick-driven ModSight service")]
pub struct RuntimeArgs {
    /// JSON5 configuration file; relative paths inside it resolve against its directory.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Tracing filter that replaces `logging.level` (e.g. `debug`, `modsight_master=trace`).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl RuntimeArgs {
    /// Parse the process arguments, using `default_config` when `--config` is absent.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        Self::try_parse_with_default(default_config, std::env::args_os())
            .unwrap_or_else(|e| e.exit())
    }

    /// Parse `args` (program name first), using `default_config` when `--config` is absent.
    pub fn try_parse_with_default<I, T>(
        default_config: &'static str,
        args: I,
    ) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .try_get_matches_from(args)?;
        Self::from_arg_matches(&matches)
    }
}
