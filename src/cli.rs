//! Command-line entrypoint wiring.

use crate::config::types::LaunchConfiguration;
use crate::orchestrator;
use anyhow::Result;
use clap::Parser;

/// Launch an application inside a sandbox host with coordinated helper
/// services. Configuration comes from `BOLTHOLE_*` environment variables;
/// the command line is passed through to the contained application.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Arguments passed through to the contained application
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub app_args: Vec<String>,
}

/// Resolve the configuration and run one sandbox session; returns the exit
/// code the launcher should terminate with.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = LaunchConfiguration::from_env(cli.app_args)?;
    let code = orchestrator::run(&config)?;
    Ok(code)
}
