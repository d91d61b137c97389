mod check;
mod run;

pub use check::CheckCommand;
pub use run::RunCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// tether - service registration that survives reconnects
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Register this process and keep the registration alive.
    Run(RunCommand),

    /// Validate a configuration file and show the resolved registration.
    Check(CheckCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Check(cmd) => cmd.execute(),
        }
    }
}

/// Load a configuration file, failing with a readable message if it is missing.
fn load_config(path: &str) -> Result<tether_core::LifecycleConfig> {
    let config_path = std::path::Path::new(path);
    if !config_path.exists() {
        anyhow::bail!("Configuration file not found: {}", path);
    }
    Ok(tether_core::LifecycleConfig::from_file(config_path)?)
}
