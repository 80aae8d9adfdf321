use crate::protocol::config::parse_config;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rktm", version, about = "RKTM telemetry manager CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the telemetry manager with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a config file and print the effective configuration
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Render the config at `path` with all defaults filled in.
pub fn effective_config(path: &PathBuf) -> anyhow::Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg = parse_config(&content)?;
    Ok(serde_yaml::to_string(&cfg)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_and_check() {
        let cli = Cli::try_parse_from(["rktm", "start", "--config", "rktm.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { config } if config == PathBuf::from("rktm.yaml")));
        let cli = Cli::try_parse_from(["rktm", "check", "-c", "rktm.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Check { .. }));
        assert!(Cli::try_parse_from(["rktm", "start"]).is_err());
    }
}
