#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)] // TODO(deps-001): remove once transitive dependencies converge.

//! Command-line entry point for the Slipstream server.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;
use slipstream_server::server;

/// Main CLI structure for the Slipstream server
#[derive(Debug, Parser)]
#[command(name = "slipstream-server")]
#[command(about = "WebSocket streaming orchestrator for upstream LLM providers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the server
    Serve {
        /// Port to bind, overriding the configuration file and environment.
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a `yaml`/`yml` or `json` configuration file. Defaults are used when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Loads configuration and runs the server until shutdown.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, port)
        .map_err(|err| anyhow::anyhow!(err.to_string()))
        .context("failed to load configuration")?;
    server::run(resolved).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_accepts_port_and_config() {
        let cli = Cli::try_parse_from([
            "slipstream-server",
            "serve",
            "--port",
            "8080",
            "--config",
            "config.yaml",
        ])
        .unwrap();
        let Commands::Serve { port, config } = cli.command;
        assert_eq!(port, Some(8080));
        assert_eq!(config, Some(PathBuf::from("config.yaml")));
    }

    #[test]
    fn serve_flags_are_optional() {
        let cli = Cli::try_parse_from(["slipstream-server", "serve"]).unwrap();
        let Commands::Serve { port, config } = cli.command;
        assert_eq!(port, None);
        assert_eq!(config, None);
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert!(Cli::try_parse_from(["slipstream-server", "serve", "--port", "99999"]).is_err());
    }
}
