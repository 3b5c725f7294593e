//! SQLGate launcher
//!
//! `serve` speaks JSON-RPC on stdin/stdout, so every log line goes to stderr
//! or the rotating log file, never stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlgate::config::default_config_path;
use sqlgate::GatewayConfig;
use sqlgate_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(
    name = "sqlgate",
    version,
    about = "Validated, bounded and audited SQL execution for LLM callers"
)]
struct Cli {
    /// Configuration file (default: $SQLGATE_HOME/sqlgate.toml)
    #[arg(short, long, global = true, env = "SQLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the gateway over stdio (JSON-RPC 2.0 / MCP)
    Serve,

    /// Validate a query against the configured policy without running it
    Validate {
        /// SQL text to validate
        sql: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the tables and columns callers may query
    Schema {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load and validate the configuration file
    CheckConfig {
        /// Also open the database and query every allowed table
        #[arg(long)]
        connect: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logging(LogConfig {
        app_name: "sqlgate",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {:#}", e);
            None
        }
    };

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = GatewayConfig::load(&config_path)?;

    let ok = match cli.command {
        Commands::Serve => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            runtime.block_on(cli::serve::run(config))?;
            true
        }
        Commands::Validate { sql, json } => cli::validate::run(&config, &sql, json)?,
        Commands::Schema { json } => {
            cli::schema::run(&config, json)?;
            true
        }
        Commands::CheckConfig { connect, json } => {
            cli::check::run(&config, &config_path, connect, json)?
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_validate() {
        let cli = Cli::try_parse_from([
            "sqlgate",
            "--config",
            "gateway.toml",
            "validate",
            "SELECT 1",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gateway.toml")));
        assert!(matches!(
            cli.command,
            Commands::Validate { ref sql, json: true } if sql == "SELECT 1"
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sqlgate", "check-config", "--connect", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::CheckConfig {
                connect: true,
                json: false
            }
        ));
    }
}
