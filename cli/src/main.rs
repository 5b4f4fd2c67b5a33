// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Provisioner CLI
//!
//! The `aegis-provisioner` binary runs dynamic block-storage provisioning:
//! claim binding, volume lifecycle, attach/detach and node mounting, with
//! cloud credentials obtained through identity federation.
//!
//! ## Commands
//!
//! - `aegis-provisioner run -f volumes.yaml` - Run the control plane and node agents
//! - `aegis-provisioner credentials check|principals` - Exercise the credential broker
//! - `aegis-provisioner config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use aegis_provisioner::commands::{self, ConfigCommand, CredentialsCommand, RunCommand};
use aegis_provisioner_core::domain::config::ProvisionerConfig;

/// AEGIS Provisioner - Dynamic block storage for the AEGIS cluster
#[derive(Parser)]
#[command(name = "aegis-provisioner")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_PROVISIONER_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(long, global = true, env = "AEGIS_PROVISIONER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the provisioning control plane
    #[command(name = "run")]
    Run(RunCommand),

    /// Federated credential operations
    #[command(name = "credentials")]
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A broken config is reported by the command itself
    let observability = ProvisionerConfig::load_or_default(cli.config.clone())
        .map(|config| config.spec.observability)
        .unwrap_or_default();
    let level = cli.log_level.unwrap_or(observability.log_level);
    init_logging(&level, &observability.log_format)?;

    match cli.command {
        Commands::Run(command) => commands::run::execute(command, cli.config).await,
        Commands::Credentials { command } => {
            commands::credentials::handle_command(command, cli.config).await
        }
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
