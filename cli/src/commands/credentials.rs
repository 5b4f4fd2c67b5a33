// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Federated credential commands
//!
//! Commands: check, principals

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

use aegis_provisioner_core::domain::config::ProvisionerConfig;
use aegis_provisioner_core::domain::credential::PrincipalId;
use aegis_provisioner_core::infrastructure::event_bus::EventBus;

use crate::runtime::build_broker;

#[derive(Subcommand)]
pub enum CredentialsCommand {
    /// Exchange the identity token for a principal and report the result
    Check {
        /// Principal to exchange for (default: the cloud principal)
        #[arg(short, long)]
        principal: Option<String>,

        /// Use a self-signed identity token (simulated cloud only)
        #[arg(long)]
        dev_identity: bool,
    },

    /// List configured principals and their trust conditions
    Principals,
}

pub async fn handle_command(
    command: CredentialsCommand,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = ProvisionerConfig::load_or_default(config_path)
        .context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    match command {
        CredentialsCommand::Check {
            principal,
            dev_identity,
        } => check(&config, principal, dev_identity).await,
        CredentialsCommand::Principals => principals(&config),
    }
}

async fn check(config: &ProvisionerConfig, principal: Option<String>, dev_identity: bool) -> Result<()> {
    let principal = PrincipalId::new(principal.unwrap_or_else(|| config.spec.cloud.principal.clone()));
    let broker = build_broker(config, dev_identity, Arc::new(EventBus::with_default_capacity()))?;

    println!("Exchanging identity token for principal {}...", principal.as_str().bold());
    let credential = broker
        .get_credential(&principal)
        .await
        .with_context(|| format!("Credential exchange failed for principal '{}'", principal))?;

    let remaining = credential.expires_at - chrono::Utc::now();
    println!("{}", "✓ Credential issued".green());
    println!("  Principal: {}", credential.principal);
    println!("  Issued at: {}", credential.issued_at.to_rfc3339());
    println!("  Expires at: {}", credential.expires_at.to_rfc3339());
    println!("  Valid for: {}s", remaining.num_seconds());

    Ok(())
}

fn principals(config: &ProvisionerConfig) -> Result<()> {
    println!("{}", "Configured principals:".bold());
    for principal in &config.spec.federation.principals {
        let marker = if principal.name == config.spec.cloud.principal {
            " (cloud)".cyan().to_string()
        } else {
            String::new()
        };
        println!("  {}{}", principal.name.bold(), marker);
        println!("    role: {}", principal.role);
        println!("    subject: {}", principal.subject);
        println!("    audience: {}", principal.audience);
        if !principal.scopes.is_empty() {
            println!("    scopes: {}", principal.scopes.join(" "));
        }
    }
    Ok(())
}
