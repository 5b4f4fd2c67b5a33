// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use aegis_provisioner_core::domain::config::{
    CloudBackendConfig, IdentityTokenConfig, ProvisionerConfig,
};

use crate::manifests::demo_manifests_path;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./aegis-provisioner.yaml)
        #[arg(short, long, default_value = "./aegis-provisioner.yaml")]
        output: PathBuf,

        /// Include examples and comments, plus demo volume manifests
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ProvisionerConfig::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AEGIS_PROVISIONER_CONFIG: {}",
            std::env::var("AEGIS_PROVISIONER_CONFIG")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./aegis-provisioner.yaml");
        println!("  4. ~/.aegis/provisioner.yaml");
        println!("  5. /etc/aegis/provisioner.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    let spec = &config.spec;
    println!("{}", "Cluster:".bold());
    println!("  Provisioner: {}", spec.cluster.provisioner_id);
    if spec.cluster.zones.is_empty() {
        println!("  Zones: {}", "(from storage classes)".dimmed());
    } else {
        println!("  Zones: {}", spec.cluster.zones.join(", "));
    }
    println!();

    println!("{}", "Federation:".bold());
    println!("  Issuer: {}", spec.federation.issuer);
    if let Some(endpoint) = &spec.federation.token_endpoint {
        println!("  Token endpoint: {}", endpoint);
    }
    match &spec.federation.identity_token {
        IdentityTokenConfig::File { path } => println!("  Identity token: file {}", path.display()),
        IdentityTokenConfig::Http { url, .. } => println!("  Identity token: http {}", url),
    }
    println!(
        "  Safety margin: {}",
        format_duration(spec.federation.safety_margin)
    );
    println!("  Principals: {}", spec.federation.principals.len());
    for principal in &spec.federation.principals {
        println!("    {} → {}", principal.name.bold(), principal.role);
        println!("      subject: {}", principal.subject);
        println!("      audience: {}", principal.audience);
    }
    println!();

    println!("{}", "Cloud:".bold());
    match &spec.cloud.backend {
        CloudBackendConfig::Http { endpoint } => println!("  Backend: http {}", endpoint),
        CloudBackendConfig::Simulated { settle_polls } => {
            println!("  Backend: simulated (settles after {} polls)", settle_polls)
        }
    }
    println!("  Principal: {}", spec.cloud.principal);
    println!("  Call timeout: {}", format_duration(spec.cloud.call_timeout));
    println!("  Max attempts: {}", spec.cloud.max_attempts);
    println!();

    println!("{}", "Controllers:".bold());
    println!("  Workers: {}", spec.controllers.workers);
    println!("  Resync: {}", format_duration(spec.controllers.resync_period));
    println!("  Attach timeout: {}", format_duration(spec.controllers.attach_timeout));
    println!();

    println!("{}", "Node agent:".bold());
    println!(
        "  Node: {}",
        spec.node.id.as_deref().unwrap_or("(not set)")
    );
    println!("  Device dir: {}", spec.node.device_dir.display());
    println!("  Max mount attempts: {}", spec.node.max_mount_attempts);
    println!();

    Ok(())
}

fn format_duration(duration: std::time::Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ProvisionerConfig::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/provisioner-with-examples.yaml")
    } else {
        include_str!("../../templates/provisioner-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    if with_examples {
        let manifests = demo_manifests_path(&output);
        std::fs::write(&manifests, include_str!("../../templates/volumes-example.yaml"))
            .with_context(|| format!("Failed to write manifests to {:?}", manifests))?;
        println!(
            "{}",
            format!("✓ Demo manifests generated: {}", manifests.display()).green()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_templates_parse_and_validate() {
        for template in [
            include_str!("../../templates/provisioner-minimal.yaml"),
            include_str!("../../templates/provisioner-with-examples.yaml"),
        ] {
            let config = ProvisionerConfig::from_yaml_str(template).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_bundled_manifests_parse() {
        let manifests =
            crate::manifests::parse_manifests(include_str!("../../templates/volumes-example.yaml"))
                .unwrap();
        assert!(!manifests.is_empty());
    }

    #[tokio::test]
    async fn test_generate_writes_config_and_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("aegis-provisioner.yaml");

        generate(output.clone(), true).await.unwrap();

        assert!(output.exists());
        assert!(dir.path().join("aegis-volumes.yaml").exists());
        validate(Some(output)).await.unwrap();
    }
}
