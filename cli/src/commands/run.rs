// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run the in-process control plane
//!
//! Loads StorageClass/VolumeClaim/Node manifests, starts the claim and
//! attach/detach controllers, the credential refresher and a mount agent per
//! node, and prints domain events until interrupted.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_provisioner_core::domain::config::{CloudBackendConfig, ProvisionerConfig};
use aegis_provisioner_core::domain::events::{AttachmentEvent, ClaimEvent, MountEvent, VolumeEvent};
use aegis_provisioner_core::domain::node::NodeId;
use aegis_provisioner_core::infrastructure::event_bus::{DomainEvent, EventBusError, EventReceiver};

use crate::manifests::{apply, declared_nodes, load_manifest_files};
use crate::runtime::{shutdown_signal, ControlPlane, RuntimeOptions};

#[derive(Args)]
pub struct RunCommand {
    /// Manifest files with StorageClass, VolumeClaim and Node documents
    #[arg(short = 'f', long = "manifest", value_name = "FILE")]
    manifests: Vec<PathBuf>,

    /// Extra nodes to run a mount agent for
    #[arg(long = "node", value_name = "NODE_ID")]
    nodes: Vec<String>,

    /// Use a self-signed identity token (simulated cloud only)
    #[arg(long)]
    dev_identity: bool,
}

pub async fn execute(command: RunCommand, config_path: Option<PathBuf>) -> Result<()> {
    let config = ProvisionerConfig::load_or_default(config_path)
        .context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    let simulated = matches!(config.spec.cloud.backend, CloudBackendConfig::Simulated { .. });
    if command.dev_identity && !simulated {
        anyhow::bail!("--dev-identity is only allowed with the simulated cloud backend");
    }

    let manifests = load_manifest_files(&command.manifests)?;
    let mut agent_nodes: Vec<NodeId> = command.nodes.into_iter().map(NodeId::new).collect();
    // Every declared node is local when the cloud is simulated
    if simulated {
        agent_nodes.extend(declared_nodes(&manifests));
    }

    let provisioner_id = config.spec.cluster.provisioner_id.clone();
    let plane = ControlPlane::build(
        config,
        RuntimeOptions {
            dev_identity: command.dev_identity,
            agent_nodes,
        },
    )?;

    let printer = tokio::spawn(print_events(plane.event_bus.subscribe(), plane.shutdown_token()));
    let handles = plane.start();

    apply(&manifests, &plane.stores, plane.claims.as_ref(), &provisioner_id)
        .await
        .context("Failed to apply manifests")?;
    println!(
        "{}",
        format!("✓ Control plane running with {} manifest objects (Ctrl+C to stop)", manifests.len()).green()
    );

    shutdown_signal().await;
    plane.stop(handles).await;
    if let Err(e) = printer.await {
        warn!("Event printer ended abnormally: {}", e);
    }
    Ok(())
}

async fn print_events(mut events: EventReceiver, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.cancelled() => break,
        };
        match event {
            Ok(event) => {
                if let Some(line) = describe(&event) {
                    println!("{}", line);
                }
            }
            Err(EventBusError::Lagged(n)) => warn!(skipped = n, "Event printer fell behind"),
            Err(_) => break,
        }
    }
    info!("Event printer stopped");
}

fn describe(event: &DomainEvent) -> Option<String> {
    let line = match event {
        DomainEvent::Claim(ClaimEvent::ProvisioningStarted { claim_id, zone, .. }) => {
            format!("claim {} provisioning in {}", claim_id, zone)
        }
        DomainEvent::Claim(ClaimEvent::VolumeBound {
            claim_id,
            volume_id,
            ..
        }) => format!("claim {} bound to {}", claim_id, volume_id).green().to_string(),
        DomainEvent::Claim(ClaimEvent::ProvisioningFailed {
            claim_id,
            reason,
            message,
            ..
        }) => format!("claim {} failed ({}): {}", claim_id, reason, message)
            .red()
            .to_string(),
        DomainEvent::Claim(ClaimEvent::ResizeRequested {
            claim_id,
            from_gib,
            to_gib,
            ..
        }) => format!("claim {} resizing {} → {} GiB", claim_id, from_gib, to_gib),
        DomainEvent::Claim(ClaimEvent::ClaimLost { claim_id, .. }) => {
            format!("claim {} lost its volume", claim_id).red().to_string()
        }
        DomainEvent::Claim(ClaimEvent::ClaimDeleted { claim_id, .. }) => {
            format!("claim {} deleted", claim_id)
        }
        DomainEvent::Volume(VolumeEvent::VolumeCreated {
            volume_id,
            zone,
            capacity_gib,
            ..
        }) => format!("volume {} created ({} GiB, {})", volume_id, capacity_gib, zone),
        DomainEvent::Volume(VolumeEvent::VolumeReleased { volume_id, policy, .. }) => {
            format!("volume {} released ({:?})", volume_id, policy)
        }
        DomainEvent::Volume(VolumeEvent::VolumeDeleted { volume_id, .. }) => {
            format!("volume {} deleted", volume_id)
        }
        DomainEvent::Volume(VolumeEvent::FilesystemResized {
            volume_id,
            capacity_gib,
            ..
        }) => format!("volume {} filesystem grown to {} GiB", volume_id, capacity_gib),
        DomainEvent::Attachment(AttachmentEvent::VolumeAttached { volume_id, node_id, .. }) => {
            format!("volume {} attached to {}", volume_id, node_id).green().to_string()
        }
        DomainEvent::Attachment(AttachmentEvent::VolumeDetached { volume_id, node_id, .. }) => {
            format!("volume {} detached from {}", volume_id, node_id)
        }
        DomainEvent::Attachment(AttachmentEvent::AttachTimedOut {
            volume_id,
            node_id,
            waited_seconds,
            ..
        }) => format!(
            "volume {} stuck attaching to {} for {}s",
            volume_id, node_id, waited_seconds
        )
        .red()
        .bold()
        .to_string(),
        DomainEvent::Attachment(AttachmentEvent::CrossZonePlacement {
            volume_id,
            node_id,
            volume_zone,
            node_zone,
            ..
        }) => format!(
            "volume {} ({}) cannot attach to {} ({})",
            volume_id, volume_zone, node_id, node_zone
        )
        .yellow()
        .to_string(),
        DomainEvent::Mount(MountEvent::VolumeMounted {
            volume_id,
            node_id,
            target,
            formatted,
            ..
        }) => format!(
            "volume {} mounted at {}:{}{}",
            volume_id,
            node_id,
            target.display(),
            if *formatted { " (formatted)" } else { "" }
        )
        .green()
        .to_string(),
        DomainEvent::Mount(MountEvent::MountFailed {
            volume_id,
            error,
            terminal: true,
            ..
        }) => format!("volume {} mount failed permanently: {}", volume_id, error)
            .red()
            .bold()
            .to_string(),
        _ => return None,
    };
    Some(line)
}
