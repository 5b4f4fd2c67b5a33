// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process control plane
//!
//! Wires the credential broker, cloud client, binder, both controllers and
//! the node mount agents from a `ProvisionerConfig`, and owns their shutdown.

use anyhow::{Context, Result};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aegis_provisioner_core::application::attach_controller::{
    AttachControllerSettings, AttachDetachController,
};
use aegis_provisioner_core::application::binder::Binder;
use aegis_provisioner_core::application::block_storage::BlockStorageClient;
use aegis_provisioner_core::application::claim_controller::{
    ClaimController, ClaimControllerSettings,
};
use aegis_provisioner_core::application::claims::StandardClaimService;
use aegis_provisioner_core::application::controller::{ControllerRunner, ControllerSettings};
use aegis_provisioner_core::application::credential_broker::{BrokerSettings, CredentialBroker};
use aegis_provisioner_core::application::mount_agent::{MountAgentSettings, NodeMountAgent};
use aegis_provisioner_core::domain::config::{CloudBackendConfig, ProvisionerConfig};
use aegis_provisioner_core::domain::credential::{
    IdentityTokenSource, PrincipalId, TokenExchanger,
};
use aegis_provisioner_core::domain::mount::Mounter;
use aegis_provisioner_core::domain::node::NodeId;
use aegis_provisioner_core::domain::repository::ResourceStores;
use aegis_provisioner_core::infrastructure::cloud::{build_backend, RetryPolicy};
use aegis_provisioner_core::infrastructure::event_bus::EventBus;
use aegis_provisioner_core::infrastructure::federation::{
    build_token_source, LocalTokenExchanger, StaticTokenSource, StsTokenExchanger,
};
use aegis_provisioner_core::infrastructure::mount::InMemoryMounter;
use aegis_provisioner_core::infrastructure::repositories::in_memory_stores;

/// Lifetime of credentials minted by the local exchanger
const LOCAL_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Mint a self-signed identity token instead of reading the configured source
    pub dev_identity: bool,
    /// Nodes to run a mount agent for, besides `spec.node.id`
    pub agent_nodes: Vec<NodeId>,
}

pub struct ControlPlane {
    pub event_bus: Arc<EventBus>,
    pub stores: ResourceStores,
    pub broker: Arc<CredentialBroker>,
    pub claims: Arc<StandardClaimService>,
    claim_controller: Arc<ClaimController>,
    attach_controller: Arc<AttachDetachController>,
    agents: Vec<Arc<NodeMountAgent>>,
    config: ProvisionerConfig,
    shutdown: CancellationToken,
}

/// Identity token source and exchanger for the configured backend
pub fn build_federation(
    config: &ProvisionerConfig,
    dev_identity: bool,
) -> Result<(Arc<dyn IdentityTokenSource>, Arc<dyn TokenExchanger>)> {
    let federation = &config.spec.federation;

    let exchanger: Arc<dyn TokenExchanger> = match &config.spec.cloud.backend {
        CloudBackendConfig::Simulated { .. } => {
            info!("Simulated cloud: credentials are minted locally");
            Arc::new(LocalTokenExchanger::new(LOCAL_CREDENTIAL_LIFETIME))
        }
        CloudBackendConfig::Http { .. } => Arc::new(
            StsTokenExchanger::new(
                federation.issuer.clone(),
                federation.token_endpoint.clone(),
                federation.request_timeout,
            )
            .context("Failed to build token exchanger")?,
        ),
    };

    let source: Arc<dyn IdentityTokenSource> = if dev_identity {
        let principal = federation
            .principals
            .iter()
            .find(|p| p.name == config.spec.cloud.principal)
            .context("Cloud principal is not declared in spec.federation.principals")?;
        warn!(principal = %principal.name, "Using a self-signed development identity token");
        Arc::new(StaticTokenSource::new(dev_identity_token(
            &principal.subject,
            &principal.audience,
        )?))
    } else {
        build_token_source(&federation.identity_token, federation.request_timeout)
            .context("Failed to build identity token source")?
    };

    Ok((source, exchanger))
}

/// An HS256 token carrying `sub` and `aud`, signed with a throwaway key
pub fn dev_identity_token(subject: &str, audience: &str) -> Result<String> {
    let mut key = [0u8; 32];
    rand::rng().fill(&mut key);
    let exp = chrono::Utc::now() + chrono::Duration::days(1);
    let claims = serde_json::json!({
        "sub": subject,
        "aud": audience,
        "iss": "aegis-provisioner-dev",
        "exp": exp.timestamp(),
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(&key))
        .context("Failed to sign development identity token")
}

pub fn build_broker(
    config: &ProvisionerConfig,
    dev_identity: bool,
    event_bus: Arc<EventBus>,
) -> Result<Arc<CredentialBroker>> {
    let (source, exchanger) = build_federation(config, dev_identity)?;
    let federation = &config.spec.federation;
    Ok(Arc::new(
        CredentialBroker::new(
            config.principals(),
            source,
            exchanger,
            BrokerSettings {
                safety_margin: federation.safety_margin,
                refresh_lead: federation.refresh_lead,
            },
        )
        .with_event_bus(event_bus),
    ))
}

fn build_mounter(config: &ProvisionerConfig) -> Arc<dyn Mounter> {
    match &config.spec.cloud.backend {
        CloudBackendConfig::Simulated { .. } => Arc::new(InMemoryMounter::new()),
        #[cfg(target_os = "linux")]
        CloudBackendConfig::Http { .. } => Arc::new(
            aegis_provisioner_core::infrastructure::mount::SystemMounter::new(
                config.spec.node.device_dir.clone(),
            ),
        ),
        #[cfg(not(target_os = "linux"))]
        CloudBackendConfig::Http { .. } => {
            warn!("No system mounter for this platform; mounts are simulated");
            Arc::new(InMemoryMounter::new())
        }
    }
}

impl ControlPlane {
    pub fn build(config: ProvisionerConfig, options: RuntimeOptions) -> Result<Self> {
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let stores = in_memory_stores(event_bus.clone());
        let broker = build_broker(&config, options.dev_identity, event_bus.clone())?;

        let cloud_config = &config.spec.cloud;
        let backend = build_backend(cloud_config).context("Failed to build cloud backend")?;
        let client = Arc::new(BlockStorageClient::new(
            backend,
            broker.clone(),
            PrincipalId::new(cloud_config.principal.clone()),
            RetryPolicy::from(cloud_config),
            cloud_config.call_timeout,
        ));
        let binder = Arc::new(Binder::new(
            stores.claims.clone(),
            stores.volumes.clone(),
            event_bus.clone(),
        ));

        let controllers = &config.spec.controllers;
        let claim_controller = Arc::new(ClaimController::new(
            stores.clone(),
            binder,
            client.clone(),
            event_bus.clone(),
            ClaimControllerSettings {
                provisioner_id: config.spec.cluster.provisioner_id.clone(),
                zones: config.spec.cluster.zones.clone(),
                poll_interval: controllers.poll_interval,
            },
        ));
        let attach_controller = Arc::new(AttachDetachController::new(
            stores.clone(),
            client,
            event_bus.clone(),
            AttachControllerSettings {
                poll_interval: controllers.poll_interval,
                attach_timeout: controllers.attach_timeout,
            },
        ));

        let mut agent_nodes = options.agent_nodes;
        if let Some(id) = &config.spec.node.id {
            agent_nodes.push(NodeId::new(id.clone()));
        }
        agent_nodes.sort();
        agent_nodes.dedup();

        let mounter = build_mounter(&config);
        let agents = agent_nodes
            .into_iter()
            .map(|node_id| {
                Arc::new(NodeMountAgent::new(
                    node_id,
                    stores.clone(),
                    mounter.clone(),
                    event_bus.clone(),
                    MountAgentSettings {
                        max_mount_attempts: config.spec.node.max_mount_attempts,
                        poll_interval: controllers.poll_interval,
                    },
                ))
            })
            .collect();

        let claims = Arc::new(StandardClaimService::new(
            stores.claims.clone(),
            stores.classes.clone(),
        ));

        Ok(Self {
            event_bus,
            stores,
            broker,
            claims,
            claim_controller,
            attach_controller,
            agents,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn controller_settings(&self) -> ControllerSettings {
        let controllers = &self.config.spec.controllers;
        ControllerSettings {
            workers: controllers.workers,
            resync_period: controllers.resync_period,
            requeue_base: controllers.requeue_base,
            requeue_max: controllers.requeue_max,
        }
    }

    /// Start the refresher, both controllers and every node agent
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let settings = self.controller_settings();
        let mut handles = Vec::new();

        let refresh_every = (self.config.spec.federation.refresh_lead / 4).max(Duration::from_secs(1));
        handles.push(
            self.broker
                .clone()
                .spawn_refresher(refresh_every, self.shutdown.child_token()),
        );

        handles.push(
            Arc::new(
                ControllerRunner::new(self.claim_controller.clone(), self.event_bus.clone(), settings.clone())
                    .with_shutdown_token(&self.shutdown),
            )
            .start(),
        );
        handles.push(
            Arc::new(
                ControllerRunner::new(self.attach_controller.clone(), self.event_bus.clone(), settings.clone())
                    .with_shutdown_token(&self.shutdown),
            )
            .start(),
        );
        for agent in &self.agents {
            info!(node_id = %agent.node_id(), "Starting node mount agent");
            handles.push(
                Arc::new(
                    ControllerRunner::new(agent.clone(), self.event_bus.clone(), settings.clone())
                        .with_shutdown_token(&self.shutdown),
                )
                .start(),
            );
        }

        info!(
            agents = self.agents.len(),
            workers = settings.workers,
            "Control plane started"
        );
        handles
    }

    /// Cancel every loop and wait for them to finish
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.cancel();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Control plane task ended abnormally: {}", e);
            }
        }
        info!("Control plane stopped");
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
