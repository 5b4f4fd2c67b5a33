// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared cluster fixture for the integration tests
#![allow(dead_code)]

use jsonwebtoken::{encode, EncodingKey, Header};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

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
use aegis_provisioner_core::domain::cloud::CloudBlockStorageClient;
use aegis_provisioner_core::domain::config::DEFAULT_PROVISIONER_ID;
use aegis_provisioner_core::domain::credential::{Principal, PrincipalId, TrustCondition};
use aegis_provisioner_core::domain::node::NodeId;
use aegis_provisioner_core::domain::repository::ResourceStores;
use aegis_provisioner_core::infrastructure::cloud::{RetryPolicy, SimulatedCloud};
use aegis_provisioner_core::infrastructure::event_bus::EventBus;
use aegis_provisioner_core::infrastructure::federation::{LocalTokenExchanger, StaticTokenSource};
use aegis_provisioner_core::infrastructure::mount::InMemoryMounter;
use aegis_provisioner_core::infrastructure::repositories::in_memory_stores;

pub const SUBJECT: &str = "system:serviceaccount:aegis:provisioner";
pub const AUDIENCE: &str = "sts.cloud.example";
pub const ZONE: &str = "zone-a";

pub fn identity_jwt(sub: &str, aud: &str) -> String {
    encode(
        &Header::default(),
        &serde_json::json!({ "sub": sub, "aud": aud, "exp": 4_102_444_800u64 }),
        &EncodingKey::from_secret(b"platform-key"),
    )
    .unwrap()
}

pub fn provisioner_principal() -> Principal {
    Principal {
        id: PrincipalId::new("provisioner"),
        role: "roles/storage".to_string(),
        trust: TrustCondition {
            subject: SUBJECT.to_string(),
            audience: AUDIENCE.to_string(),
        },
        scopes: vec![],
    }
}

/// Stores, cloud, broker and controllers wired as the CLI wires them, with
/// test-speed timings
pub struct Cluster {
    pub bus: Arc<EventBus>,
    pub stores: ResourceStores,
    pub cloud: Arc<SimulatedCloud>,
    pub exchanger: Arc<LocalTokenExchanger>,
    pub broker: Arc<CredentialBroker>,
    pub client: Arc<BlockStorageClient>,
    pub binder: Arc<Binder>,
    pub claims: Arc<StandardClaimService>,
    pub claim_controller: Arc<ClaimController>,
    pub attach_controller: Arc<AttachDetachController>,
    mounters: HashMap<String, Arc<InMemoryMounter>>,
    shutdown: CancellationToken,
}

impl Cluster {
    pub fn new(cloud: SimulatedCloud) -> Self {
        let cloud = Arc::new(cloud);
        Self::build(cloud.clone(), cloud, identity_jwt(SUBJECT, AUDIENCE))
    }

    /// Cluster whose workload identity token is `identity_token`
    pub fn with_identity(cloud: SimulatedCloud, identity_token: String) -> Self {
        let cloud = Arc::new(cloud);
        Self::build(cloud.clone(), cloud, identity_token)
    }

    /// Cluster calling the cloud through `backend`, which fronts `cloud`
    pub fn with_backend(cloud: Arc<SimulatedCloud>, backend: Arc<dyn CloudBlockStorageClient>) -> Self {
        Self::build(cloud, backend, identity_jwt(SUBJECT, AUDIENCE))
    }

    fn build(
        cloud: Arc<SimulatedCloud>,
        backend: Arc<dyn CloudBlockStorageClient>,
        identity_token: String,
    ) -> Self {
        let bus = Arc::new(EventBus::new(8192));
        let stores = in_memory_stores(bus.clone());
        let exchanger = Arc::new(LocalTokenExchanger::new(Duration::from_secs(3600)));
        let broker = Arc::new(
            CredentialBroker::new(
                vec![provisioner_principal()],
                Arc::new(StaticTokenSource::new(identity_token)),
                exchanger.clone(),
                BrokerSettings::default(),
            )
            .with_event_bus(bus.clone()),
        );
        let client = Arc::new(BlockStorageClient::new(
            backend,
            broker.clone(),
            PrincipalId::new("provisioner"),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            Duration::from_secs(1),
        ));
        let binder = Arc::new(Binder::new(
            stores.claims.clone(),
            stores.volumes.clone(),
            bus.clone(),
        ));
        let claim_controller = Arc::new(ClaimController::new(
            stores.clone(),
            binder.clone(),
            client.clone(),
            bus.clone(),
            ClaimControllerSettings {
                provisioner_id: DEFAULT_PROVISIONER_ID.to_string(),
                zones: vec![ZONE.to_string()],
                poll_interval: Duration::from_millis(5),
            },
        ));
        let attach_controller = Arc::new(AttachDetachController::new(
            stores.clone(),
            client.clone(),
            bus.clone(),
            AttachControllerSettings {
                poll_interval: Duration::from_millis(5),
                attach_timeout: Duration::from_secs(30),
            },
        ));
        let claims = Arc::new(StandardClaimService::new(
            stores.claims.clone(),
            stores.classes.clone(),
        ));

        Self {
            bus,
            stores,
            cloud,
            exchanger,
            broker,
            client,
            binder,
            claims,
            claim_controller,
            attach_controller,
            mounters: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Mounter backing the agent of `node`
    pub fn mounter(&self, node: &str) -> Arc<InMemoryMounter> {
        self.mounters[node].clone()
    }

    fn controller_settings() -> ControllerSettings {
        ControllerSettings {
            workers: 2,
            resync_period: Duration::from_millis(50),
            requeue_base: Duration::from_millis(5),
            requeue_max: Duration::from_millis(50),
        }
    }

    /// Run both controllers plus a mount agent for each of `nodes`
    pub fn start(&mut self, nodes: &[&str]) -> Vec<JoinHandle<()>> {
        let settings = Self::controller_settings();
        let mut handles = vec![
            Arc::new(
                ControllerRunner::new(self.claim_controller.clone(), self.bus.clone(), settings.clone())
                    .with_shutdown_token(&self.shutdown),
            )
            .start(),
            Arc::new(
                ControllerRunner::new(self.attach_controller.clone(), self.bus.clone(), settings.clone())
                    .with_shutdown_token(&self.shutdown),
            )
            .start(),
        ];

        for node in nodes {
            let mounter = Arc::new(InMemoryMounter::new());
            self.mounters.insert(node.to_string(), mounter.clone());
            let agent = Arc::new(NodeMountAgent::new(
                NodeId::new(*node),
                self.stores.clone(),
                mounter,
                self.bus.clone(),
                MountAgentSettings {
                    max_mount_attempts: 5,
                    poll_interval: Duration::from_millis(5),
                },
            ));
            handles.push(
                Arc::new(
                    ControllerRunner::new(agent, self.bus.clone(), settings.clone())
                        .with_shutdown_token(&self.shutdown),
                )
                .start(),
            );
        }
        handles
    }

    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

/// Poll `check` until it holds, failing the test after `timeout`
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub const WAIT: Duration = Duration::from_secs(10);
