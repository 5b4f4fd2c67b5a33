// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential federation as seen by the provisioning path

mod common;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aegis_provisioner_core::application::block_storage::BlockStorageClient;
use aegis_provisioner_core::application::claims::ClaimService;
use aegis_provisioner_core::application::credential_broker::{BrokerSettings, CredentialBroker};
use aegis_provisioner_core::domain::claim::{AccessMode, ClaimState};
use aegis_provisioner_core::domain::cloud::{CloudError, CreateVolumeRequest};
use aegis_provisioner_core::domain::config::DEFAULT_PROVISIONER_ID;
use aegis_provisioner_core::domain::credential::{
    CredentialError, ExchangedToken, IdentityToken, Principal, PrincipalId, TokenExchanger,
};
use aegis_provisioner_core::domain::events::CredentialEvent;
use aegis_provisioner_core::domain::storage_class::{BindingMode, StorageClass};
use aegis_provisioner_core::infrastructure::cloud::{RetryPolicy, SimulatedCloud};
use aegis_provisioner_core::infrastructure::event_bus::DomainEvent;
use aegis_provisioner_core::infrastructure::federation::StaticTokenSource;

use common::{identity_jwt, provisioner_principal, wait_until, Cluster, AUDIENCE, SUBJECT, WAIT};

fn request(zone: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        capacity_gib: 10,
        zone: zone.to_string(),
        volume_type: "ssd".to_string(),
        iops: None,
        throughput_mibps: None,
        encrypted: false,
        tags: HashMap::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fifty_concurrent_callers_share_one_exchange() {
    let cluster = Cluster::new(SimulatedCloud::new());

    let mut tasks = Vec::new();
    for i in 0..50 {
        let client = cluster.client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .create_volume(&request("zone-a"), &format!("token-{}", i))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(cluster.exchanger.exchanges(), 1);
    assert_eq!(cluster.cloud.calls().create, 50);
    assert_eq!(cluster.cloud.volumes().len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_credential_requests_see_the_same_credential() {
    let cluster = Cluster::new(SimulatedCloud::new());
    let principal = PrincipalId::new("provisioner");

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let broker = cluster.broker.clone();
        let principal = principal.clone();
        tasks.push(tokio::spawn(async move { broker.get_credential(&principal).await }));
    }
    let mut tokens = HashSet::new();
    for task in tasks {
        let credential = task.await.unwrap().unwrap();
        tokens.insert(credential.access_token().to_string());
    }

    assert_eq!(tokens.len(), 1);
    assert_eq!(cluster.exchanger.exchanges(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_untrusted_identity_never_reaches_the_cloud() {
    let mut cluster = Cluster::with_identity(
        SimulatedCloud::new(),
        identity_jwt(SUBJECT, "some-other-audience"),
    );
    let class = StorageClass::new("standard", DEFAULT_PROVISIONER_ID)
        .unwrap()
        .with_binding_mode(BindingMode::Immediate);
    cluster.stores.classes.create(&class).await.unwrap();
    let mut events = cluster.bus.subscribe();
    let handles = cluster.start(&[]);

    let claim = cluster
        .claims
        .create_claim("data", 20, AccessMode::SingleWriter, "standard")
        .await
        .unwrap();

    let claims = cluster.claims.clone();
    wait_until("claim to report the rejection", WAIT, || {
        let claims = claims.clone();
        async move {
            claims.get_claim(claim.id).await.unwrap().status_reason() == Some("FederationRejected")
        }
    })
    .await;

    // Resyncs keep revisiting the claim
    tokio::time::sleep(Duration::from_millis(300)).await;
    cluster.stop(handles).await;

    assert_eq!(cluster.cloud.calls().total(), 0);
    assert_eq!(cluster.exchanger.exchanges(), 0);
    let claim = cluster.claims.get_claim(claim.id).await.unwrap();
    assert_eq!(claim.state, ClaimState::Pending);
    assert!(claim.bound_volume.is_none());
    assert!(events.drain().iter().any(|e| matches!(
        e,
        DomainEvent::Credential(CredentialEvent::FederationRejected { principal, .. })
            if principal == "provisioner"
    )));
}

/// Identity provider that refuses every exchange
struct RefusingExchanger {
    calls: AtomicUsize,
}

#[async_trait]
impl TokenExchanger for RefusingExchanger {
    async fn exchange(
        &self,
        principal: &Principal,
        _identity_token: &IdentityToken,
    ) -> Result<ExchangedToken, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CredentialError::Federation {
            principal: principal.id.to_string(),
            reason: "no trust relationship for this role".to_string(),
        })
    }
}

#[tokio::test]
async fn test_provider_rejection_is_not_retried_until_the_token_rotates() {
    let cloud = Arc::new(SimulatedCloud::new());
    let exchanger = Arc::new(RefusingExchanger {
        calls: AtomicUsize::new(0),
    });
    let broker = Arc::new(CredentialBroker::new(
        vec![provisioner_principal()],
        Arc::new(StaticTokenSource::new(identity_jwt(SUBJECT, AUDIENCE))),
        exchanger.clone(),
        BrokerSettings::default(),
    ));
    let client = BlockStorageClient::new(
        cloud.clone(),
        broker.clone(),
        PrincipalId::new("provisioner"),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        Duration::from_secs(1),
    );

    for i in 0..10 {
        let err = client
            .create_volume(&request("zone-a"), &format!("token-{}", i))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Credential(CredentialError::Federation { .. })));
    }
    assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.calls().total(), 0);

    broker.reset(&PrincipalId::new("provisioner")).await;
    assert!(client.create_volume(&request("zone-a"), "token-after-reset").await.is_err());
    assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
}
