// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fixtures shared by the application unit tests

use jsonwebtoken::{encode, EncodingKey, Header};
use std::sync::Arc;
use std::time::Duration;

use crate::application::binder::Binder;
use crate::application::block_storage::BlockStorageClient;
use crate::application::credential_broker::{BrokerSettings, CredentialBroker};
use crate::domain::credential::{Principal, PrincipalId, TrustCondition};
use crate::domain::repository::ResourceStores;
use crate::infrastructure::cloud::{RetryPolicy, SimulatedCloud};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::federation::{LocalTokenExchanger, StaticTokenSource};
use crate::infrastructure::repositories::in_memory_stores;

pub(crate) const SUBJECT: &str = "system:serviceaccount:aegis:provisioner";
pub(crate) const AUDIENCE: &str = "sts.cloud.example";

pub(crate) struct Harness {
    pub bus: Arc<EventBus>,
    pub stores: ResourceStores,
    pub cloud: Arc<SimulatedCloud>,
    pub exchanger: Arc<LocalTokenExchanger>,
    pub client: Arc<BlockStorageClient>,
    pub binder: Arc<Binder>,
}

pub(crate) fn identity_jwt(sub: &str, aud: &str) -> String {
    encode(
        &Header::default(),
        &serde_json::json!({ "sub": sub, "aud": aud, "exp": 4_102_444_800u64 }),
        &EncodingKey::from_secret(b"platform-key"),
    )
    .unwrap()
}

pub(crate) fn harness(cloud: SimulatedCloud) -> Harness {
    let bus = Arc::new(EventBus::new(4096));
    let stores = in_memory_stores(bus.clone());
    let cloud = Arc::new(cloud);
    let exchanger = Arc::new(LocalTokenExchanger::new(Duration::from_secs(3600)));

    let principal = Principal {
        id: PrincipalId::new("provisioner"),
        role: "roles/storage".to_string(),
        trust: TrustCondition {
            subject: SUBJECT.to_string(),
            audience: AUDIENCE.to_string(),
        },
        scopes: vec![],
    };
    let broker = Arc::new(CredentialBroker::new(
        vec![principal],
        Arc::new(StaticTokenSource::new(identity_jwt(SUBJECT, AUDIENCE))),
        exchanger.clone(),
        BrokerSettings::default(),
    ));
    let client = Arc::new(BlockStorageClient::new(
        cloud.clone(),
        broker,
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

    Harness {
        bus,
        stores,
        cloud,
        exchanger,
        client,
        binder,
    }
}
