// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! A claim's whole life with every controller running

mod common;

use std::path::{Path, PathBuf};

use aegis_provisioner_core::application::claims::ClaimService;
use aegis_provisioner_core::domain::attachment::AttachmentPhase;
use aegis_provisioner_core::domain::claim::{AccessMode, ClaimState};
use aegis_provisioner_core::domain::config::DEFAULT_PROVISIONER_ID;
use aegis_provisioner_core::domain::error::ProvisioningError;
use aegis_provisioner_core::domain::node::{Node, NodeId};
use aegis_provisioner_core::domain::storage_class::{
    BindingMode, FsType, ReclaimPolicy, StorageClass, VolumeParameters,
};
use aegis_provisioner_core::infrastructure::cloud::SimulatedCloud;

use common::{wait_until, Cluster, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_lifecycle_from_creation_to_deletion() {
    let mut cluster = Cluster::new(SimulatedCloud::with_settle_polls(2));
    let class = StorageClass::new("fast", DEFAULT_PROVISIONER_ID)
        .unwrap()
        .with_parameters(VolumeParameters {
            fs_type: FsType::Xfs,
            ..VolumeParameters::default()
        })
        .with_binding_mode(BindingMode::WaitForConsumer)
        .with_reclaim_policy(ReclaimPolicy::Delete)
        .with_expansion(true)
        .with_allowed_zones(["zone-a"]);
    cluster.stores.classes.create(&class).await.unwrap();
    cluster.stores.nodes.create(&Node::new("node-a", "zone-a")).await.unwrap();
    let handles = cluster.start(&["node-a"]);

    // Create and place, as a scheduler would
    let claim = cluster
        .claims
        .create_claim("postgres", 20, AccessMode::SingleWriter, "fast")
        .await
        .unwrap();
    cluster
        .claims
        .place_consumer(claim.id, NodeId::new("node-a"), PathBuf::from("/pg"))
        .await
        .unwrap();

    let mounter = cluster.mounter("node-a");
    let m = mounter.clone();
    wait_until("filesystem to be mounted", WAIT, || {
        let m = m.clone();
        async move { m.mount_at(Path::new("/pg")).is_some() }
    })
    .await;

    let bound = cluster.claims.get_claim(claim.id).await.unwrap();
    assert_eq!(bound.state, ClaimState::Bound);
    let volume_id = bound.bound_volume.clone().unwrap();
    let record = mounter.mount_at(Path::new("/pg")).unwrap();
    assert_eq!(record.fs_type, FsType::Xfs);
    assert!(!record.read_only);
    assert_eq!(mounter.format_count(), 1);

    let stores = cluster.stores.clone();
    let id = volume_id.clone();
    wait_until("attachment to report ready", WAIT, || {
        let stores = stores.clone();
        let id = id.clone();
        async move {
            stores
                .attachments
                .get(&id)
                .await
                .unwrap()
                .is_some_and(|a| a.phase == AttachmentPhase::Attached && a.ready)
        }
    })
    .await;
    assert!(cluster.cloud.volume(&volume_id).unwrap().is_attached_to(&NodeId::new("node-a")));

    // Grow online
    cluster.claims.resize_claim(claim.id, 30).await.unwrap();
    let stores = cluster.stores.clone();
    let id = volume_id.clone();
    wait_until("online expansion", WAIT, || {
        let stores = stores.clone();
        let id = id.clone();
        async move {
            stores
                .volumes
                .get(&id)
                .await
                .unwrap()
                .is_some_and(|v| v.capacity_gib == 30)
        }
    })
    .await;
    assert_eq!(mounter.resize_count(), 1);

    // Delete and watch everything unwind
    cluster.claims.delete_claim(claim.id).await.unwrap();
    let claims = cluster.claims.clone();
    wait_until("claim to be removed", WAIT, || {
        let claims = claims.clone();
        async move { matches!(claims.get_claim(claim.id).await, Err(ProvisioningError::NotFound(_))) }
    })
    .await;
    let stores = cluster.stores.clone();
    let id = volume_id.clone();
    wait_until("attachment to be forgotten", WAIT, || {
        let stores = stores.clone();
        let id = id.clone();
        async move { stores.attachments.get(&id).await.unwrap().is_none() }
    })
    .await;
    cluster.stop(handles).await;

    assert!(mounter.mount_at(Path::new("/pg")).is_none());
    assert!(cluster.cloud.volumes().is_empty());

    let calls = cluster.cloud.calls();
    assert_eq!(calls.create, 1);
    assert_eq!(calls.modify, 1);
    assert_eq!(calls.delete, 1);
    assert_eq!(calls.attach, 1);
    assert_eq!(calls.detach, 1);
    assert_eq!(cluster.exchanger.exchanges(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_only_consumer_mounts_read_only() {
    let mut cluster = Cluster::new(SimulatedCloud::with_settle_polls(1));
    let class = StorageClass::new("standard", DEFAULT_PROVISIONER_ID).unwrap();
    cluster.stores.classes.create(&class).await.unwrap();
    cluster.stores.nodes.create(&Node::new("node-a", "zone-a")).await.unwrap();
    let handles = cluster.start(&["node-a"]);

    let claim = cluster
        .claims
        .create_claim("reference-data", 5, AccessMode::ManyReaders, "standard")
        .await
        .unwrap();
    cluster
        .claims
        .place_consumer(claim.id, NodeId::new("node-a"), PathBuf::from("/ref"))
        .await
        .unwrap();

    let mounter = cluster.mounter("node-a");
    let m = mounter.clone();
    wait_until("read-only mount", WAIT, || {
        let m = m.clone();
        async move { m.mount_at(Path::new("/ref")).is_some() }
    })
    .await;
    cluster.stop(handles).await;

    let record = mounter.mount_at(Path::new("/ref")).unwrap();
    assert!(record.read_only);
    assert_eq!(record.fs_type, FsType::Ext4);
}
