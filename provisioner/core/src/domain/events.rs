// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain events published by the provisioner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::claim::ClaimId;
use crate::domain::node::NodeId;
use crate::domain::repository::ResourceKind;
use crate::domain::storage_class::ReclaimPolicy;
use crate::domain::volume::VolumeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClaimEvent {
    ProvisioningStarted {
        claim_id: ClaimId,
        zone: String,
        generation: u32,
        started_at: DateTime<Utc>,
    },
    VolumeBound {
        claim_id: ClaimId,
        volume_id: VolumeId,
        bound_at: DateTime<Utc>,
    },
    ProvisioningFailed {
        claim_id: ClaimId,
        reason: String,
        message: String,
        retryable: bool,
        failed_at: DateTime<Utc>,
    },
    ResizeRequested {
        claim_id: ClaimId,
        volume_id: VolumeId,
        from_gib: u64,
        to_gib: u64,
        requested_at: DateTime<Utc>,
    },
    ClaimLost {
        claim_id: ClaimId,
        volume_id: VolumeId,
        lost_at: DateTime<Utc>,
    },
    ClaimDeleted {
        claim_id: ClaimId,
        deleted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VolumeEvent {
    VolumeCreated {
        volume_id: VolumeId,
        zone: String,
        capacity_gib: u64,
        created_at: DateTime<Utc>,
    },
    VolumeReleased {
        volume_id: VolumeId,
        claim_id: ClaimId,
        policy: ReclaimPolicy,
        released_at: DateTime<Utc>,
    },
    VolumeDeleted {
        volume_id: VolumeId,
        deleted_at: DateTime<Utc>,
    },
    FilesystemResized {
        volume_id: VolumeId,
        capacity_gib: u64,
        resized_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttachmentEvent {
    AttachRequested {
        volume_id: VolumeId,
        node_id: NodeId,
        requested_at: DateTime<Utc>,
    },
    VolumeAttached {
        volume_id: VolumeId,
        node_id: NodeId,
        attached_at: DateTime<Utc>,
    },
    DetachRequested {
        volume_id: VolumeId,
        node_id: NodeId,
        requested_at: DateTime<Utc>,
    },
    VolumeDetached {
        volume_id: VolumeId,
        node_id: NodeId,
        detached_at: DateTime<Utc>,
    },
    AttachFailed {
        volume_id: VolumeId,
        node_id: NodeId,
        error: String,
        attempt: u32,
        failed_at: DateTime<Utc>,
    },
    /// Stuck attaching past the configured timeout; needs an operator
    AttachTimedOut {
        volume_id: VolumeId,
        node_id: NodeId,
        waited_seconds: i64,
        detected_at: DateTime<Utc>,
    },
    CrossZonePlacement {
        volume_id: VolumeId,
        node_id: NodeId,
        volume_zone: String,
        node_zone: String,
        detected_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MountEvent {
    VolumeMounted {
        volume_id: VolumeId,
        node_id: NodeId,
        target: PathBuf,
        formatted: bool,
        mounted_at: DateTime<Utc>,
    },
    VolumeUnmounted {
        volume_id: VolumeId,
        node_id: NodeId,
        unmounted_at: DateTime<Utc>,
    },
    MountFailed {
        volume_id: VolumeId,
        node_id: NodeId,
        error: String,
        attempt: u32,
        terminal: bool,
        failed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CredentialEvent {
    CredentialRefreshed {
        principal: String,
        expires_at: DateTime<Utc>,
    },
    FederationRejected {
        principal: String,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceChange {
    Created,
    Updated,
    Deleted,
}

/// Watch notification emitted by the resource store on every write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub key: String,
    pub change: ResourceChange,
    pub version: u64,
}
