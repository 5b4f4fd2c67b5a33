// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cloud Block-Storage Trait - Anti-Corruption Layer for provider volume APIs
//!
//! One implementation per provider. Every call receives the live credential
//! it must authenticate with; implementations never cache credentials.
//! Mutating calls carry a caller-supplied idempotency token: repeating a call
//! with the same token returns the original result and creates nothing new.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::credential::{Credential, CredentialError};
use crate::domain::node::NodeId;
use crate::domain::volume::VolumeId;

/// Tag carrying the idempotency token on created volumes
pub const IDEMPOTENCY_TAG: &str = "aegis.100monkeys.ai/idempotency-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub capacity_gib: u64,
    pub zone: String,
    pub volume_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_mibps: Option<u32>,
    pub encrypted: bool,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudVolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudAttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudAttachment {
    pub node_id: NodeId,
    pub state: CloudAttachmentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_hint: Option<String>,
}

/// A volume as described by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudVolume {
    pub id: VolumeId,
    pub capacity_gib: u64,
    pub zone: String,
    pub encrypted: bool,
    pub state: CloudVolumeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<CloudAttachment>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl CloudVolume {
    pub fn is_attached_to(&self, node: &NodeId) -> bool {
        matches!(
            &self.attachment,
            Some(a) if &a.node_id == node && a.state == CloudAttachmentState::Attached
        )
    }

    pub fn attachment_state(&self) -> CloudAttachmentState {
        self.attachment
            .as_ref()
            .map(|a| a.state)
            .unwrap_or(CloudAttachmentState::Detached)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSnapshot {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    pub capacity_gib: u64,
    pub created_at: DateTime<Utc>,
}

/// Provider volume API
#[async_trait]
pub trait CloudBlockStorageClient: Send + Sync {
    /// Zone-scoped create. Replaying `idempotency_token` returns the same volume.
    async fn create_volume(
        &self,
        credential: &Credential,
        request: &CreateVolumeRequest,
        idempotency_token: &str,
    ) -> Result<CloudVolume, CloudError>;

    async fn delete_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    /// Starts the attach; completion is observed through `describe_volume`
    async fn attach_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        node_id: &NodeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    /// Starts the detach; completion is observed through `describe_volume`
    async fn detach_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        node_id: &NodeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    async fn describe_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
    ) -> Result<CloudVolume, CloudError>;

    /// Grow the volume to `capacity_gib`
    async fn modify_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        capacity_gib: u64,
        idempotency_token: &str,
    ) -> Result<(), CloudError>;

    /// Look a volume up by the token it was created with
    async fn find_by_token(
        &self,
        credential: &Credential,
        idempotency_token: &str,
    ) -> Result<Option<CloudVolume>, CloudError>;

    async fn create_snapshot(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        idempotency_token: &str,
    ) -> Result<CloudSnapshot, CloudError>;

    async fn create_tags(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError>;
}

#[derive(Debug, Clone, Error)]
pub enum CloudError {
    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl CloudError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled(_) | Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Credential(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
