// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource repositories
//!
//! Every stored object carries a monotonic version. Writes present the
//! version they read; a stale write fails with `VersionConflict` and the
//! caller re-reconciles from fresh state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::attachment::VolumeAttachment;
use crate::domain::claim::{ClaimId, VolumeClaim};
use crate::domain::node::{Node, NodeId};
use crate::domain::storage_class::StorageClass;
use crate::domain::volume::{Volume, VolumeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Claim,
    Volume,
    StorageClass,
    Attachment,
    Node,
}

/// A versioned object kept in a repository
pub trait Resource: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    const KIND: ResourceKind;

    fn key(&self) -> Self::Key;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

#[async_trait]
pub trait Repository<T: Resource>: Send + Sync {
    /// Insert a new object. Fails if the key exists.
    async fn create(&self, item: &T) -> Result<T, RepositoryError>;

    /// Replace an object, guarded by the version on `item`
    async fn update(&self, item: &T) -> Result<T, RepositoryError>;

    async fn get(&self, key: &T::Key) -> Result<Option<T>, RepositoryError>;

    async fn list(&self) -> Result<Vec<T>, RepositoryError>;

    async fn delete(&self, key: &T::Key) -> Result<(), RepositoryError>;
}

pub type ClaimRepository = dyn Repository<VolumeClaim>;
pub type VolumeRepository = dyn Repository<Volume>;
pub type StorageClassRepository = dyn Repository<StorageClass>;
pub type AttachmentRepository = dyn Repository<VolumeAttachment>;
pub type NodeRepository = dyn Repository<Node>;

/// Handles to every resource collection, shared by the controllers
#[derive(Clone)]
pub struct ResourceStores {
    pub claims: Arc<ClaimRepository>,
    pub volumes: Arc<VolumeRepository>,
    pub classes: Arc<StorageClassRepository>,
    pub attachments: Arc<AttachmentRepository>,
    pub nodes: Arc<NodeRepository>,
}

impl Resource for VolumeClaim {
    type Key = ClaimId;
    const KIND: ResourceKind = ResourceKind::Claim;

    fn key(&self) -> ClaimId {
        self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Resource for Volume {
    type Key = VolumeId;
    const KIND: ResourceKind = ResourceKind::Volume;

    fn key(&self) -> VolumeId {
        self.id.clone()
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Resource for StorageClass {
    type Key = String;
    const KIND: ResourceKind = ResourceKind::StorageClass;

    fn key(&self) -> String {
        self.name.clone()
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Attachments are keyed by volume: one placement record per volume
impl Resource for VolumeAttachment {
    type Key = VolumeId;
    const KIND: ResourceKind = ResourceKind::Attachment;

    fn key(&self) -> VolumeId {
        self.volume_id.clone()
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Resource for Node {
    type Key = NodeId;
    const KIND: ResourceKind = ResourceKind::Node;

    fn key(&self) -> NodeId {
        self.id.clone()
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("{0} is immutable")]
    Immutable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
