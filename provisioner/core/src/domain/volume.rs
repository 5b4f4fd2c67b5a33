// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::claim::ClaimId;
use crate::domain::node::NodeId;
use crate::domain::storage_class::{FsType, ReclaimPolicy, StorageClass};

// ============================================================================
// Value Objects
// ============================================================================

/// Cloud-assigned identifier of a block volume
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VolumeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binding lifecycle of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    /// Create issued, cloud has not reported the volume ready
    Creating,
    /// Ready and unbound (fresh, or retained after its claim was deleted)
    Available,
    /// Bound to exactly one claim
    Bound,
    /// Claim deleted under the Delete policy; cloud delete pending
    Releasing,
    /// Cloud volume is gone
    Deleted,
    /// Cloud reported an error state
    Failed,
}

impl VolumeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// Attachment lifecycle of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AttachmentState {
    #[default]
    Detached,
    Attaching,
    Attached,
    Detaching,
}

impl AttachmentState {
    /// An attach or detach has been issued and not yet resolved
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Attaching | Self::Detaching)
    }
}

// ============================================================================
// Aggregate Root: Volume
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,

    /// Provisioned capacity in GiB, as confirmed by the filesystem
    pub capacity_gib: u64,

    pub zone: String,

    pub encrypted: bool,

    pub state: VolumeState,

    pub attachment: AttachmentState,

    pub attached_node: Option<NodeId>,

    pub bound_claim: Option<ClaimId>,

    /// Class the volume was provisioned from
    pub storage_class: String,

    /// Reclaim policy captured at provisioning time
    pub reclaim_policy: ReclaimPolicy,

    pub fs_type: FsType,

    /// Token the volume was created with
    pub idempotency_token: String,

    /// Capacity requested from the cloud and not yet grown into by the filesystem
    pub pending_resize_gib: Option<u64>,

    /// Left behind by the Retain policy
    pub retained: bool,

    pub created_at: DateTime<Utc>,

    pub version: u64,
}

impl Volume {
    /// Record a volume the cloud has accepted a create for
    pub fn provisioned(
        id: VolumeId,
        capacity_gib: u64,
        zone: impl Into<String>,
        encrypted: bool,
        class: &StorageClass,
        idempotency_token: impl Into<String>,
    ) -> Result<Self, VolumeError> {
        if capacity_gib == 0 {
            return Err(VolumeError::InvalidCapacity(
                "Capacity must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            id,
            capacity_gib,
            zone: zone.into(),
            encrypted,
            state: VolumeState::Creating,
            attachment: AttachmentState::Detached,
            attached_node: None,
            bound_claim: None,
            storage_class: class.name.clone(),
            reclaim_policy: class.reclaim_policy,
            fs_type: class.parameters.fs_type,
            idempotency_token: idempotency_token.into(),
            pending_resize_gib: None,
            retained: false,
            created_at: Utc::now(),
            version: 0,
        })
    }

    // ========================================================================
    // Binding Commands
    // ========================================================================

    pub fn mark_available(&mut self) -> Result<(), VolumeError> {
        match self.state {
            VolumeState::Available => Ok(()),
            VolumeState::Creating => {
                self.state = VolumeState::Available;
                Ok(())
            }
            from => Err(VolumeError::InvalidStateTransition {
                from,
                to: VolumeState::Available,
            }),
        }
    }

    pub fn mark_failed(&mut self) {
        self.state = VolumeState::Failed;
    }

    /// Bind to `claim`. Rebinding to the same claim is a no-op.
    pub fn bind(&mut self, claim: ClaimId) -> Result<(), VolumeError> {
        if let Some(existing) = self.bound_claim {
            if existing == claim {
                return Ok(());
            }
            return Err(VolumeError::AlreadyBound {
                volume_id: self.id.clone(),
                claim_id: existing,
            });
        }
        if self.state != VolumeState::Available {
            return Err(VolumeError::InvalidStateTransition {
                from: self.state,
                to: VolumeState::Bound,
            });
        }
        self.state = VolumeState::Bound;
        self.bound_claim = Some(claim);
        self.retained = false;
        Ok(())
    }

    /// Drop the binding and return to the pool
    pub fn unbind(&mut self) {
        if self.state == VolumeState::Bound {
            self.state = VolumeState::Available;
        }
        self.bound_claim = None;
    }

    /// Claim deleted under the Delete policy
    pub fn release(&mut self) -> Result<(), VolumeError> {
        match self.state {
            VolumeState::Releasing => Ok(()),
            VolumeState::Bound => {
                self.state = VolumeState::Releasing;
                Ok(())
            }
            from => Err(VolumeError::InvalidStateTransition {
                from,
                to: VolumeState::Releasing,
            }),
        }
    }

    /// Claim deleted under the Retain policy. The volume survives, unbound.
    pub fn retain(&mut self) -> Result<(), VolumeError> {
        match self.state {
            VolumeState::Available if self.retained => Ok(()),
            VolumeState::Bound => {
                self.state = VolumeState::Available;
                self.bound_claim = None;
                self.retained = true;
                Ok(())
            }
            from => Err(VolumeError::InvalidStateTransition {
                from,
                to: VolumeState::Available,
            }),
        }
    }

    /// Cloud delete succeeded (or the volume was already gone)
    pub fn mark_deleted(&mut self) -> Result<(), VolumeError> {
        match self.state {
            VolumeState::Deleted => Ok(()),
            VolumeState::Releasing | VolumeState::Failed | VolumeState::Creating => {
                self.state = VolumeState::Deleted;
                self.bound_claim = None;
                Ok(())
            }
            VolumeState::Available if self.bound_claim.is_none() => {
                self.state = VolumeState::Deleted;
                Ok(())
            }
            from => Err(VolumeError::InvalidStateTransition {
                from,
                to: VolumeState::Deleted,
            }),
        }
    }

    // ========================================================================
    // Attachment Commands
    // ========================================================================

    /// Start attaching to `node`. At most one attach or detach is ever outstanding.
    pub fn begin_attach(&mut self, node: &NodeId) -> Result<(), VolumeError> {
        match self.attachment {
            AttachmentState::Detached => {
                self.attachment = AttachmentState::Attaching;
                self.attached_node = Some(node.clone());
                Ok(())
            }
            AttachmentState::Attaching | AttachmentState::Attached
                if self.attached_node.as_ref() == Some(node) =>
            {
                Ok(())
            }
            AttachmentState::Detaching => Err(VolumeError::Busy {
                volume_id: self.id.clone(),
                in_flight: AttachmentState::Detaching,
            }),
            _ => Err(VolumeError::AttachedElsewhere {
                volume_id: self.id.clone(),
                node: self.attached_node.clone().unwrap_or_else(|| node.clone()),
            }),
        }
    }

    pub fn complete_attach(&mut self) -> Result<(), VolumeError> {
        match self.attachment {
            AttachmentState::Attached => Ok(()),
            AttachmentState::Attaching => {
                self.attachment = AttachmentState::Attached;
                Ok(())
            }
            from => Err(VolumeError::AttachmentTransition {
                from,
                to: AttachmentState::Attached,
            }),
        }
    }

    pub fn begin_detach(&mut self) -> Result<(), VolumeError> {
        match self.attachment {
            AttachmentState::Detached | AttachmentState::Detaching => Ok(()),
            AttachmentState::Attached => {
                self.attachment = AttachmentState::Detaching;
                Ok(())
            }
            AttachmentState::Attaching => Err(VolumeError::Busy {
                volume_id: self.id.clone(),
                in_flight: AttachmentState::Attaching,
            }),
        }
    }

    pub fn complete_detach(&mut self) -> Result<(), VolumeError> {
        match self.attachment {
            AttachmentState::Detached => Ok(()),
            AttachmentState::Detaching => {
                self.attachment = AttachmentState::Detached;
                self.attached_node = None;
                Ok(())
            }
            from => Err(VolumeError::AttachmentTransition {
                from,
                to: AttachmentState::Detached,
            }),
        }
    }

    // ========================================================================
    // Expansion
    // ========================================================================

    pub fn request_resize(&mut self, new_capacity_gib: u64) -> Result<(), VolumeError> {
        if new_capacity_gib < self.capacity_gib {
            return Err(VolumeError::InvalidCapacity(format!(
                "Volume {} cannot shrink from {} GiB to {} GiB",
                self.id, self.capacity_gib, new_capacity_gib
            )));
        }
        if new_capacity_gib > self.capacity_gib {
            self.pending_resize_gib = Some(new_capacity_gib);
        }
        Ok(())
    }

    /// Filesystem has grown into the new capacity
    pub fn confirm_resize(&mut self) -> Option<u64> {
        let target = self.pending_resize_gib.take()?;
        self.capacity_gib = target;
        Some(target)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_detached(&self) -> bool {
        self.attachment == AttachmentState::Detached
    }

    pub fn is_attached_to(&self, node: &NodeId) -> bool {
        self.attachment == AttachmentState::Attached && self.attached_node.as_ref() == Some(node)
    }

    /// Capacity the volume will have once pending expansion completes
    pub fn target_capacity_gib(&self) -> u64 {
        self.pending_resize_gib.unwrap_or(self.capacity_gib)
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum VolumeError {
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: VolumeState, to: VolumeState },

    #[error("Invalid attachment transition from {from:?} to {to:?}")]
    AttachmentTransition {
        from: AttachmentState,
        to: AttachmentState,
    },

    #[error("Volume {volume_id} is already bound to claim {claim_id}")]
    AlreadyBound { volume_id: VolumeId, claim_id: ClaimId },

    #[error("Volume {volume_id} is busy: {in_flight:?} still in flight")]
    Busy {
        volume_id: VolumeId,
        in_flight: AttachmentState,
    },

    #[error("Volume {volume_id} is attached to node {node}")]
    AttachedElsewhere { volume_id: VolumeId, node: NodeId },
}

// ============================================================================
// Tests
// ============================================================================
