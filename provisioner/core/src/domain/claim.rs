// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! VolumeClaim aggregate
//!
//! A claim is a workload's request for durable storage. It records the
//! provisioning intent before any cloud call is made, so a crash between
//! `Create` and persisting the result is recovered through the same
//! idempotency token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::node::NodeId;
use crate::domain::volume::VolumeId;

/// Namespace for idempotency tokens derived from claims
const TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6165_6769_735f_7072_6f76_6973_696f_6e72);

// ============================================================================
// Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(pub Uuid);

impl ClaimId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessMode {
    #[default]
    SingleWriter,
    ManyReaders,
    ManyWriters,
}

impl AccessMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ManyReaders)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    Pending,
    Bound,
    /// The bound volume disappeared from the cloud
    Lost,
    Terminating,
}

/// Where the scheduler placed the claim's consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHint {
    pub node: NodeId,

    /// Path the workload expects the filesystem at
    pub target_path: PathBuf,

    pub placed_at: DateTime<Utc>,
}

/// In-flight provisioning intent, persisted before `Create` is issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningAttempt {
    pub generation: u32,
    pub token: String,
    pub zone: String,
    /// Known once the cloud has accepted the create
    pub volume_id: Option<VolumeId>,
    pub started_at: DateTime<Utc>,
}

/// Observable reconcile status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimStatus {
    pub reason: Option<String>,
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for ClaimStatus {
    fn default() -> Self {
        Self {
            reason: None,
            message: None,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        }
    }
}

// ============================================================================
// Aggregate Root: VolumeClaim
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaim {
    pub id: ClaimId,
    pub name: String,
    pub requested_gib: u64,
    pub access_mode: AccessMode,
    pub storage_class: String,
    pub state: ClaimState,
    pub bound_volume: Option<VolumeId>,
    pub consumer: Option<ConsumerHint>,
    pub deletion_requested_at: Option<DateTime<Utc>>,
    pub provisioning: Option<ProvisioningAttempt>,
    /// Bumped every time a failed provisioning attempt is abandoned
    pub generation: u32,
    pub status: ClaimStatus,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl VolumeClaim {
    pub fn new(
        name: impl Into<String>,
        requested_gib: u64,
        access_mode: AccessMode,
        storage_class: impl Into<String>,
    ) -> Result<Self, ClaimError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ClaimError::InvalidName("Claim name cannot be empty".to_string()));
        }
        if requested_gib == 0 {
            return Err(ClaimError::InvalidSize(
                "Requested size must be greater than zero".to_string(),
            ));
        }
        let storage_class = storage_class.into();
        if storage_class.trim().is_empty() {
            return Err(ClaimError::InvalidName(format!(
                "Claim {} does not reference a storage class",
                name
            )));
        }

        Ok(Self {
            id: ClaimId::new(),
            name,
            requested_gib,
            access_mode,
            storage_class,
            state: ClaimState::Pending,
            bound_volume: None,
            consumer: None,
            deletion_requested_at: None,
            provisioning: None,
            generation: 0,
            status: ClaimStatus::default(),
            created_at: Utc::now(),
            version: 0,
        })
    }

    /// Deterministic token for a mutating cloud call made on behalf of this claim
    pub fn idempotency_token(&self, operation: &str, discriminator: u64) -> String {
        let name = format!("{}:{}:{}", self.id, operation, discriminator);
        Uuid::new_v5(&TOKEN_NAMESPACE, name.as_bytes()).to_string()
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Record the intent to provision in `zone`. Returns the existing attempt if one is open.
    pub fn begin_provisioning(&mut self, zone: &str) -> &ProvisioningAttempt {
        let generation = self.generation;
        let token = self.idempotency_token("provision", u64::from(generation));
        self.provisioning.get_or_insert_with(|| ProvisioningAttempt {
            generation,
            token,
            zone: zone.to_string(),
            volume_id: None,
            started_at: Utc::now(),
        })
    }

    pub fn record_provisioned_volume(&mut self, volume_id: VolumeId) {
        if let Some(attempt) = self.provisioning.as_mut() {
            attempt.volume_id = Some(volume_id);
        }
    }

    /// Give up on the current attempt; the next one uses a fresh token
    pub fn abandon_provisioning(&mut self) {
        if self.provisioning.take().is_some() {
            self.generation += 1;
        }
    }

    // ========================================================================
    // Binding
    // ========================================================================

    pub fn bind(&mut self, volume_id: VolumeId) -> Result<(), ClaimError> {
        if let Some(existing) = &self.bound_volume {
            if *existing == volume_id {
                return Ok(());
            }
            return Err(ClaimError::AlreadyBound {
                claim_id: self.id,
                volume_id: existing.clone(),
            });
        }
        if self.state != ClaimState::Pending {
            return Err(ClaimError::InvalidStateTransition {
                from: self.state,
                to: ClaimState::Bound,
            });
        }
        self.state = ClaimState::Bound;
        self.bound_volume = Some(volume_id);
        self.provisioning = None;
        Ok(())
    }

    pub fn unbind(&mut self) {
        self.bound_volume = None;
        if self.state == ClaimState::Bound || self.state == ClaimState::Lost {
            self.state = ClaimState::Pending;
        }
    }

    pub fn mark_lost(&mut self) {
        if self.state != ClaimState::Terminating {
            self.state = ClaimState::Lost;
        }
    }

    // ========================================================================
    // Consumer placement and lifecycle
    // ========================================================================

    pub fn place_consumer(&mut self, node: NodeId, target_path: PathBuf) {
        self.consumer = Some(ConsumerHint {
            node,
            target_path,
            placed_at: Utc::now(),
        });
    }

    pub fn clear_consumer(&mut self) {
        self.consumer = None;
    }

    pub fn request_resize(&mut self, new_gib: u64) -> Result<(), ClaimError> {
        if new_gib < self.requested_gib {
            return Err(ClaimError::InvalidSize(format!(
                "Claim {} cannot shrink from {} GiB to {} GiB",
                self.name, self.requested_gib, new_gib
            )));
        }
        self.requested_gib = new_gib;
        Ok(())
    }

    /// First phase of deletion; the claim stays until its volume is reclaimed
    pub fn request_deletion(&mut self) {
        if self.deletion_requested_at.is_none() {
            self.deletion_requested_at = Some(Utc::now());
        }
        self.state = ClaimState::Terminating;
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_requested_at.is_some()
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn set_status(&mut self, reason: &str, message: impl Into<String>) {
        self.status.reason = Some(reason.to_string());
        self.status.message = Some(message.into());
        self.status.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, reason: &str, message: impl Into<String>) {
        self.set_status(reason, message);
        self.status.consecutive_failures += 1;
    }

    pub fn clear_status(&mut self) {
        self.status = ClaimStatus::default();
    }

    pub fn status_reason(&self) -> Option<&str> {
        self.status.reason.as_deref()
    }
}

#[derive(Debug, Clone, Error)]
pub enum ClaimError {
    #[error("Invalid claim name: {0}")]
    InvalidName(String),

    #[error("Invalid claim size: {0}")]
    InvalidSize(String),

    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: ClaimState, to: ClaimState },

    #[error("Claim {claim_id} is already bound to volume {volume_id}")]
    AlreadyBound { claim_id: ClaimId, volume_id: VolumeId },
}
