// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! VolumeAttachment - the placement record shared by the attach/detach
//! controller and the node mount agent.
//!
//! There is one record per volume, so a volume can never have two
//! outstanding attachment operations recorded at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::node::NodeId;
use crate::domain::volume::VolumeId;

const TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6165_6769_735f_6174_7461_6368_6d65_6e74);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentPhase {
    Requested,
    Attached,
    DetachRequested,
    Detached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachment {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    pub phase: AttachmentPhase,
    /// Incremented for every new placement of the volume
    pub generation: u32,
    pub requested_at: DateTime<Utc>,
    pub attached_at: Option<DateTime<Utc>>,
    /// Device hint reported by the cloud
    pub device_hint: Option<String>,
    /// Set by the mount agent once the filesystem is mounted
    pub mount_target: Option<PathBuf>,
    pub ready: bool,
    /// Mount agent has unmounted; detach may proceed
    pub node_released: bool,
    pub failures: u32,
    pub last_error: Option<String>,
    pub timed_out: bool,
    pub version: u64,
}

impl VolumeAttachment {
    pub fn new(volume_id: VolumeId, node_id: NodeId) -> Self {
        Self {
            volume_id,
            node_id,
            phase: AttachmentPhase::Requested,
            generation: 0,
            requested_at: Utc::now(),
            attached_at: None,
            device_hint: None,
            mount_target: None,
            ready: false,
            node_released: false,
            failures: 0,
            last_error: None,
            timed_out: false,
            version: 0,
        }
    }

    /// Reuse a finished record for a new placement
    pub fn reassign(&mut self, node_id: NodeId, now: DateTime<Utc>) -> Result<(), AttachmentError> {
        if self.phase != AttachmentPhase::Detached {
            return Err(AttachmentError::InvalidTransition {
                from: self.phase,
                to: AttachmentPhase::Requested,
            });
        }
        self.node_id = node_id;
        self.phase = AttachmentPhase::Requested;
        self.generation += 1;
        self.requested_at = now;
        self.attached_at = None;
        self.device_hint = None;
        self.mount_target = None;
        self.ready = false;
        self.node_released = false;
        self.failures = 0;
        self.last_error = None;
        self.timed_out = false;
        Ok(())
    }

    /// Token for a cloud attach/detach issued for this placement
    pub fn idempotency_token(&self, operation: &str) -> String {
        let name = format!("{}:{}:{}:{}", self.volume_id, self.node_id, operation, self.generation);
        Uuid::new_v5(&TOKEN_NAMESPACE, name.as_bytes()).to_string()
    }

    pub fn mark_attached(&mut self, device_hint: Option<String>) -> Result<(), AttachmentError> {
        match self.phase {
            AttachmentPhase::Attached => Ok(()),
            AttachmentPhase::Requested => {
                self.phase = AttachmentPhase::Attached;
                self.attached_at = Some(Utc::now());
                self.device_hint = device_hint;
                self.failures = 0;
                self.last_error = None;
                self.timed_out = false;
                Ok(())
            }
            from => Err(AttachmentError::InvalidTransition {
                from,
                to: AttachmentPhase::Attached,
            }),
        }
    }

    pub fn request_detach(&mut self) -> Result<(), AttachmentError> {
        match self.phase {
            AttachmentPhase::DetachRequested | AttachmentPhase::Detached => Ok(()),
            AttachmentPhase::Attached => {
                // Unmounting gets its own retry budget
                self.phase = AttachmentPhase::DetachRequested;
                self.failures = 0;
                self.last_error = None;
                Ok(())
            }
            from => Err(AttachmentError::InvalidTransition {
                from,
                to: AttachmentPhase::DetachRequested,
            }),
        }
    }

    /// Mount agent reports the filesystem mounted and usable
    pub fn mark_ready(&mut self, target: PathBuf) {
        self.mount_target = Some(target);
        self.ready = true;
        self.failures = 0;
        self.last_error = None;
    }

    /// Mount agent has unmounted; the device may be detached
    pub fn release_by_node(&mut self) {
        self.ready = false;
        self.node_released = true;
    }

    pub fn mark_detached(&mut self) {
        self.phase = AttachmentPhase::Detached;
        self.ready = false;
        self.mount_target = None;
        self.failures = 0;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failures += 1;
        self.last_error = Some(error.into());
    }

    pub fn mark_timed_out(&mut self) {
        self.timed_out = true;
    }

    /// A placement is in progress or established
    pub fn is_active(&self) -> bool {
        self.phase != AttachmentPhase::Detached
    }

    pub fn waited(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.requested_at
    }
}

#[derive(Debug, Clone, Error)]
pub enum AttachmentError {
    #[error("Invalid attachment transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: AttachmentPhase,
        to: AttachmentPhase,
    },
}
