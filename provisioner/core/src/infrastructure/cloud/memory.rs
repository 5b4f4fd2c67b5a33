// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Simulated block-storage provider
//!
//! In-process backend with the provider semantics the controllers depend on:
//! idempotent zone-scoped create, asynchronous attach/detach that settle after
//! a number of `describe` polls, and conflict on deleting an attached volume.
//! Fault injection (throttling, latency, failed creates, stalled attaches,
//! out-of-band deletion) drives the failure-path tests and the dev control
//! plane.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::domain::cloud::{
    CloudAttachment, CloudAttachmentState, CloudBlockStorageClient, CloudError, CloudSnapshot,
    CloudVolume, CloudVolumeState, CreateVolumeRequest, SnapshotId, IDEMPOTENCY_TAG,
};
use crate::domain::credential::Credential;
use crate::domain::node::NodeId;
use crate::domain::volume::VolumeId;

/// Number of calls the simulated provider received, per operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudCallCounts {
    pub create: usize,
    pub delete: usize,
    pub attach: usize,
    pub detach: usize,
    pub describe: usize,
    pub modify: usize,
    pub find_by_token: usize,
    pub snapshot: usize,
    pub tag: usize,
}

impl CloudCallCounts {
    pub fn total(&self) -> usize {
        self.create
            + self.delete
            + self.attach
            + self.detach
            + self.describe
            + self.modify
            + self.find_by_token
            + self.snapshot
            + self.tag
    }
}

struct SimVolume {
    volume: CloudVolume,
    /// Describe polls left before the in-flight transition settles
    pending_polls: u32,
}

#[derive(Default)]
struct SimState {
    volumes: HashMap<VolumeId, SimVolume>,
    tokens: HashMap<String, VolumeId>,
    snapshots: HashMap<String, CloudSnapshot>,
    next_id: u64,
    throttle_remaining: u32,
    fail_next_create: bool,
    stall_attach: bool,
    calls: CloudCallCounts,
}

pub struct SimulatedCloud {
    state: Mutex<SimState>,
    latency: Mutex<Duration>,
    settle_polls: u32,
}

impl SimulatedCloud {
    /// Transitions settle on the first describe
    pub fn new() -> Self {
        Self::with_settle_polls(1)
    }

    pub fn with_settle_polls(settle_polls: u32) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            latency: Mutex::new(Duration::ZERO),
            settle_polls,
        }
    }

    /// Answer the next `n` calls with `Throttled`
    pub fn throttle_next(&self, n: u32) {
        self.state.lock().throttle_remaining = n;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// The next new volume ends up in the `Error` state
    pub fn fail_next_create(&self) {
        self.state.lock().fail_next_create = true;
    }

    /// Attachments never settle while set
    pub fn stall_attach(&self, stall: bool) {
        self.state.lock().stall_attach = stall;
    }

    /// Delete a volume behind the provisioner's back
    pub fn remove_out_of_band(&self, volume_id: &VolumeId) {
        let mut state = self.state.lock();
        state.volumes.remove(volume_id);
        state.tokens.retain(|_, id| id != volume_id);
    }

    pub fn volume(&self, volume_id: &VolumeId) -> Option<CloudVolume> {
        self.state
            .lock()
            .volumes
            .get(volume_id)
            .map(|v| v.volume.clone())
    }

    pub fn volumes(&self) -> Vec<CloudVolume> {
        self.state
            .lock()
            .volumes
            .values()
            .map(|v| v.volume.clone())
            .collect()
    }

    pub fn calls(&self) -> CloudCallCounts {
        self.state.lock().calls.clone()
    }

    /// Common preamble: latency, call accounting, credential and throttling
    async fn enter(
        &self,
        credential: &Credential,
        count: impl FnOnce(&mut CloudCallCounts),
    ) -> Result<(), CloudError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        count(&mut state.calls);

        if credential.access_token().is_empty() || credential.expires_at <= Utc::now() {
            return Err(CloudError::Unauthorized("credential expired".to_string()));
        }
        if state.throttle_remaining > 0 {
            state.throttle_remaining -= 1;
            return Err(CloudError::Throttled("request rate exceeded".to_string()));
        }
        Ok(())
    }
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudBlockStorageClient for SimulatedCloud {
    async fn create_volume(
        &self,
        credential: &Credential,
        request: &CreateVolumeRequest,
        idempotency_token: &str,
    ) -> Result<CloudVolume, CloudError> {
        self.enter(credential, |c| c.create += 1).await?;

        if request.zone.is_empty() {
            return Err(CloudError::InvalidRequest("zone is required".to_string()));
        }
        if request.capacity_gib == 0 {
            return Err(CloudError::InvalidRequest("capacity must be positive".to_string()));
        }

        let mut state = self.state.lock();
        if let Some(existing) = state.tokens.get(idempotency_token).cloned() {
            if let Some(sim) = state.volumes.get(&existing) {
                debug!(volume_id = %existing, "Replayed create returns existing volume");
                return Ok(sim.volume.clone());
            }
        }

        state.next_id += 1;
        let id = VolumeId::new(format!("vol-{:08x}", state.next_id));
        let failed = std::mem::take(&mut state.fail_next_create);

        let mut tags = request.tags.clone();
        tags.insert(IDEMPOTENCY_TAG.to_string(), idempotency_token.to_string());

        let volume = CloudVolume {
            id: id.clone(),
            capacity_gib: request.capacity_gib,
            zone: request.zone.clone(),
            encrypted: request.encrypted,
            state: if failed {
                CloudVolumeState::Error
            } else if self.settle_polls == 0 {
                CloudVolumeState::Available
            } else {
                CloudVolumeState::Creating
            },
            attachment: None,
            tags,
        };
        state.volumes.insert(
            id.clone(),
            SimVolume {
                volume: volume.clone(),
                pending_polls: self.settle_polls,
            },
        );
        state.tokens.insert(idempotency_token.to_string(), id);
        Ok(volume)
    }

    async fn delete_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.enter(credential, |c| c.delete += 1).await?;

        let mut state = self.state.lock();
        let sim = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        if sim.volume.attachment.is_some() {
            return Err(CloudError::Conflict(format!("{} is attached", volume_id)));
        }
        state.volumes.remove(volume_id);
        state.tokens.retain(|_, id| id != volume_id);
        Ok(())
    }

    async fn attach_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        node_id: &NodeId,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.enter(credential, |c| c.attach += 1).await?;

        let settle_polls = self.settle_polls;
        let mut state = self.state.lock();
        let sim = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;

        if let Some(attachment) = &sim.volume.attachment {
            if attachment.node_id == *node_id && attachment.state != CloudAttachmentState::Detaching {
                return Ok(());
            }
            return Err(CloudError::Conflict(format!(
                "{} is {:?} on {}",
                volume_id, attachment.state, attachment.node_id
            )));
        }
        if sim.volume.state != CloudVolumeState::Available {
            return Err(CloudError::Conflict(format!(
                "{} is {:?}",
                volume_id, sim.volume.state
            )));
        }

        let settled = settle_polls == 0;
        sim.volume.attachment = Some(CloudAttachment {
            node_id: node_id.clone(),
            state: if settled {
                CloudAttachmentState::Attached
            } else {
                CloudAttachmentState::Attaching
            },
            device_hint: settled.then(|| format!("/dev/disk/by-id/aegis-{}", volume_id)),
        });
        if settled {
            sim.volume.state = CloudVolumeState::InUse;
        }
        sim.pending_polls = settle_polls;
        Ok(())
    }

    async fn detach_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        node_id: &NodeId,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.enter(credential, |c| c.detach += 1).await?;

        let settle_polls = self.settle_polls;
        let mut state = self.state.lock();
        let sim = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;

        let current = sim
            .volume
            .attachment
            .as_ref()
            .map(|a| (a.node_id.clone(), a.state));
        match current {
            None => Ok(()),
            Some((attached_to, _)) if attached_to != *node_id => Err(CloudError::Conflict(format!(
                "{} is attached to {}",
                volume_id, attached_to
            ))),
            Some((_, CloudAttachmentState::Detaching)) => Ok(()),
            Some(_) => {
                if settle_polls == 0 {
                    sim.volume.attachment = None;
                    sim.volume.state = CloudVolumeState::Available;
                } else if let Some(attachment) = sim.volume.attachment.as_mut() {
                    attachment.state = CloudAttachmentState::Detaching;
                    sim.pending_polls = settle_polls;
                }
                Ok(())
            }
        }
    }

    async fn describe_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
    ) -> Result<CloudVolume, CloudError> {
        self.enter(credential, |c| c.describe += 1).await?;

        let mut state = self.state.lock();
        let stall_attach = state.stall_attach;
        let sim = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;

        let attaching = sim.volume.attachment_state() == CloudAttachmentState::Attaching;
        if sim.pending_polls > 0 && !(attaching && stall_attach) {
            sim.pending_polls -= 1;
        }
        if sim.pending_polls == 0 {
            settle(&mut sim.volume, stall_attach);
        }
        Ok(sim.volume.clone())
    }

    async fn modify_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        capacity_gib: u64,
        _idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.enter(credential, |c| c.modify += 1).await?;

        let mut state = self.state.lock();
        let sim = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        if capacity_gib < sim.volume.capacity_gib {
            return Err(CloudError::InvalidRequest(format!(
                "cannot shrink {} from {}GiB to {}GiB",
                volume_id, sim.volume.capacity_gib, capacity_gib
            )));
        }
        sim.volume.capacity_gib = capacity_gib;
        Ok(())
    }

    async fn find_by_token(
        &self,
        credential: &Credential,
        idempotency_token: &str,
    ) -> Result<Option<CloudVolume>, CloudError> {
        self.enter(credential, |c| c.find_by_token += 1).await?;

        let state = self.state.lock();
        Ok(state
            .tokens
            .get(idempotency_token)
            .and_then(|id| state.volumes.get(id))
            .map(|sim| sim.volume.clone()))
    }

    async fn create_snapshot(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        idempotency_token: &str,
    ) -> Result<CloudSnapshot, CloudError> {
        self.enter(credential, |c| c.snapshot += 1).await?;

        let mut state = self.state.lock();
        if let Some(existing) = state.snapshots.get(idempotency_token) {
            return Ok(existing.clone());
        }
        let capacity_gib = state
            .volumes
            .get(volume_id)
            .map(|sim| sim.volume.capacity_gib)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        state.next_id += 1;
        let snapshot = CloudSnapshot {
            id: SnapshotId(format!("snap-{:08x}", state.next_id)),
            volume_id: volume_id.clone(),
            capacity_gib,
            created_at: Utc::now(),
        };
        state
            .snapshots
            .insert(idempotency_token.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    async fn create_tags(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError> {
        self.enter(credential, |c| c.tag += 1).await?;

        let mut state = self.state.lock();
        let sim = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        sim.volume
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Complete whatever transition the volume was waiting on
fn settle(volume: &mut CloudVolume, stall_attach: bool) {
    if volume.state == CloudVolumeState::Creating {
        volume.state = CloudVolumeState::Available;
    }
    let device_hint = format!("/dev/disk/by-id/aegis-{}", volume.id);
    match volume.attachment.as_ref().map(|a| a.state) {
        Some(CloudAttachmentState::Attaching) if !stall_attach => {
            if let Some(attachment) = volume.attachment.as_mut() {
                attachment.state = CloudAttachmentState::Attached;
                attachment.device_hint = Some(device_hint);
            }
            volume.state = CloudVolumeState::InUse;
        }
        Some(CloudAttachmentState::Detaching) => {
            volume.attachment = None;
            volume.state = CloudVolumeState::Available;
        }
        _ => {}
    }
}
