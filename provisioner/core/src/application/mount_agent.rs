// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Node Mount Agent
//!
//! Runs once per node. Watches attachments assigned to its node and makes the
//! local filesystem match: format blank devices, mount at the consumer's
//! target path, grow the filesystem after a resize, and unmount before the
//! controller may detach.
//!
//! A device that already carries a filesystem is never formatted, whatever
//! the storage class asks for.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::controller::{Reconciler, Requeue};
use crate::domain::attachment::{AttachmentPhase, VolumeAttachment};
use crate::domain::claim::AccessMode;
use crate::domain::error::ProvisioningError;
use crate::domain::events::{MountEvent, ResourceChange, VolumeEvent};
use crate::domain::mount::{MountError, Mounter};
use crate::domain::node::NodeId;
use crate::domain::repository::{ResourceKind, ResourceStores};
use crate::domain::volume::{Volume, VolumeId};
use crate::infrastructure::event_bus::{DomainEvent, EventBus};

#[derive(Debug, Clone)]
pub struct MountAgentSettings {
    /// Consecutive failures after which the agent stops retrying a mount
    pub max_mount_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for MountAgentSettings {
    fn default() -> Self {
        Self {
            max_mount_attempts: 5,
            poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct NodeMountAgent {
    node_id: NodeId,
    stores: ResourceStores,
    mounter: Arc<dyn Mounter>,
    event_bus: Arc<EventBus>,
    settings: MountAgentSettings,
}

/// Where and how the consumer wants the filesystem
struct MountTarget {
    path: PathBuf,
    read_only: bool,
}

impl NodeMountAgent {
    pub fn new(
        node_id: NodeId,
        stores: ResourceStores,
        mounter: Arc<dyn Mounter>,
        event_bus: Arc<EventBus>,
        settings: MountAgentSettings,
    ) -> Self {
        Self {
            node_id,
            stores,
            mounter,
            event_bus,
            settings,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn mount_target(&self, volume: &Volume) -> Result<Option<MountTarget>, ProvisioningError> {
        let Some(claim_id) = volume.bound_claim else {
            return Ok(None);
        };
        let Some(claim) = self.stores.claims.get(&claim_id).await? else {
            return Ok(None);
        };
        Ok(claim
            .consumer
            .filter(|hint| hint.node == self.node_id)
            .map(|hint| MountTarget {
                path: hint.target_path,
                read_only: claim.access_mode == AccessMode::ManyReaders,
            }))
    }

    /// Failures on this placement have used up the retry budget
    fn exhausted(&self, attachment: &VolumeAttachment) -> bool {
        if attachment.failures >= self.settings.max_mount_attempts {
            debug!(
                volume_id = %attachment.volume_id,
                failures = attachment.failures,
                phase = ?attachment.phase,
                "Mount operation attempts exhausted"
            );
            return true;
        }
        false
    }

    async fn mount(&self, mut attachment: VolumeAttachment, volume: Volume) -> Result<Requeue, ProvisioningError> {
        if self.exhausted(&attachment) {
            return Ok(Requeue::Never);
        }
        let Some(target) = self.mount_target(&volume).await? else {
            // Consumer moved on; the controller will request a detach
            return Ok(Requeue::Never);
        };

        let formatted = match self.prepare_and_mount(&volume, &target).await {
            Ok(formatted) => formatted,
            Err(e) => return Err(self.fail(attachment, e).await),
        };

        attachment.mark_ready(target.path.clone());
        self.stores.attachments.update(&attachment).await?;

        info!(
            volume_id = %volume.id,
            node_id = %self.node_id,
            target = %target.path.display(),
            formatted,
            read_only = target.read_only,
            "Volume mounted"
        );
        counter!("aegis_provisioner_mounts_total").increment(1);
        self.event_bus.publish_mount_event(MountEvent::VolumeMounted {
            volume_id: volume.id.clone(),
            node_id: self.node_id.clone(),
            target: target.path,
            formatted,
            mounted_at: Utc::now(),
        });

        if volume.pending_resize_gib.is_some() {
            return Ok(Requeue::Immediately);
        }
        Ok(Requeue::Never)
    }

    /// Returns whether the device had to be formatted
    async fn prepare_and_mount(&self, volume: &Volume, target: &MountTarget) -> Result<bool, MountError> {
        let device = self
            .mounter
            .find_device(&volume.id)
            .await?
            .ok_or_else(|| MountError::DeviceNotFound(volume.id.to_string()))?;

        let (fs_type, formatted) = match self.mounter.detect_filesystem(&device).await? {
            Some(existing) => {
                if existing != volume.fs_type {
                    warn!(
                        volume_id = %volume.id,
                        existing = %existing,
                        requested = %volume.fs_type,
                        "Keeping existing filesystem"
                    );
                }
                (existing, false)
            }
            None => {
                self.mounter.format(&device, volume.fs_type).await?;
                (volume.fs_type, true)
            }
        };

        self.mounter
            .mount(&device, &target.path, fs_type, target.read_only)
            .await?;
        Ok(formatted)
    }

    async fn grow_filesystem(&self, attachment: VolumeAttachment, mut volume: Volume) -> Result<Requeue, ProvisioningError> {
        if self.exhausted(&attachment) {
            return Ok(Requeue::Never);
        }
        let Some(target) = attachment.mount_target.clone() else {
            return Ok(Requeue::Never);
        };
        let grown = async {
            let device = self
                .mounter
                .find_device(&volume.id)
                .await?
                .ok_or_else(|| MountError::DeviceNotFound(volume.id.to_string()))?;
            let fs_type = self
                .mounter
                .detect_filesystem(&device)
                .await?
                .unwrap_or(volume.fs_type);
            self.mounter.resize_filesystem(&device, &target, fs_type).await
        }
        .await;
        if let Err(e) = grown {
            return Err(self.fail(attachment, e).await);
        }

        if let Some(capacity_gib) = volume.confirm_resize() {
            self.stores.volumes.update(&volume).await?;
            info!(volume_id = %volume.id, capacity_gib, "Filesystem resized");
            self.event_bus.publish_volume_event(VolumeEvent::FilesystemResized {
                volume_id: volume.id.clone(),
                capacity_gib,
                resized_at: Utc::now(),
            });
        }
        Ok(Requeue::Never)
    }

    async fn unmount(&self, mut attachment: VolumeAttachment) -> Result<Requeue, ProvisioningError> {
        if self.exhausted(&attachment) {
            return Ok(Requeue::Never);
        }
        if let Some(target) = attachment.mount_target.clone() {
            if let Err(e) = self.mounter.unmount(&target).await {
                return Err(self.fail(attachment, e).await);
            }
        }

        attachment.release_by_node();
        self.stores.attachments.update(&attachment).await?;

        info!(volume_id = %attachment.volume_id, node_id = %self.node_id, "Volume unmounted");
        self.event_bus.publish_mount_event(MountEvent::VolumeUnmounted {
            volume_id: attachment.volume_id.clone(),
            node_id: self.node_id.clone(),
            unmounted_at: Utc::now(),
        });
        Ok(Requeue::Never)
    }

    async fn fail(&self, mut attachment: VolumeAttachment, err: MountError) -> ProvisioningError {
        attachment.record_failure(err.to_string());
        let attempt = attachment.failures;
        let terminal = attempt >= self.settings.max_mount_attempts;
        if terminal {
            error!(
                volume_id = %attachment.volume_id,
                node_id = %self.node_id,
                attempt,
                "Mount failed permanently: {}",
                err
            );
        } else {
            warn!(volume_id = %attachment.volume_id, attempt, "Mount failed: {}", err);
        }
        counter!("aegis_provisioner_mount_failures_total").increment(1);

        if let Err(e) = self.stores.attachments.update(&attachment).await {
            debug!(volume_id = %attachment.volume_id, "Attachment status update lost a race: {}", e);
        }
        self.event_bus.publish_mount_event(MountEvent::MountFailed {
            volume_id: attachment.volume_id.clone(),
            node_id: self.node_id.clone(),
            error: err.to_string(),
            attempt,
            terminal,
            failed_at: Utc::now(),
        });

        ProvisioningError::Mount {
            message: err.to_string(),
            terminal,
        }
    }
}

#[async_trait]
impl Reconciler for NodeMountAgent {
    type Key = VolumeId;

    const NAME: &'static str = "node_mount";

    async fn reconcile(&self, key: &VolumeId) -> Result<Requeue, ProvisioningError> {
        let Some(attachment) = self.stores.attachments.get(key).await? else {
            return Ok(Requeue::Never);
        };
        if attachment.node_id != self.node_id {
            return Ok(Requeue::Never);
        }

        match attachment.phase {
            AttachmentPhase::Attached => {
                let Some(volume) = self.stores.volumes.get(key).await? else {
                    return Ok(Requeue::Never);
                };
                if !attachment.ready {
                    self.mount(attachment, volume).await
                } else if volume.pending_resize_gib.is_some() {
                    self.grow_filesystem(attachment, volume).await
                } else {
                    Ok(Requeue::Never)
                }
            }
            AttachmentPhase::DetachRequested if !attachment.node_released => self.unmount(attachment).await,
            _ => Ok(Requeue::Never),
        }
    }

    async fn keys(&self) -> Result<Vec<VolumeId>, ProvisioningError> {
        Ok(self
            .stores
            .attachments
            .list()
            .await?
            .into_iter()
            .filter(|a| a.node_id == self.node_id && a.is_active())
            .map(|a| a.volume_id)
            .collect())
    }

    async fn keys_for_event(&self, event: &DomainEvent) -> Vec<VolumeId> {
        let DomainEvent::Resource(event) = event else {
            return Vec::new();
        };
        if event.change == ResourceChange::Deleted {
            return Vec::new();
        }
        if !matches!(event.kind, ResourceKind::Attachment | ResourceKind::Volume) {
            return Vec::new();
        }
        let volume_id = VolumeId::new(event.key.clone());
        match self.stores.attachments.get(&volume_id).await {
            // Failing mounts retry on their own backoff
            Ok(Some(a)) if a.node_id == self.node_id && a.failures == 0 => vec![volume_id],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{harness, Harness};
    use crate::domain::claim::VolumeClaim;
    use crate::domain::storage_class::{FsType, StorageClass};
    use crate::infrastructure::cloud::SimulatedCloud;
    use crate::infrastructure::mount::InMemoryMounter;
    use std::path::Path;

    struct Fixture {
        h: Harness,
        mounter: Arc<InMemoryMounter>,
        agent: NodeMountAgent,
        volume_id: VolumeId,
    }

    /// A bound claim placed on node-a whose volume the controller has attached
    async fn attached(mode: AccessMode, mounter: InMemoryMounter) -> Fixture {
        let h = harness(SimulatedCloud::with_settle_polls(0));
        let class = StorageClass::new("standard", "p").unwrap();

        let mut claim = VolumeClaim::new("data", 20, mode, "standard").unwrap();
        let mut volume = Volume::provisioned(VolumeId::new("vol-1"), 20, "zone-a", false, &class, "t").unwrap();
        volume.mark_available().unwrap();
        volume.bind(claim.id).unwrap();
        claim.bind(volume.id.clone()).unwrap();
        claim.place_consumer(NodeId::new("node-a"), PathBuf::from("/data"));
        h.stores.claims.create(&claim).await.unwrap();
        h.stores.volumes.create(&volume).await.unwrap();

        let mut attachment = VolumeAttachment::new(volume.id.clone(), NodeId::new("node-a"));
        attachment.mark_attached(None).unwrap();
        h.stores.attachments.create(&attachment).await.unwrap();

        let mounter = Arc::new(mounter);
        let agent = NodeMountAgent::new(
            NodeId::new("node-a"),
            h.stores.clone(),
            mounter.clone(),
            h.bus.clone(),
            MountAgentSettings {
                max_mount_attempts: 2,
                poll_interval: Duration::from_millis(5),
            },
        );
        Fixture {
            h,
            mounter,
            agent,
            volume_id: volume.id,
        }
    }

    #[tokio::test]
    async fn test_blank_device_is_formatted_once() {
        let f = attached(AccessMode::SingleWriter, InMemoryMounter::new()).await;

        f.agent.reconcile(&f.volume_id).await.unwrap();
        f.agent.reconcile(&f.volume_id).await.unwrap();

        assert_eq!(f.mounter.format_count(), 1);
        let record = f.mounter.mount_at(Path::new("/data")).unwrap();
        assert_eq!(record.fs_type, FsType::Ext4);
        assert!(!record.read_only);
        let attachment = f.h.stores.attachments.get(&f.volume_id).await.unwrap().unwrap();
        assert!(attachment.ready);
        assert_eq!(attachment.mount_target, Some(PathBuf::from("/data")));
    }

    #[tokio::test]
    async fn test_existing_filesystem_is_never_formatted() {
        let mounter = InMemoryMounter::new();
        mounter.preformat(&VolumeId::new("vol-1"), FsType::Xfs);
        let f = attached(AccessMode::ManyReaders, mounter).await;

        f.agent.reconcile(&f.volume_id).await.unwrap();

        assert_eq!(f.mounter.format_count(), 0);
        let record = f.mounter.mount_at(Path::new("/data")).unwrap();
        assert_eq!(record.fs_type, FsType::Xfs);
        assert!(record.read_only);
    }

    #[tokio::test]
    async fn test_mount_failures_become_terminal() {
        let f = attached(AccessMode::SingleWriter, InMemoryMounter::without_auto_devices()).await;

        let first = f.agent.reconcile(&f.volume_id).await.unwrap_err();
        assert!(first.is_retryable());
        let second = f.agent.reconcile(&f.volume_id).await.unwrap_err();
        assert!(matches!(second, ProvisioningError::Mount { terminal: true, .. }));

        // Exhausted: the agent stops trying even once the device shows up
        f.mounter.add_device(&f.volume_id);
        assert_eq!(f.agent.reconcile(&f.volume_id).await.unwrap(), Requeue::Never);
        assert!(f.mounter.mount_at(Path::new("/data")).is_none());
    }

    #[tokio::test]
    async fn test_unmount_failures_become_terminal() {
        let f = attached(AccessMode::SingleWriter, InMemoryMounter::new()).await;
        f.agent.reconcile(&f.volume_id).await.unwrap();

        let mut attachment = f.h.stores.attachments.get(&f.volume_id).await.unwrap().unwrap();
        attachment.request_detach().unwrap();
        f.h.stores.attachments.update(&attachment).await.unwrap();
        f.mounter.fail_next_unmounts(10);
        let mut events = f.h.bus.subscribe();

        let first = f.agent.reconcile(&f.volume_id).await.unwrap_err();
        assert!(first.is_retryable());
        let second = f.agent.reconcile(&f.volume_id).await.unwrap_err();
        assert!(matches!(second, ProvisioningError::Mount { terminal: true, .. }));

        // Resync keeps offering the key; the agent leaves it alone
        assert!(f.agent.keys().await.unwrap().contains(&f.volume_id));
        assert_eq!(f.agent.reconcile(&f.volume_id).await.unwrap(), Requeue::Never);
        assert_eq!(f.mounter.unmount_attempts(), 2);

        let attachment = f.h.stores.attachments.get(&f.volume_id).await.unwrap().unwrap();
        assert!(!attachment.node_released);
        assert_eq!(attachment.failures, 2);
        let terminal = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, DomainEvent::Mount(MountEvent::MountFailed { terminal: true, .. })))
            .count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn test_resize_then_unmount_releases_node() {
        let f = attached(AccessMode::SingleWriter, InMemoryMounter::new()).await;
        f.agent.reconcile(&f.volume_id).await.unwrap();

        let mut volume = f.h.stores.volumes.get(&f.volume_id).await.unwrap().unwrap();
        volume.request_resize(30).unwrap();
        f.h.stores.volumes.update(&volume).await.unwrap();
        f.agent.reconcile(&f.volume_id).await.unwrap();

        assert_eq!(f.mounter.resize_count(), 1);
        let volume = f.h.stores.volumes.get(&f.volume_id).await.unwrap().unwrap();
        assert_eq!(volume.capacity_gib, 30);
        assert!(volume.pending_resize_gib.is_none());

        let mut attachment = f.h.stores.attachments.get(&f.volume_id).await.unwrap().unwrap();
        attachment.request_detach().unwrap();
        f.h.stores.attachments.update(&attachment).await.unwrap();
        f.agent.reconcile(&f.volume_id).await.unwrap();

        let attachment = f.h.stores.attachments.get(&f.volume_id).await.unwrap().unwrap();
        assert!(attachment.node_released);
        assert!(f.mounter.mount_at(Path::new("/data")).is_none());
    }

    #[tokio::test]
    async fn test_other_nodes_attachments_are_ignored() {
        let f = attached(AccessMode::SingleWriter, InMemoryMounter::new()).await;
        let other = NodeMountAgent::new(
            NodeId::new("node-b"),
            f.h.stores.clone(),
            f.mounter.clone(),
            f.h.bus.clone(),
            MountAgentSettings::default(),
        );

        assert_eq!(other.reconcile(&f.volume_id).await.unwrap(), Requeue::Never);
        assert!(other.keys().await.unwrap().is_empty());
        assert_eq!(f.mounter.mount_count(), 0);
    }
}
