// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Attach/Detach Controller
//!
//! Level-triggered reconcile per volume. The desired node is the consumer of
//! the volume's bound claim; the `VolumeAttachment` record is what the cloud
//! and the node agent have been told. One record per volume and a phase
//! machine that only moves forward guarantee a volume never has an attach and
//! a detach outstanding together.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Attach bound volumes where their consumer runs, detach them
//!   once the node agent has released them

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::block_storage::BlockStorageClient;
use crate::application::controller::{Reconciler, Requeue};
use crate::domain::attachment::{AttachmentPhase, VolumeAttachment};
use crate::domain::claim::{ClaimId, ClaimState};
use crate::domain::cloud::{CloudAttachmentState, CloudError};
use crate::domain::error::ProvisioningError;
use crate::domain::events::{AttachmentEvent, ResourceChange};
use crate::domain::node::{Node, NodeId};
use crate::domain::repository::{ResourceKind, ResourceStores};
use crate::domain::volume::{AttachmentState, Volume, VolumeId, VolumeState};
use crate::infrastructure::event_bus::{DomainEvent, EventBus};

#[derive(Debug, Clone)]
pub struct AttachControllerSettings {
    pub poll_interval: Duration,
    /// Attaching longer than this is reported as stuck
    pub attach_timeout: Duration,
}

impl Default for AttachControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            attach_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachObservation {
    pub volume: Volume,
    pub attachment: Option<VolumeAttachment>,
    /// Node running the bound claim's consumer
    pub desired: Option<NodeId>,
    /// Node named on the attachment record, if registered
    pub attachment_node: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachAction {
    Idle,
    Request(NodeId),
    Reassign(NodeId),
    Attach,
    RequestDetach,
    AwaitRelease,
    Detach,
    /// The record has settled but the volume still shows the operation in flight
    Repair,
    Forget,
    /// The volume is deleted and has no attachment record left
    Prune,
}

pub fn plan(observed: &AttachObservation) -> AttachAction {
    let gone = observed.volume.state == VolumeState::Deleted;
    let desired = if gone { None } else { observed.desired.as_ref() };

    let Some(attachment) = &observed.attachment else {
        return match desired {
            Some(node) => AttachAction::Request(node.clone()),
            None if gone => AttachAction::Prune,
            None => AttachAction::Idle,
        };
    };

    if matches!(
        (attachment.phase, observed.volume.attachment),
        (AttachmentPhase::Attached, AttachmentState::Attaching)
            | (AttachmentPhase::Detached, AttachmentState::Detaching)
    ) {
        return AttachAction::Repair;
    }

    match attachment.phase {
        // An attach in flight resolves before anything else happens
        AttachmentPhase::Requested => AttachAction::Attach,
        AttachmentPhase::Attached => {
            if desired == Some(&attachment.node_id) {
                AttachAction::Idle
            } else {
                AttachAction::RequestDetach
            }
        }
        AttachmentPhase::DetachRequested => {
            let node_usable = observed.attachment_node.as_ref().is_some_and(|n| n.ready);
            if attachment.node_released || !node_usable {
                AttachAction::Detach
            } else {
                AttachAction::AwaitRelease
            }
        }
        AttachmentPhase::Detached => match desired {
            Some(node) => AttachAction::Reassign(node.clone()),
            None if gone => AttachAction::Forget,
            None => AttachAction::Idle,
        },
    }
}

pub struct AttachDetachController {
    stores: ResourceStores,
    cloud: Arc<BlockStorageClient>,
    event_bus: Arc<EventBus>,
    settings: AttachControllerSettings,
}

impl AttachDetachController {
    pub fn new(
        stores: ResourceStores,
        cloud: Arc<BlockStorageClient>,
        event_bus: Arc<EventBus>,
        settings: AttachControllerSettings,
    ) -> Self {
        Self {
            stores,
            cloud,
            event_bus,
            settings,
        }
    }

    pub async fn observe(&self, volume_id: &VolumeId) -> Result<Option<AttachObservation>, ProvisioningError> {
        let attachment = self.stores.attachments.get(volume_id).await?;
        let Some(volume) = self.stores.volumes.get(volume_id).await? else {
            if attachment.is_some_and(|a| !a.is_active()) {
                self.stores.attachments.delete(volume_id).await?;
            }
            return Ok(None);
        };

        let desired = match volume.bound_claim {
            Some(claim_id) => self
                .stores
                .claims
                .get(&claim_id)
                .await?
                .filter(|c| {
                    c.state == ClaimState::Bound
                        && !c.is_terminating()
                        && c.bound_volume.as_ref() == Some(volume_id)
                })
                .and_then(|c| c.consumer.map(|hint| hint.node)),
            None => None,
        };
        let attachment_node = match &attachment {
            Some(a) => self.stores.nodes.get(&a.node_id).await?,
            None => None,
        };

        Ok(Some(AttachObservation {
            volume,
            attachment,
            desired,
            attachment_node,
        }))
    }

    async fn execute(
        &self,
        observed: AttachObservation,
        action: AttachAction,
    ) -> Result<Requeue, ProvisioningError> {
        let AttachObservation {
            volume, attachment, ..
        } = observed;

        match (action, attachment) {
            (AttachAction::Idle, _) | (AttachAction::AwaitRelease, _) => Ok(Requeue::Never),
            (AttachAction::Request(node_id), None) => self.request(&volume, None, node_id).await,
            (AttachAction::Reassign(node_id), Some(attachment)) => {
                self.request(&volume, Some(attachment), node_id).await
            }
            (AttachAction::Attach, Some(attachment)) => self.attach(volume, attachment).await,
            (AttachAction::RequestDetach, Some(mut attachment)) => {
                attachment.request_detach()?;
                self.stores.attachments.update(&attachment).await?;
                info!(volume_id = %volume.id, node_id = %attachment.node_id, "Detach requested");
                self.event_bus.publish_attachment_event(AttachmentEvent::DetachRequested {
                    volume_id: volume.id.clone(),
                    node_id: attachment.node_id.clone(),
                    requested_at: Utc::now(),
                });
                Ok(Requeue::Immediately)
            }
            (AttachAction::Detach, Some(attachment)) => self.detach(volume, attachment).await,
            (AttachAction::Repair, Some(attachment)) => self.repair(volume, attachment).await,
            (AttachAction::Forget, Some(_)) => {
                self.stores.attachments.delete(&volume.id).await?;
                Ok(Requeue::Immediately)
            }
            (AttachAction::Prune, None) => self.prune(&volume).await,
            (action, _) => {
                debug!(volume_id = %volume.id, action = ?action, "Attachment changed under the plan");
                Ok(Requeue::Immediately)
            }
        }
    }

    /// Check the target node, then create or reuse the attachment record
    async fn request(
        &self,
        volume: &Volume,
        existing: Option<VolumeAttachment>,
        node_id: NodeId,
    ) -> Result<Requeue, ProvisioningError> {
        if volume.attachment.is_in_flight() {
            return Err(ProvisioningError::Busy(format!(
                "volume {} has a {:?} operation outstanding",
                volume.id, volume.attachment
            )));
        }
        let node = self
            .stores
            .nodes
            .get(&node_id)
            .await?
            .ok_or_else(|| ProvisioningError::Unavailable(format!("node {} is not registered", node_id)))?;
        if !node.ready {
            debug!(volume_id = %volume.id, node_id = %node_id, "Target node not ready");
            return Ok(Requeue::After(self.settings.poll_interval));
        }
        if node.zone != volume.zone {
            warn!(
                volume_id = %volume.id,
                node_id = %node_id,
                volume_zone = %volume.zone,
                node_zone = %node.zone,
                "Refusing cross-zone attach"
            );
            self.event_bus.publish_attachment_event(AttachmentEvent::CrossZonePlacement {
                volume_id: volume.id.clone(),
                node_id: node_id.clone(),
                volume_zone: volume.zone.clone(),
                node_zone: node.zone.clone(),
                detected_at: Utc::now(),
            });
            return Err(ProvisioningError::Conflict(format!(
                "volume {} is in {} but node {} is in {}",
                volume.id, volume.zone, node_id, node.zone
            )));
        }

        match existing {
            Some(mut attachment) => {
                attachment.reassign(node_id.clone(), Utc::now())?;
                self.stores.attachments.update(&attachment).await?;
            }
            None => {
                self.stores
                    .attachments
                    .create(&VolumeAttachment::new(volume.id.clone(), node_id.clone()))
                    .await?;
            }
        }

        info!(volume_id = %volume.id, node_id = %node_id, "Attach requested");
        self.event_bus.publish_attachment_event(AttachmentEvent::AttachRequested {
            volume_id: volume.id.clone(),
            node_id,
            requested_at: Utc::now(),
        });
        Ok(Requeue::Immediately)
    }

    async fn attach(&self, mut volume: Volume, mut attachment: VolumeAttachment) -> Result<Requeue, ProvisioningError> {
        let node_id = attachment.node_id.clone();
        let now = Utc::now();

        let overdue = attachment
            .waited(now)
            .to_std()
            .is_ok_and(|waited| waited > self.settings.attach_timeout);
        if overdue && !attachment.timed_out {
            attachment.mark_timed_out();
            attachment = self.stores.attachments.update(&attachment).await?;
            let waited_seconds = attachment.waited(now).num_seconds();
            error!(
                volume_id = %volume.id,
                node_id = %node_id,
                waited_seconds,
                "Attach is stuck; operator attention required"
            );
            counter!("aegis_provisioner_attach_timeouts_total").increment(1);
            self.event_bus.publish_attachment_event(AttachmentEvent::AttachTimedOut {
                volume_id: volume.id.clone(),
                node_id: node_id.clone(),
                waited_seconds,
                detected_at: now,
            });
        }

        if volume.attachment == AttachmentState::Detached {
            volume.begin_attach(&node_id)?;
            volume = self.stores.volumes.update(&volume).await?;
        } else {
            // Busy while a detach is unresolved
            volume.clone().begin_attach(&node_id)?;
        }

        let described = self.cloud.describe_volume(&volume.id).await?;
        if described.is_attached_to(&node_id) {
            // Volume first: a lost race leaves the record Requested and the
            // next pass completes both
            if volume.attachment != AttachmentState::Attached {
                volume.complete_attach()?;
                volume = self.stores.volumes.update(&volume).await?;
            }
            let device_hint = described.attachment.and_then(|a| a.device_hint);
            attachment.mark_attached(device_hint)?;
            self.stores.attachments.update(&attachment).await?;

            info!(volume_id = %volume.id, node_id = %node_id, "Volume attached");
            counter!("aegis_provisioner_attaches_total").increment(1);
            self.event_bus.publish_attachment_event(AttachmentEvent::VolumeAttached {
                volume_id: volume.id.clone(),
                node_id,
                attached_at: Utc::now(),
            });
            return Ok(Requeue::Never);
        }

        match described.attachment {
            Some(current) if current.node_id == node_id => {
                debug!(volume_id = %volume.id, state = ?current.state, "Attach in progress");
                Ok(Requeue::After(self.settings.poll_interval))
            }
            Some(current) => {
                let e = ProvisioningError::Conflict(format!(
                    "volume {} is still {:?} on node {}",
                    volume.id, current.state, current.node_id
                ));
                self.record_failure(attachment, &e).await;
                Err(e)
            }
            None => {
                let token = attachment.idempotency_token("attach");
                match self.cloud.attach_volume(&volume.id, &node_id, &token).await {
                    Ok(()) => Ok(Requeue::Immediately),
                    Err(CloudError::Timeout(_)) => Ok(Requeue::After(self.settings.poll_interval)),
                    Err(e) => {
                        let e = ProvisioningError::from(e);
                        self.record_failure(attachment, &e).await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn detach(&self, mut volume: Volume, mut attachment: VolumeAttachment) -> Result<Requeue, ProvisioningError> {
        let node_id = attachment.node_id.clone();

        if volume.attachment == AttachmentState::Attached {
            volume.begin_detach()?;
            volume = self.stores.volumes.update(&volume).await?;
        } else {
            volume.clone().begin_detach()?;
        }

        let described = match self.cloud.describe_volume(&volume.id).await {
            Ok(described) => Some(described),
            Err(CloudError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let current = described
            .and_then(|v| v.attachment)
            .filter(|a| a.node_id == node_id);

        match current {
            None => {
                if volume.attachment != AttachmentState::Detached {
                    volume.complete_detach()?;
                    volume = self.stores.volumes.update(&volume).await?;
                }
                attachment.mark_detached();
                self.stores.attachments.update(&attachment).await?;

                info!(volume_id = %volume.id, node_id = %node_id, "Volume detached");
                counter!("aegis_provisioner_detaches_total").increment(1);
                self.event_bus.publish_attachment_event(AttachmentEvent::VolumeDetached {
                    volume_id: volume.id.clone(),
                    node_id,
                    detached_at: Utc::now(),
                });
                Ok(Requeue::Immediately)
            }
            Some(current) if current.state == CloudAttachmentState::Detaching => {
                Ok(Requeue::After(self.settings.poll_interval))
            }
            Some(_) => {
                let token = attachment.idempotency_token("detach");
                match self.cloud.detach_volume(&volume.id, &node_id, &token).await {
                    Ok(()) => Ok(Requeue::Immediately),
                    Err(CloudError::Timeout(_)) => Ok(Requeue::After(self.settings.poll_interval)),
                    Err(e) => {
                        let e = ProvisioningError::from(e);
                        self.record_failure(attachment, &e).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Drop a deleted volume's record once no claim refers to it
    async fn prune(&self, volume: &Volume) -> Result<Requeue, ProvisioningError> {
        let referenced = self.stores.claims.list().await?.into_iter().any(|claim| {
            claim.bound_volume.as_ref() == Some(&volume.id)
                || claim
                    .provisioning
                    .as_ref()
                    .and_then(|attempt| attempt.volume_id.as_ref())
                    == Some(&volume.id)
        });
        if referenced {
            debug!(volume_id = %volume.id, "Deleted volume still referenced by a claim");
            return Ok(Requeue::After(self.settings.poll_interval));
        }
        self.stores.volumes.delete(&volume.id).await?;
        info!(volume_id = %volume.id, "Pruned deleted volume");
        Ok(Requeue::Never)
    }

    /// Bring the volume's attachment state in line with a settled record
    async fn repair(&self, mut volume: Volume, attachment: VolumeAttachment) -> Result<Requeue, ProvisioningError> {
        match attachment.phase {
            AttachmentPhase::Attached => volume.complete_attach()?,
            AttachmentPhase::Detached => volume.complete_detach()?,
            _ => return Ok(Requeue::Immediately),
        }
        self.stores.volumes.update(&volume).await?;
        warn!(
            volume_id = %volume.id,
            node_id = %attachment.node_id,
            phase = ?attachment.phase,
            "Repaired volume attachment state"
        );
        Ok(Requeue::Immediately)
    }

    async fn record_failure(&self, mut attachment: VolumeAttachment, error: &ProvisioningError) {
        attachment.record_failure(error.to_string());
        let attempt = attachment.failures;
        if let Err(e) = self.stores.attachments.update(&attachment).await {
            debug!(volume_id = %attachment.volume_id, "Attachment status update lost a race: {}", e);
        }
        self.event_bus.publish_attachment_event(AttachmentEvent::AttachFailed {
            volume_id: attachment.volume_id.clone(),
            node_id: attachment.node_id.clone(),
            error: error.to_string(),
            attempt,
            failed_at: Utc::now(),
        });
    }
}

#[async_trait]
impl Reconciler for AttachDetachController {
    type Key = VolumeId;

    const NAME: &'static str = "attach_detach";

    async fn reconcile(&self, key: &VolumeId) -> Result<Requeue, ProvisioningError> {
        let Some(observed) = self.observe(key).await? else {
            return Ok(Requeue::Never);
        };
        let action = plan(&observed);
        debug!(volume_id = %key, action = ?action, "Planned attachment action");
        self.execute(observed, action).await
    }

    async fn keys(&self) -> Result<Vec<VolumeId>, ProvisioningError> {
        let mut keys: HashSet<VolumeId> = self
            .stores
            .volumes
            .list()
            .await?
            .into_iter()
            .map(|v| v.id)
            .collect();
        keys.extend(
            self.stores
                .attachments
                .list()
                .await?
                .into_iter()
                .map(|a| a.volume_id),
        );
        Ok(keys.into_iter().collect())
    }

    async fn keys_for_event(&self, event: &DomainEvent) -> Vec<VolumeId> {
        let DomainEvent::Resource(event) = event else {
            return Vec::new();
        };
        match event.kind {
            ResourceKind::Volume => vec![VolumeId::new(event.key.clone())],
            ResourceKind::Attachment => {
                if event.change == ResourceChange::Deleted {
                    return Vec::new();
                }
                let volume_id = VolumeId::new(event.key.clone());
                // A failing attachment is retried on its backoff schedule
                match self.stores.attachments.get(&volume_id).await {
                    Ok(Some(attachment)) if attachment.failures > 0 => Vec::new(),
                    Ok(Some(_)) => vec![volume_id],
                    _ => Vec::new(),
                }
            }
            ResourceKind::Claim => {
                let Ok(claim_id) = ClaimId::from_string(&event.key) else {
                    return Vec::new();
                };
                match self.stores.claims.get(&claim_id).await {
                    Ok(Some(claim)) => claim.bound_volume.into_iter().collect(),
                    _ => Vec::new(),
                }
            }
            ResourceKind::Node => {
                let node = event.key.clone();
                match self.stores.attachments.list().await {
                    Ok(attachments) => attachments
                        .into_iter()
                        .filter(|a| a.node_id.as_str() == node && a.is_active())
                        .map(|a| a.volume_id)
                        .collect(),
                    Err(e) => {
                        warn!("Failed to list attachments for watch event: {}", e);
                        Vec::new()
                    }
                }
            }
            ResourceKind::StorageClass => Vec::new(),
        }
    }
}
