// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Claim Controller
//!
//! Level-triggered reconcile per claim. Each pass observes the claim, its
//! storage class, its volume and the consumer's node, asks the pure `plan`
//! function for the single next step, and executes it. Steps that leave more
//! work behind requeue the claim instead of looping inline, so a crash between
//! any two steps resumes from persisted state.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Decide when and where to provision, drive the Binder,
//!   apply expansion and reclaim policy
//!
//! # Provisioning
//!
//! The intent (zone, generation, idempotency token) is persisted on the claim
//! before `Create` is called. Replaying `Create` with the same token returns
//! the same cloud volume, so a lost response never leaks a second volume.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::binder::Binder;
use crate::application::block_storage::BlockStorageClient;
use crate::application::controller::{Reconciler, Requeue};
use crate::domain::claim::{ClaimId, ClaimState, VolumeClaim};
use crate::domain::cloud::{CloudError, CloudVolume, CloudVolumeState, CreateVolumeRequest};
use crate::domain::config::DEFAULT_PROVISIONER_ID;
use crate::domain::error::{ErrorClass, ProvisioningError};
use crate::domain::events::{ClaimEvent, ResourceChange, VolumeEvent};
use crate::domain::node::Node;
use crate::domain::repository::{RepositoryError, ResourceKind, ResourceStores};
use crate::domain::storage_class::{BindingMode, StorageClass};
use crate::domain::volume::{Volume, VolumeId, VolumeState};
use crate::infrastructure::event_bus::{DomainEvent, EventBus};

pub const CLAIM_ID_TAG: &str = "aegis.100monkeys.ai/claim-id";
pub const CLAIM_NAME_TAG: &str = "aegis.100monkeys.ai/claim-name";
pub const STORAGE_CLASS_TAG: &str = "aegis.100monkeys.ai/storage-class";

#[derive(Debug, Clone)]
pub struct ClaimControllerSettings {
    pub provisioner_id: String,
    /// Fallback zones for Immediate claims on classes without `allowedZones`
    pub zones: Vec<String>,
    pub poll_interval: Duration,
}

impl Default for ClaimControllerSettings {
    fn default() -> Self {
        Self {
            provisioner_id: DEFAULT_PROVISIONER_ID.to_string(),
            zones: Vec::new(),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Everything `plan` looks at
#[derive(Debug, Clone)]
pub struct ClaimObservation {
    pub claim: VolumeClaim,
    pub class: Option<StorageClass>,
    /// The bound volume, or the one the open provisioning attempt created
    pub volume: Option<Volume>,
    /// Node named by the consumer hint, if it is registered
    pub consumer_node: Option<Node>,
}

#[derive(Debug, Clone)]
pub enum ClaimAction {
    Idle,
    WaitForConsumer,
    Provision { zone: String },
    AwaitVolume(VolumeId),
    Bind(VolumeId),
    DiscardFailed(VolumeId),
    Resize { volume_id: VolumeId, to_gib: u64 },
    ConfirmResize(VolumeId),
    Reclaim,
    AwaitDetach(VolumeId),
    DeleteVolume(VolumeId),
    CleanupAbandoned,
    Finalize,
    MarkLost,
    Reject(ProvisioningError),
}

/// Decide the next step for one claim
pub fn plan(observed: &ClaimObservation, settings: &ClaimControllerSettings) -> ClaimAction {
    let claim = &observed.claim;
    if claim.is_terminating() {
        return plan_deletion(observed);
    }

    let Some(class) = &observed.class else {
        return ClaimAction::Reject(ProvisioningError::Configuration(format!(
            "StorageClass {} not found",
            claim.storage_class
        )));
    };
    if class.provisioner_id != settings.provisioner_id {
        return ClaimAction::Idle;
    }

    match claim.state {
        ClaimState::Pending => plan_pending(observed, class, settings),
        ClaimState::Bound => plan_bound(claim, class, observed.volume.as_ref()),
        ClaimState::Lost | ClaimState::Terminating => ClaimAction::Idle,
    }
}

fn plan_deletion(observed: &ClaimObservation) -> ClaimAction {
    let claim = &observed.claim;
    if claim.bound_volume.is_none() {
        if claim.provisioning.is_some() {
            return ClaimAction::CleanupAbandoned;
        }
        return ClaimAction::Finalize;
    }
    let Some(volume) = &observed.volume else {
        return ClaimAction::Finalize;
    };
    match volume.state {
        VolumeState::Deleted => ClaimAction::Finalize,
        VolumeState::Available if volume.retained => ClaimAction::Finalize,
        VolumeState::Releasing if volume.is_detached() => ClaimAction::DeleteVolume(volume.id.clone()),
        VolumeState::Releasing => ClaimAction::AwaitDetach(volume.id.clone()),
        _ => ClaimAction::Reclaim,
    }
}

fn plan_pending(
    observed: &ClaimObservation,
    class: &StorageClass,
    settings: &ClaimControllerSettings,
) -> ClaimAction {
    let claim = &observed.claim;

    if let Some(attempt) = &claim.provisioning {
        let replay = ClaimAction::Provision {
            zone: attempt.zone.clone(),
        };
        let (Some(volume_id), Some(volume)) = (&attempt.volume_id, &observed.volume) else {
            return replay;
        };
        return match volume.state {
            VolumeState::Creating => ClaimAction::AwaitVolume(volume_id.clone()),
            VolumeState::Available | VolumeState::Bound => ClaimAction::Bind(volume_id.clone()),
            VolumeState::Failed | VolumeState::Deleted | VolumeState::Releasing => {
                ClaimAction::DiscardFailed(volume_id.clone())
            }
        };
    }

    // An Immediate claim never waits on its consumer's node
    let zone = match (&claim.consumer, &observed.consumer_node, class.binding_mode) {
        (Some(_), Some(node), _) => node.zone.clone(),
        (None, _, BindingMode::WaitForConsumer) => return ClaimAction::WaitForConsumer,
        (Some(hint), None, BindingMode::WaitForConsumer) => {
            return ClaimAction::Reject(ProvisioningError::Unavailable(format!(
                "Consumer node {} is not registered",
                hint.node
            )))
        }
        (_, _, BindingMode::Immediate) => match immediate_zone(claim, class, settings) {
            Ok(zone) => zone,
            Err(action) => return action,
        },
    };

    if !class.allows_zone(&zone) {
        return ClaimAction::Reject(ProvisioningError::Conflict(format!(
            "Zone {} is not allowed by StorageClass {}",
            zone, class.name
        )));
    }
    ClaimAction::Provision { zone }
}

fn immediate_zone(
    claim: &VolumeClaim,
    class: &StorageClass,
    settings: &ClaimControllerSettings,
) -> Result<String, ClaimAction> {
    let candidates = if class.allowed_zones.is_empty() {
        &settings.zones
    } else {
        &class.allowed_zones
    };
    if candidates.is_empty() {
        return Err(ClaimAction::Reject(ProvisioningError::Configuration(format!(
            "No zone available for claim {}: StorageClass {} lists none and none are configured",
            claim.name, class.name
        ))));
    }
    let index = (claim.id.0.as_u128() % candidates.len() as u128) as usize;
    Ok(candidates[index].clone())
}

fn plan_bound(claim: &VolumeClaim, class: &StorageClass, volume: Option<&Volume>) -> ClaimAction {
    let Some(volume) = volume.filter(|v| v.state != VolumeState::Deleted) else {
        return ClaimAction::MarkLost;
    };

    if claim.requested_gib > volume.target_capacity_gib() {
        if !class.allow_expansion {
            return ClaimAction::Reject(ProvisioningError::Conflict(format!(
                "StorageClass {} does not allow expansion",
                class.name
            )));
        }
        return ClaimAction::Resize {
            volume_id: volume.id.clone(),
            to_gib: claim.requested_gib,
        };
    }
    // Nothing is mounted, so there is no filesystem to grow
    if volume.pending_resize_gib.is_some() && volume.is_detached() {
        return ClaimAction::ConfirmResize(volume.id.clone());
    }
    ClaimAction::Idle
}

pub struct ClaimController {
    stores: ResourceStores,
    binder: Arc<Binder>,
    cloud: Arc<BlockStorageClient>,
    event_bus: Arc<EventBus>,
    settings: ClaimControllerSettings,
}

impl ClaimController {
    pub fn new(
        stores: ResourceStores,
        binder: Arc<Binder>,
        cloud: Arc<BlockStorageClient>,
        event_bus: Arc<EventBus>,
        settings: ClaimControllerSettings,
    ) -> Self {
        Self {
            stores,
            binder,
            cloud,
            event_bus,
            settings,
        }
    }

    pub async fn observe(&self, claim_id: &ClaimId) -> Result<Option<ClaimObservation>, ProvisioningError> {
        let Some(claim) = self.stores.claims.get(claim_id).await? else {
            return Ok(None);
        };
        let class = self.stores.classes.get(&claim.storage_class).await?;
        let volume_id = claim
            .bound_volume
            .clone()
            .or_else(|| claim.provisioning.as_ref().and_then(|a| a.volume_id.clone()));
        let volume = match &volume_id {
            Some(id) => self.stores.volumes.get(id).await?,
            None => None,
        };
        let consumer_node = match &claim.consumer {
            Some(hint) => self.stores.nodes.get(&hint.node).await?,
            None => None,
        };
        Ok(Some(ClaimObservation {
            claim,
            class,
            volume,
            consumer_node,
        }))
    }

    async fn execute(
        &self,
        observed: ClaimObservation,
        action: ClaimAction,
    ) -> Result<Requeue, ProvisioningError> {
        let ClaimObservation {
            claim,
            class,
            volume,
            ..
        } = observed;

        match action {
            ClaimAction::Idle => Ok(Requeue::Never),
            ClaimAction::WaitForConsumer => self.wait_for_consumer(claim).await,
            ClaimAction::Provision { zone } => {
                let class = class.ok_or_else(|| {
                    ProvisioningError::Configuration(format!("StorageClass {} not found", claim.storage_class))
                })?;
                self.provision(claim, &class, zone).await
            }
            ClaimAction::AwaitVolume(volume_id) => self.await_volume(volume, &volume_id).await,
            ClaimAction::Bind(volume_id) => {
                self.binder.bind(&claim.id, &volume_id).await?;
                counter!("aegis_provisioner_claims_bound_total").increment(1);
                Ok(Requeue::Never)
            }
            ClaimAction::DiscardFailed(volume_id) => self.discard_failed(claim, volume, &volume_id).await,
            ClaimAction::Resize { volume_id, to_gib } => self.resize(&claim, volume, &volume_id, to_gib).await,
            ClaimAction::ConfirmResize(volume_id) => self.confirm_resize(volume, &volume_id).await,
            ClaimAction::Reclaim => {
                let action = self.binder.reclaim(&claim.id).await?;
                debug!(claim_id = %claim.id, action = ?action, "Reclaim policy applied");
                Ok(Requeue::Immediately)
            }
            ClaimAction::AwaitDetach(volume_id) => {
                debug!(claim_id = %claim.id, volume_id = %volume_id, "Waiting for detach before delete");
                Ok(Requeue::After(self.settings.poll_interval))
            }
            ClaimAction::DeleteVolume(volume_id) => self.delete_volume(&claim, &volume_id).await,
            ClaimAction::CleanupAbandoned => self.cleanup_abandoned(claim).await,
            ClaimAction::Finalize => self.finalize(&claim).await,
            ClaimAction::MarkLost => {
                self.binder.mark_lost(&claim.id).await?;
                Ok(Requeue::Never)
            }
            ClaimAction::Reject(e) => Err(e),
        }
    }

    async fn wait_for_consumer(&self, mut claim: VolumeClaim) -> Result<Requeue, ProvisioningError> {
        if claim.status_reason() != Some("WaitingForConsumer") {
            claim.set_status(
                "WaitingForConsumer",
                "Provisioning starts once a consumer is scheduled",
            );
            self.stores.claims.update(&claim).await?;
        }
        Ok(Requeue::Never)
    }

    async fn provision(
        &self,
        mut claim: VolumeClaim,
        class: &StorageClass,
        zone: String,
    ) -> Result<Requeue, ProvisioningError> {
        if claim.provisioning.is_none() {
            let attempt = claim.begin_provisioning(&zone).clone();
            claim.set_status("Provisioning", format!("Creating volume in {}", zone));
            claim = self.stores.claims.update(&claim).await?;
            info!(
                claim_id = %claim.id,
                zone = %attempt.zone,
                generation = attempt.generation,
                "Provisioning started"
            );
            counter!("aegis_provisioner_provisioning_started_total").increment(1);
            self.event_bus.publish_claim_event(ClaimEvent::ProvisioningStarted {
                claim_id: claim.id,
                zone: attempt.zone,
                generation: attempt.generation,
                started_at: attempt.started_at,
            });
        }
        let Some(attempt) = claim.provisioning.clone() else {
            return Ok(Requeue::Immediately);
        };

        let request = CreateVolumeRequest {
            capacity_gib: claim.requested_gib,
            zone: attempt.zone.clone(),
            volume_type: class.parameters.volume_type.clone(),
            iops: class.parameters.iops,
            throughput_mibps: class.parameters.throughput_mibps,
            encrypted: class.parameters.encrypted,
            tags: HashMap::from([
                (CLAIM_ID_TAG.to_string(), claim.id.to_string()),
                (CLAIM_NAME_TAG.to_string(), claim.name.clone()),
                (STORAGE_CLASS_TAG.to_string(), class.name.clone()),
            ]),
        };

        let cloud_volume = match self.cloud.create_volume(&request, &attempt.token).await {
            Ok(volume) => volume,
            // The create may still have landed; look it up instead of re-issuing
            Err(CloudError::Timeout(message)) => match self.cloud.find_by_token(&attempt.token).await? {
                Some(volume) => volume,
                None => return Err(ProvisioningError::Timeout(message)),
            },
            Err(e) => return Err(e.into()),
        };

        self.save_volume(&cloud_volume, class, &attempt.token).await?;
        claim.record_provisioned_volume(cloud_volume.id.clone());
        self.stores.claims.update(&claim).await?;
        Ok(Requeue::Immediately)
    }

    async fn save_volume(
        &self,
        cloud_volume: &CloudVolume,
        class: &StorageClass,
        token: &str,
    ) -> Result<(), ProvisioningError> {
        let mut volume = Volume::provisioned(
            cloud_volume.id.clone(),
            cloud_volume.capacity_gib,
            cloud_volume.zone.clone(),
            cloud_volume.encrypted,
            class,
            token,
        )?;
        match cloud_volume.state {
            CloudVolumeState::Available | CloudVolumeState::InUse => volume.mark_available()?,
            CloudVolumeState::Error => volume.mark_failed(),
            _ => {}
        }

        match self.stores.volumes.create(&volume).await {
            Ok(_) => {
                info!(
                    volume_id = %volume.id,
                    zone = %volume.zone,
                    capacity_gib = volume.capacity_gib,
                    "Volume created"
                );
                self.event_bus.publish_volume_event(VolumeEvent::VolumeCreated {
                    volume_id: volume.id.clone(),
                    zone: volume.zone.clone(),
                    capacity_gib: volume.capacity_gib,
                    created_at: Utc::now(),
                });
                Ok(())
            }
            // Replayed create after a crash; the record is already there
            Err(RepositoryError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn await_volume(
        &self,
        volume: Option<Volume>,
        volume_id: &VolumeId,
    ) -> Result<Requeue, ProvisioningError> {
        let Some(mut volume) = volume else {
            return Ok(Requeue::Immediately);
        };
        let state = match self.cloud.describe_volume(volume_id).await {
            Ok(described) => Some(described.state),
            Err(CloudError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        match state {
            Some(CloudVolumeState::Creating) => return Ok(Requeue::After(self.settings.poll_interval)),
            Some(CloudVolumeState::Available) | Some(CloudVolumeState::InUse) => volume.mark_available()?,
            _ => {
                warn!(volume_id = %volume_id, state = ?state, "Volume failed while creating");
                volume.mark_failed();
            }
        }
        self.stores.volumes.update(&volume).await?;
        Ok(Requeue::Immediately)
    }

    async fn discard_failed(
        &self,
        mut claim: VolumeClaim,
        volume: Option<Volume>,
        volume_id: &VolumeId,
    ) -> Result<Requeue, ProvisioningError> {
        let token = claim.idempotency_token("discard", u64::from(claim.generation));
        self.delete_in_cloud(volume_id, &token).await?;
        if let Some(volume) = volume {
            self.tombstone(volume).await?;
        }

        claim.abandon_provisioning();
        claim.record_failure(
            "VolumeFailed",
            format!("Volume {} failed; provisioning again", volume_id),
        );
        self.stores.claims.update(&claim).await?;
        Ok(Requeue::Immediately)
    }

    async fn resize(
        &self,
        claim: &VolumeClaim,
        volume: Option<Volume>,
        volume_id: &VolumeId,
        to_gib: u64,
    ) -> Result<Requeue, ProvisioningError> {
        let Some(mut volume) = volume else {
            return Ok(Requeue::Immediately);
        };
        let from_gib = volume.capacity_gib;

        // Cloud first: a recorded pending resize must exist in the cloud
        let token = claim.idempotency_token("resize", to_gib);
        self.cloud.resize_volume(volume_id, to_gib, &token).await?;
        volume.request_resize(to_gib)?;
        self.stores.volumes.update(&volume).await?;

        info!(claim_id = %claim.id, volume_id = %volume_id, from_gib, to_gib, "Volume expansion requested");
        self.event_bus.publish_claim_event(ClaimEvent::ResizeRequested {
            claim_id: claim.id,
            volume_id: volume_id.clone(),
            from_gib,
            to_gib,
            requested_at: Utc::now(),
        });
        Ok(Requeue::Never)
    }

    async fn confirm_resize(&self, volume: Option<Volume>, volume_id: &VolumeId) -> Result<Requeue, ProvisioningError> {
        let Some(mut volume) = volume else {
            return Ok(Requeue::Never);
        };
        if let Some(capacity_gib) = volume.confirm_resize() {
            self.stores.volumes.update(&volume).await?;
            info!(volume_id = %volume_id, capacity_gib, "Expansion confirmed without a mounted filesystem");
            self.event_bus.publish_volume_event(VolumeEvent::FilesystemResized {
                volume_id: volume_id.clone(),
                capacity_gib,
                resized_at: Utc::now(),
            });
        }
        Ok(Requeue::Never)
    }

    async fn delete_volume(&self, claim: &VolumeClaim, volume_id: &VolumeId) -> Result<Requeue, ProvisioningError> {
        let token = claim.idempotency_token("delete", 0);
        self.delete_in_cloud(volume_id, &token).await?;
        self.binder.finalize_volume_deleted(volume_id).await?;
        counter!("aegis_provisioner_volumes_deleted_total").increment(1);
        Ok(Requeue::Immediately)
    }

    async fn cleanup_abandoned(&self, mut claim: VolumeClaim) -> Result<Requeue, ProvisioningError> {
        let Some(attempt) = claim.provisioning.clone() else {
            return Ok(Requeue::Immediately);
        };
        let volume_id = match attempt.volume_id {
            Some(id) => Some(id),
            None => self.cloud.find_by_token(&attempt.token).await?.map(|v| v.id),
        };

        if let Some(volume_id) = &volume_id {
            info!(claim_id = %claim.id, volume_id = %volume_id, "Deleting volume of abandoned provisioning");
            self.delete_in_cloud(volume_id, &claim.idempotency_token("delete", 0))
                .await?;
            if let Some(volume) = self.stores.volumes.get(volume_id).await? {
                self.tombstone(volume).await?;
            }
        }

        claim.abandon_provisioning();
        self.stores.claims.update(&claim).await?;
        Ok(Requeue::Immediately)
    }

    async fn finalize(&self, claim: &VolumeClaim) -> Result<Requeue, ProvisioningError> {
        self.stores.claims.delete(&claim.id).await?;
        info!(claim_id = %claim.id, name = %claim.name, "Claim deleted");
        self.event_bus.publish_claim_event(ClaimEvent::ClaimDeleted {
            claim_id: claim.id,
            deleted_at: Utc::now(),
        });
        Ok(Requeue::Never)
    }

    /// `NotFound` means the volume is already gone
    async fn delete_in_cloud(&self, volume_id: &VolumeId, token: &str) -> Result<(), ProvisioningError> {
        match self.cloud.delete_volume(volume_id, token).await {
            Ok(()) => {
                info!(volume_id = %volume_id, "Cloud volume deleted");
                Ok(())
            }
            Err(CloudError::NotFound(_)) => {
                debug!(volume_id = %volume_id, "Cloud volume already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn tombstone(&self, mut volume: Volume) -> Result<(), ProvisioningError> {
        if volume.state == VolumeState::Deleted {
            return Ok(());
        }
        volume.unbind();
        volume.mark_deleted()?;
        self.stores.volumes.update(&volume).await?;
        self.event_bus.publish_volume_event(VolumeEvent::VolumeDeleted {
            volume_id: volume.id.clone(),
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    /// Record a failure on the claim. Nothing is written when the same
    /// failure is already recorded, so a failing claim does not wake itself.
    async fn record_failure(&self, claim_id: &ClaimId, error: &ProvisioningError) {
        let claim = match self.stores.claims.get(claim_id).await {
            Ok(Some(claim)) => claim,
            _ => return,
        };
        let message = error.to_string();
        if claim.status_reason() == Some(error.reason()) && claim.status.message.as_deref() == Some(message.as_str()) {
            return;
        }

        let mut updated = claim;
        updated.record_failure(error.reason(), message.clone());
        if let Err(e) = self.stores.claims.update(&updated).await {
            debug!(claim_id = %claim_id, "Status update lost a race: {}", e);
            return;
        }
        counter!("aegis_provisioner_provisioning_failures_total", "reason" => error.reason()).increment(1);
        self.event_bus.publish_claim_event(ClaimEvent::ProvisioningFailed {
            claim_id: *claim_id,
            reason: error.reason().to_string(),
            message,
            retryable: error.is_retryable(),
            failed_at: Utc::now(),
        });
    }

    async fn clear_failures(&self, claim_id: &ClaimId) -> Result<(), ProvisioningError> {
        if let Some(mut claim) = self.stores.claims.get(claim_id).await? {
            if claim.status.consecutive_failures > 0 {
                claim.clear_status();
                self.stores.claims.update(&claim).await?;
            }
        }
        Ok(())
    }

    async fn claims_matching(&self, predicate: impl Fn(&VolumeClaim) -> bool) -> Vec<ClaimId> {
        match self.stores.claims.list().await {
            Ok(claims) => claims.into_iter().filter(|c| predicate(c)).map(|c| c.id).collect(),
            Err(e) => {
                warn!("Failed to list claims for watch event: {}", e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Reconciler for ClaimController {
    type Key = ClaimId;

    const NAME: &'static str = "claim";

    async fn reconcile(&self, key: &ClaimId) -> Result<Requeue, ProvisioningError> {
        let Some(observed) = self.observe(key).await? else {
            return Ok(Requeue::Never);
        };
        let had_failures = observed.claim.status.consecutive_failures > 0;
        let action = plan(&observed, &self.settings);
        debug!(claim_id = %key, action = ?action, "Planned claim action");

        match self.execute(observed, action).await {
            Ok(requeue) => {
                if had_failures && requeue == Requeue::Never {
                    self.clear_failures(key).await?;
                }
                Ok(requeue)
            }
            Err(e) => {
                if e.class() != ErrorClass::Benign {
                    self.record_failure(key, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn keys(&self) -> Result<Vec<ClaimId>, ProvisioningError> {
        Ok(self
            .stores
            .claims
            .list()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect())
    }

    async fn keys_for_event(&self, event: &DomainEvent) -> Vec<ClaimId> {
        let DomainEvent::Resource(event) = event else {
            return Vec::new();
        };
        match event.kind {
            ResourceKind::Claim => {
                if event.change == ResourceChange::Deleted {
                    return Vec::new();
                }
                let Ok(id) = ClaimId::from_string(&event.key) else {
                    return Vec::new();
                };
                // A failing claim is retried on its backoff schedule, not on its own status writes
                match self.stores.claims.get(&id).await {
                    Ok(Some(claim)) if claim.status.consecutive_failures > 0 && !claim.is_terminating() => {
                        Vec::new()
                    }
                    Ok(Some(_)) => vec![id],
                    _ => Vec::new(),
                }
            }
            ResourceKind::Volume => {
                let volume_id = VolumeId::new(event.key.clone());
                if let Ok(Some(volume)) = self.stores.volumes.get(&volume_id).await {
                    if let Some(claim_id) = volume.bound_claim {
                        return vec![claim_id];
                    }
                }
                self.claims_matching(|c| {
                    c.provisioning
                        .as_ref()
                        .and_then(|a| a.volume_id.as_ref())
                        .is_some_and(|id| *id == volume_id)
                })
                .await
            }
            ResourceKind::StorageClass => {
                let class = event.key.clone();
                self.claims_matching(|c| c.storage_class == class).await
            }
            ResourceKind::Node => {
                let node = event.key.clone();
                self.claims_matching(|c| {
                    c.state == ClaimState::Pending
                        && c.consumer.as_ref().is_some_and(|h| h.node.as_str() == node)
                })
                .await
            }
            ResourceKind::Attachment => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{harness, Harness};
    use crate::domain::claim::AccessMode;
    use crate::domain::node::NodeId;
    use crate::domain::storage_class::ReclaimPolicy;
    use crate::infrastructure::cloud::SimulatedCloud;
    use std::path::PathBuf;

    fn settings() -> ClaimControllerSettings {
        ClaimControllerSettings {
            provisioner_id: DEFAULT_PROVISIONER_ID.to_string(),
            zones: vec!["zone-a".to_string(), "zone-b".to_string()],
            poll_interval: Duration::from_millis(10),
        }
    }

    fn class(mode: BindingMode) -> StorageClass {
        StorageClass::new("standard", DEFAULT_PROVISIONER_ID)
            .unwrap()
            .with_binding_mode(mode)
    }

    fn observation(claim: VolumeClaim, class: Option<StorageClass>) -> ClaimObservation {
        ClaimObservation {
            claim,
            class,
            volume: None,
            consumer_node: None,
        }
    }

    fn claim() -> VolumeClaim {
        VolumeClaim::new("data", 20, AccessMode::SingleWriter, "standard").unwrap()
    }

    #[test]
    fn test_wait_for_consumer_without_hint() {
        let observed = observation(claim(), Some(class(BindingMode::WaitForConsumer)));
        assert!(matches!(plan(&observed, &settings()), ClaimAction::WaitForConsumer));
    }

    #[test]
    fn test_placement_decides_zone() {
        let mut c = claim();
        c.place_consumer(NodeId::new("node-c"), PathBuf::from("/data"));
        let mut observed = observation(c, Some(class(BindingMode::WaitForConsumer)));
        observed.consumer_node = Some(Node::new("node-c", "zone-c"));

        match plan(&observed, &settings()) {
            ClaimAction::Provision { zone } => assert_eq!(zone, "zone-c"),
            other => panic!("expected provision, got {:?}", other),
        }
    }

    #[test]
    fn test_immediate_claim_ignores_unregistered_consumer_node() {
        let mut c = claim();
        c.place_consumer(NodeId::new("node-gone"), PathBuf::from("/data"));
        let observed = observation(
            c.clone(),
            Some(class(BindingMode::Immediate).with_allowed_zones(["zone-b"])),
        );
        match plan(&observed, &settings()) {
            ClaimAction::Provision { zone } => assert_eq!(zone, "zone-b"),
            other => panic!("expected provision, got {:?}", other),
        }

        let observed = observation(c, Some(class(BindingMode::WaitForConsumer)));
        assert!(matches!(
            plan(&observed, &settings()),
            ClaimAction::Reject(ProvisioningError::Unavailable(_))
        ));
    }

    #[test]
    fn test_zone_outside_allowed_topology_conflicts() {
        let mut c = claim();
        c.place_consumer(NodeId::new("node-c"), PathBuf::from("/data"));
        let mut observed = observation(
            c,
            Some(class(BindingMode::WaitForConsumer).with_allowed_zones(["zone-a"])),
        );
        observed.consumer_node = Some(Node::new("node-c", "zone-c"));

        assert!(matches!(
            plan(&observed, &settings()),
            ClaimAction::Reject(ProvisioningError::Conflict(_))
        ));
    }

    #[test]
    fn test_immediate_zone_pick_is_deterministic() {
        let c = claim();
        let observed = observation(c, Some(class(BindingMode::Immediate)));
        let first = plan(&observed, &settings());
        let second = plan(&observed, &settings());
        match (first, second) {
            (ClaimAction::Provision { zone: a }, ClaimAction::Provision { zone: b }) => {
                assert_eq!(a, b);
                assert!(a == "zone-a" || a == "zone-b");
            }
            other => panic!("expected provision twice, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_class_and_foreign_provisioner() {
        assert!(matches!(
            plan(&observation(claim(), None), &settings()),
            ClaimAction::Reject(ProvisioningError::Configuration(_))
        ));

        let foreign = StorageClass::new("standard", "other.vendor/block").unwrap();
        assert!(matches!(
            plan(&observation(claim(), Some(foreign)), &settings()),
            ClaimAction::Idle
        ));
    }

    #[test]
    fn test_terminating_paths() {
        let mut c = claim();
        c.request_deletion();
        assert!(matches!(
            plan(&observation(c.clone(), None), &settings()),
            ClaimAction::Finalize
        ));

        c.begin_provisioning("zone-a");
        assert!(matches!(
            plan(&observation(c, None), &settings()),
            ClaimAction::CleanupAbandoned
        ));
    }

    #[test]
    fn test_expansion_requires_allowing_class() {
        let class = class(BindingMode::Immediate);
        let mut c = claim();
        let mut volume = Volume::provisioned(VolumeId::new("vol-1"), 20, "zone-a", false, &class, "t").unwrap();
        volume.mark_available().unwrap();
        volume.bind(c.id).unwrap();
        c.bind(volume.id.clone()).unwrap();
        c.request_resize(30).unwrap();

        let mut observed = observation(c, Some(class.clone()));
        observed.volume = Some(volume.clone());
        assert!(matches!(
            plan(&observed, &settings()),
            ClaimAction::Reject(ProvisioningError::Conflict(_))
        ));

        observed.class = Some(class.with_expansion(true));
        assert!(matches!(
            plan(&observed, &settings()),
            ClaimAction::Resize { to_gib: 30, .. }
        ));

        volume.request_resize(30).unwrap();
        observed.volume = Some(volume);
        assert!(matches!(plan(&observed, &settings()), ClaimAction::ConfirmResize(_)));
    }

    async fn controller(h: &Harness) -> ClaimController {
        ClaimController::new(
            h.stores.clone(),
            h.binder.clone(),
            h.client.clone(),
            h.bus.clone(),
            settings(),
        )
    }

    /// Reconcile until the controller has nothing left to do right now
    async fn settle(controller: &ClaimController, id: &ClaimId) {
        for _ in 0..20 {
            match controller.reconcile(id).await {
                Ok(Requeue::Immediately) => continue,
                Ok(Requeue::After(d)) => tokio::time::sleep(d).await,
                _ => return,
            }
        }
    }

    #[tokio::test]
    async fn test_immediate_claim_provisions_and_binds() {
        let h = harness(SimulatedCloud::with_settle_polls(1));
        h.stores.classes.create(&class(BindingMode::Immediate)).await.unwrap();
        let c = h.stores.claims.create(&claim()).await.unwrap();
        let controller = controller(&h).await;

        settle(&controller, &c.id).await;

        let c = h.stores.claims.get(&c.id).await.unwrap().unwrap();
        assert_eq!(c.state, ClaimState::Bound);
        let volume = h
            .stores
            .volumes
            .get(c.bound_volume.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(volume.capacity_gib, 20);
        assert_eq!(volume.state, VolumeState::Bound);
        assert_eq!(h.cloud.calls().create, 1);
        assert_eq!(h.exchanger.exchanges(), 1);
    }

    #[tokio::test]
    async fn test_failed_volume_is_discarded_and_retried() {
        let h = harness(SimulatedCloud::with_settle_polls(0));
        h.cloud.fail_next_create();
        h.stores.classes.create(&class(BindingMode::Immediate)).await.unwrap();
        let c = h.stores.claims.create(&claim()).await.unwrap();
        let controller = controller(&h).await;

        settle(&controller, &c.id).await;

        let c = h.stores.claims.get(&c.id).await.unwrap().unwrap();
        assert_eq!(c.state, ClaimState::Bound);
        assert_eq!(c.generation, 1);
        assert_eq!(h.cloud.calls().create, 2);
        assert_eq!(h.cloud.calls().delete, 1);
        assert_eq!(h.cloud.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_retain_policy_orphans_volume() {
        let h = harness(SimulatedCloud::with_settle_polls(0));
        h.stores
            .classes
            .create(&class(BindingMode::Immediate).with_reclaim_policy(ReclaimPolicy::Retain))
            .await
            .unwrap();
        let c = h.stores.claims.create(&claim()).await.unwrap();
        let controller = controller(&h).await;
        settle(&controller, &c.id).await;

        let mut bound = h.stores.claims.get(&c.id).await.unwrap().unwrap();
        let volume_id = bound.bound_volume.clone().unwrap();
        bound.request_deletion();
        h.stores.claims.update(&bound).await.unwrap();
        settle(&controller, &c.id).await;

        assert!(h.stores.claims.get(&c.id).await.unwrap().is_none());
        let volume = h.stores.volumes.get(&volume_id).await.unwrap().unwrap();
        assert_eq!(volume.state, VolumeState::Available);
        assert!(volume.retained);
        assert_eq!(h.cloud.calls().delete, 0);
        assert!(h.cloud.volume(&volume_id).is_some());
    }

    #[tokio::test]
    async fn test_claim_deleted_mid_provisioning_cleans_up() {
        let h = harness(SimulatedCloud::with_settle_polls(5));
        h.stores.classes.create(&class(BindingMode::Immediate)).await.unwrap();
        let c = h.stores.claims.create(&claim()).await.unwrap();
        let controller = controller(&h).await;

        // Intent persisted and create issued, volume still Creating
        controller.reconcile(&c.id).await.unwrap();
        assert_eq!(h.cloud.volumes().len(), 1);

        let mut c = h.stores.claims.get(&c.id).await.unwrap().unwrap();
        c.request_deletion();
        h.stores.claims.update(&c).await.unwrap();
        settle(&controller, &c.id).await;

        assert!(h.stores.claims.get(&c.id).await.unwrap().is_none());
        assert!(h.cloud.volumes().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_volume_marks_claim_lost() {
        let h = harness(SimulatedCloud::with_settle_polls(0));
        h.stores.classes.create(&class(BindingMode::Immediate)).await.unwrap();
        let c = h.stores.claims.create(&claim()).await.unwrap();
        let controller = controller(&h).await;
        settle(&controller, &c.id).await;

        let volume_id = h
            .stores
            .claims
            .get(&c.id)
            .await
            .unwrap()
            .unwrap()
            .bound_volume
            .unwrap();
        h.stores.volumes.delete(&volume_id).await.unwrap();
        settle(&controller, &c.id).await;

        let c = h.stores.claims.get(&c.id).await.unwrap().unwrap();
        assert_eq!(c.state, ClaimState::Lost);
    }
}
