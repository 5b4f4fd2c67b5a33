// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Binder - Claim/Volume binding state machine
//!
//! The only component that writes the claim/volume association. It performs
//! no cloud I/O: `reclaim` returns the action the caller must carry out and
//! `finalize_volume_deleted` records the outcome afterwards.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Keep a volume bound to at most one claim and a claim bound
//!   to at most one volume
//!
//! Transitions are serialized in-process and every write is version-guarded,
//! so a concurrent writer elsewhere fails with a conflict instead of
//! overwriting the association.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::claim::{ClaimError, ClaimId, ClaimState, VolumeClaim};
use crate::domain::error::ProvisioningError;
use crate::domain::events::{ClaimEvent, VolumeEvent};
use crate::domain::repository::{ClaimRepository, Repository, RepositoryError, VolumeRepository};
use crate::domain::storage_class::ReclaimPolicy;
use crate::domain::volume::{Volume, VolumeError, VolumeId, VolumeState};
use crate::infrastructure::event_bus::EventBus;

/// What the caller must do after `reclaim`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimAction {
    /// The volume is `Releasing`; delete it in the cloud, then call
    /// `finalize_volume_deleted`
    DeleteVolume(VolumeId),
    /// The volume outlives the claim as an orphan
    Retained(VolumeId),
    Nothing,
}

#[derive(Debug, Clone, Error)]
pub enum BinderError {
    #[error("Binding conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<VolumeError> for BinderError {
    fn from(err: VolumeError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl From<ClaimError> for BinderError {
    fn from(err: ClaimError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl From<BinderError> for ProvisioningError {
    fn from(err: BinderError) -> Self {
        match err {
            BinderError::Conflict(m) => Self::Conflict(m),
            BinderError::NotFound(m) => Self::NotFound(m),
            BinderError::Repository(e) => e.into(),
        }
    }
}

pub struct Binder {
    claims: Arc<ClaimRepository>,
    volumes: Arc<VolumeRepository>,
    event_bus: Arc<EventBus>,
    lock: Mutex<()>,
}

impl Binder {
    pub fn new(
        claims: Arc<ClaimRepository>,
        volumes: Arc<VolumeRepository>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            claims,
            volumes,
            event_bus,
            lock: Mutex::new(()),
        }
    }

    async fn load_claim(&self, claim_id: &ClaimId) -> Result<VolumeClaim, BinderError> {
        self.claims
            .get(claim_id)
            .await?
            .ok_or_else(|| BinderError::NotFound(format!("claim {}", claim_id)))
    }

    async fn load_volume(&self, volume_id: &VolumeId) -> Result<Volume, BinderError> {
        self.volumes
            .get(volume_id)
            .await?
            .ok_or_else(|| BinderError::NotFound(format!("volume {}", volume_id)))
    }

    /// Pending -> Bound. Binding the same pair again is a no-op.
    pub async fn bind(&self, claim_id: &ClaimId, volume_id: &VolumeId) -> Result<(), BinderError> {
        let _guard = self.lock.lock().await;

        let mut claim = self.load_claim(claim_id).await?;
        let mut volume = self.load_volume(volume_id).await?;

        if claim.bound_volume.as_ref() == Some(volume_id) && volume.bound_claim == Some(*claim_id) {
            return Ok(());
        }
        if claim.is_terminating() {
            return Err(BinderError::Conflict(format!(
                "claim {} is terminating",
                claim.name
            )));
        }
        if volume.capacity_gib < claim.requested_gib {
            return Err(BinderError::Conflict(format!(
                "volume {} has {} GiB, claim {} requests {} GiB",
                volume.id, volume.capacity_gib, claim.name, claim.requested_gib
            )));
        }

        // Validate both sides before writing either
        let volume_was_bound = volume.bound_claim == Some(*claim_id);
        volume.bind(*claim_id)?;
        claim.bind(volume_id.clone())?;
        claim.clear_status();

        let written_volume = if volume_was_bound {
            volume
        } else {
            self.volumes.update(&volume).await?
        };

        if let Err(e) = self.claims.update(&claim).await {
            if !volume_was_bound {
                self.roll_back_volume(written_volume, claim_id).await;
            }
            return Err(e.into());
        }

        info!(claim_id = %claim_id, volume_id = %volume_id, "Claim bound");
        self.event_bus.publish_claim_event(ClaimEvent::VolumeBound {
            claim_id: *claim_id,
            volume_id: volume_id.clone(),
            bound_at: Utc::now(),
        });
        Ok(())
    }

    async fn roll_back_volume(&self, mut volume: Volume, claim_id: &ClaimId) {
        if volume.bound_claim != Some(*claim_id) {
            return;
        }
        volume.unbind();
        if let Err(e) = self.volumes.update(&volume).await {
            warn!(
                volume_id = %volume.id,
                claim_id = %claim_id,
                "Failed to roll back volume binding: {}",
                e
            );
        }
    }

    /// Bound/Lost -> Pending, releasing the volume side as well
    pub async fn unbind(&self, claim_id: &ClaimId) -> Result<(), BinderError> {
        let _guard = self.lock.lock().await;

        let mut claim = self.load_claim(claim_id).await?;
        let Some(volume_id) = claim.bound_volume.clone() else {
            return Ok(());
        };

        if let Some(mut volume) = self.volumes.get(&volume_id).await? {
            if volume.bound_claim == Some(*claim_id) {
                volume.unbind();
                self.volumes.update(&volume).await?;
            }
        }

        claim.unbind();
        self.claims.update(&claim).await?;
        info!(claim_id = %claim_id, volume_id = %volume_id, "Claim unbound");
        Ok(())
    }

    /// Apply the reclaim policy of a terminating claim's volume
    pub async fn reclaim(&self, claim_id: &ClaimId) -> Result<ReclaimAction, BinderError> {
        let _guard = self.lock.lock().await;

        let claim = self.load_claim(claim_id).await?;
        if !claim.is_terminating() {
            return Err(BinderError::Conflict(format!(
                "claim {} has not been deleted",
                claim.name
            )));
        }
        let Some(volume_id) = claim.bound_volume.clone() else {
            return Ok(ReclaimAction::Nothing);
        };
        let Some(mut volume) = self.volumes.get(&volume_id).await? else {
            return Ok(ReclaimAction::Nothing);
        };

        match (volume.reclaim_policy, volume.state) {
            (_, VolumeState::Deleted) => Ok(ReclaimAction::Nothing),
            (ReclaimPolicy::Delete, VolumeState::Releasing) => Ok(ReclaimAction::DeleteVolume(volume_id)),
            (ReclaimPolicy::Retain, VolumeState::Available) if volume.retained => {
                Ok(ReclaimAction::Retained(volume_id))
            }
            (_, VolumeState::Bound) if volume.bound_claim != Some(*claim_id) => {
                Err(BinderError::Conflict(format!(
                    "volume {} is bound to another claim",
                    volume_id
                )))
            }
            (policy, _) => {
                match policy {
                    ReclaimPolicy::Delete => volume.release()?,
                    ReclaimPolicy::Retain => volume.retain()?,
                }
                self.volumes.update(&volume).await?;
                info!(
                    claim_id = %claim_id,
                    volume_id = %volume_id,
                    policy = ?policy,
                    "Volume released"
                );
                self.event_bus.publish_volume_event(VolumeEvent::VolumeReleased {
                    volume_id: volume_id.clone(),
                    claim_id: *claim_id,
                    policy,
                    released_at: Utc::now(),
                });
                Ok(match policy {
                    ReclaimPolicy::Delete => ReclaimAction::DeleteVolume(volume_id),
                    ReclaimPolicy::Retain => ReclaimAction::Retained(volume_id),
                })
            }
        }
    }

    /// Releasing -> Deleted, once the cloud volume is gone
    pub async fn finalize_volume_deleted(&self, volume_id: &VolumeId) -> Result<(), BinderError> {
        let _guard = self.lock.lock().await;

        let mut volume = self.load_volume(volume_id).await?;
        if volume.state == VolumeState::Deleted {
            return Ok(());
        }
        volume.mark_deleted()?;
        self.volumes.update(&volume).await?;

        info!(volume_id = %volume_id, "Volume deleted");
        self.event_bus.publish_volume_event(VolumeEvent::VolumeDeleted {
            volume_id: volume_id.clone(),
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    /// Record that a bound claim's volume no longer exists
    pub async fn mark_lost(&self, claim_id: &ClaimId) -> Result<(), BinderError> {
        let _guard = self.lock.lock().await;

        let mut claim = self.load_claim(claim_id).await?;
        if claim.state == ClaimState::Lost {
            return Ok(());
        }
        let Some(volume_id) = claim.bound_volume.clone() else {
            return Err(BinderError::Conflict(format!(
                "claim {} is not bound",
                claim.name
            )));
        };
        claim.mark_lost();
        claim.set_status("VolumeLost", format!("Volume {} no longer exists", volume_id));
        self.claims.update(&claim).await?;

        warn!(claim_id = %claim_id, volume_id = %volume_id, "Bound volume lost");
        self.event_bus.publish_claim_event(ClaimEvent::ClaimLost {
            claim_id: *claim_id,
            volume_id,
            lost_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::claim::AccessMode;
    use crate::domain::storage_class::StorageClass;
    use crate::infrastructure::repositories::InMemoryRepository;

    struct Fixture {
        binder: Binder,
        claims: Arc<InMemoryRepository<VolumeClaim>>,
        volumes: Arc<InMemoryRepository<Volume>>,
    }

    fn fixture() -> Fixture {
        let claims = Arc::new(InMemoryRepository::<VolumeClaim>::new());
        let volumes = Arc::new(InMemoryRepository::<Volume>::new());
        let binder = Binder::new(
            claims.clone(),
            volumes.clone(),
            Arc::new(EventBus::with_default_capacity()),
        );
        Fixture {
            binder,
            claims,
            volumes,
        }
    }

    async fn seed(f: &Fixture, policy: ReclaimPolicy) -> (ClaimId, VolumeId) {
        let class = StorageClass::new("standard", "p")
            .unwrap()
            .with_reclaim_policy(policy);
        let claim = VolumeClaim::new("data", 20, AccessMode::SingleWriter, "standard").unwrap();
        let mut volume =
            Volume::provisioned(VolumeId::new("vol-1"), 20, "zone-a", false, &class, "tok").unwrap();
        volume.mark_available().unwrap();
        let claim = f.claims.create(&claim).await.unwrap();
        let volume = f.volumes.create(&volume).await.unwrap();
        (claim.id, volume.id)
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let f = fixture();
        let (claim_id, volume_id) = seed(&f, ReclaimPolicy::Delete).await;

        f.binder.bind(&claim_id, &volume_id).await.unwrap();
        let version = f.claims.get(&claim_id).await.unwrap().unwrap().version;
        f.binder.bind(&claim_id, &volume_id).await.unwrap();

        let claim = f.claims.get(&claim_id).await.unwrap().unwrap();
        let volume = f.volumes.get(&volume_id).await.unwrap().unwrap();
        assert_eq!(claim.state, ClaimState::Bound);
        assert_eq!(claim.version, version);
        assert_eq!(volume.state, VolumeState::Bound);
        assert_eq!(volume.bound_claim, Some(claim_id));
    }

    #[tokio::test]
    async fn test_second_claim_conflicts() {
        let f = fixture();
        let (claim_id, volume_id) = seed(&f, ReclaimPolicy::Delete).await;
        let other = VolumeClaim::new("other", 10, AccessMode::SingleWriter, "standard").unwrap();
        let other = f.claims.create(&other).await.unwrap();

        f.binder.bind(&claim_id, &volume_id).await.unwrap();
        let err = f.binder.bind(&other.id, &volume_id).await.unwrap_err();
        assert!(matches!(err, BinderError::Conflict(_)));

        let other = f.claims.get(&other.id).await.unwrap().unwrap();
        assert_eq!(other.state, ClaimState::Pending);
        assert!(other.bound_volume.is_none());
    }

    #[tokio::test]
    async fn test_undersized_volume_is_rejected() {
        let f = fixture();
        let (_, volume_id) = seed(&f, ReclaimPolicy::Delete).await;
        let big = VolumeClaim::new("big", 50, AccessMode::SingleWriter, "standard").unwrap();
        let big = f.claims.create(&big).await.unwrap();

        assert!(matches!(
            f.binder.bind(&big.id, &volume_id).await,
            Err(BinderError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_reclaim_delete_then_finalize() {
        let f = fixture();
        let (claim_id, volume_id) = seed(&f, ReclaimPolicy::Delete).await;
        f.binder.bind(&claim_id, &volume_id).await.unwrap();

        // not deleted yet
        assert!(f.binder.reclaim(&claim_id).await.is_err());

        let mut claim = f.claims.get(&claim_id).await.unwrap().unwrap();
        claim.request_deletion();
        f.claims.update(&claim).await.unwrap();

        let action = f.binder.reclaim(&claim_id).await.unwrap();
        assert_eq!(action, ReclaimAction::DeleteVolume(volume_id.clone()));
        assert_eq!(f.binder.reclaim(&claim_id).await.unwrap(), action);
        assert_eq!(
            f.volumes.get(&volume_id).await.unwrap().unwrap().state,
            VolumeState::Releasing
        );

        f.binder.finalize_volume_deleted(&volume_id).await.unwrap();
        f.binder.finalize_volume_deleted(&volume_id).await.unwrap();
        assert_eq!(
            f.volumes.get(&volume_id).await.unwrap().unwrap().state,
            VolumeState::Deleted
        );
        assert_eq!(f.binder.reclaim(&claim_id).await.unwrap(), ReclaimAction::Nothing);
    }

    #[tokio::test]
    async fn test_reclaim_retain_orphans_volume() {
        let f = fixture();
        let (claim_id, volume_id) = seed(&f, ReclaimPolicy::Retain).await;
        f.binder.bind(&claim_id, &volume_id).await.unwrap();
        let mut claim = f.claims.get(&claim_id).await.unwrap().unwrap();
        claim.request_deletion();
        f.claims.update(&claim).await.unwrap();

        assert_eq!(
            f.binder.reclaim(&claim_id).await.unwrap(),
            ReclaimAction::Retained(volume_id.clone())
        );
        assert_eq!(
            f.binder.reclaim(&claim_id).await.unwrap(),
            ReclaimAction::Retained(volume_id.clone())
        );
        let volume = f.volumes.get(&volume_id).await.unwrap().unwrap();
        assert_eq!(volume.state, VolumeState::Available);
        assert!(volume.retained);
        assert!(volume.bound_claim.is_none());
    }

    #[tokio::test]
    async fn test_unbind_and_mark_lost() {
        let f = fixture();
        let (claim_id, volume_id) = seed(&f, ReclaimPolicy::Delete).await;
        f.binder.bind(&claim_id, &volume_id).await.unwrap();

        f.binder.mark_lost(&claim_id).await.unwrap();
        let claim = f.claims.get(&claim_id).await.unwrap().unwrap();
        assert_eq!(claim.state, ClaimState::Lost);
        assert_eq!(claim.status_reason(), Some("VolumeLost"));

        f.binder.unbind(&claim_id).await.unwrap();
        f.binder.unbind(&claim_id).await.unwrap();
        let claim = f.claims.get(&claim_id).await.unwrap().unwrap();
        let volume = f.volumes.get(&volume_id).await.unwrap().unwrap();
        assert_eq!(claim.state, ClaimState::Pending);
        assert!(claim.bound_volume.is_none());
        assert!(volume.bound_claim.is_none());
        assert_eq!(volume.state, VolumeState::Available);
    }
}
