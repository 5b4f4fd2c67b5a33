// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Claim API
//!
//! The user-facing surface over the claim store: create, inspect, delete and
//! resize claims, and the scheduling feed that places a claim's consumer on a
//! node. Every call records intent only; the controllers act on it.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::claim::{AccessMode, ClaimId, ClaimState, VolumeClaim};
use crate::domain::error::ProvisioningError;
use crate::domain::node::NodeId;
use crate::domain::repository::{ClaimRepository, RepositoryError, StorageClassRepository};

/// Read-modify-write attempts before a version conflict is returned
const MAX_WRITE_ATTEMPTS: usize = 5;

#[async_trait]
pub trait ClaimService: Send + Sync {
    async fn create_claim(
        &self,
        name: &str,
        requested_gib: u64,
        access_mode: AccessMode,
        storage_class: &str,
    ) -> Result<VolumeClaim, ProvisioningError>;
    async fn get_claim(&self, id: ClaimId) -> Result<VolumeClaim, ProvisioningError>;
    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, ProvisioningError>;
    /// Begin two-phase deletion; the claim disappears once reclaimed
    async fn delete_claim(&self, id: ClaimId) -> Result<(), ProvisioningError>;
    async fn place_consumer(
        &self,
        id: ClaimId,
        node: NodeId,
        target_path: PathBuf,
    ) -> Result<VolumeClaim, ProvisioningError>;
    async fn remove_consumer(&self, id: ClaimId) -> Result<VolumeClaim, ProvisioningError>;
    async fn resize_claim(&self, id: ClaimId, new_gib: u64) -> Result<VolumeClaim, ProvisioningError>;
}

pub struct StandardClaimService {
    claims: Arc<ClaimRepository>,
    classes: Arc<StorageClassRepository>,
}

impl StandardClaimService {
    pub fn new(claims: Arc<ClaimRepository>, classes: Arc<StorageClassRepository>) -> Self {
        Self { claims, classes }
    }

    async fn load(&self, id: ClaimId) -> Result<VolumeClaim, ProvisioningError> {
        self.claims
            .get(&id)
            .await?
            .ok_or_else(|| ProvisioningError::NotFound(format!("claim {}", id)))
    }

    /// Apply `change` to a fresh copy until the write wins
    async fn modify<F>(&self, id: ClaimId, mut change: F) -> Result<VolumeClaim, ProvisioningError>
    where
        F: FnMut(&mut VolumeClaim) -> Result<(), ProvisioningError> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut claim = self.load(id).await?;
            change(&mut claim)?;
            match self.claims.update(&claim).await {
                Ok(stored) => return Ok(stored),
                Err(RepositoryError::VersionConflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(claim_id = %id, attempt, "Claim changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl ClaimService for StandardClaimService {
    async fn create_claim(
        &self,
        name: &str,
        requested_gib: u64,
        access_mode: AccessMode,
        storage_class: &str,
    ) -> Result<VolumeClaim, ProvisioningError> {
        let claim = VolumeClaim::new(name, requested_gib, access_mode, storage_class)?;
        let claim = self.claims.create(&claim).await?;
        info!(claim_id = %claim.id, name, requested_gib, storage_class, "Claim created");
        Ok(claim)
    }

    async fn get_claim(&self, id: ClaimId) -> Result<VolumeClaim, ProvisioningError> {
        self.load(id).await
    }

    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, ProvisioningError> {
        let mut claims = self.claims.list().await?;
        claims.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(claims)
    }

    async fn delete_claim(&self, id: ClaimId) -> Result<(), ProvisioningError> {
        self.modify(id, |claim| {
            claim.request_deletion();
            claim.clear_status();
            Ok(())
        })
        .await?;
        info!(claim_id = %id, "Claim deletion requested");
        Ok(())
    }

    async fn place_consumer(
        &self,
        id: ClaimId,
        node: NodeId,
        target_path: PathBuf,
    ) -> Result<VolumeClaim, ProvisioningError> {
        let claim = self
            .modify(id, |claim| {
                if claim.is_terminating() {
                    return Err(ProvisioningError::Conflict(format!("claim {} is terminating", claim.name)));
                }
                claim.place_consumer(node.clone(), target_path.clone());
                claim.clear_status();
                Ok(())
            })
            .await?;
        info!(claim_id = %id, node_id = %node, target = %target_path.display(), "Consumer placed");
        Ok(claim)
    }

    async fn remove_consumer(&self, id: ClaimId) -> Result<VolumeClaim, ProvisioningError> {
        let claim = self
            .modify(id, |claim| {
                claim.clear_consumer();
                claim.clear_status();
                Ok(())
            })
            .await?;
        info!(claim_id = %id, "Consumer removed");
        Ok(claim)
    }

    async fn resize_claim(&self, id: ClaimId, new_gib: u64) -> Result<VolumeClaim, ProvisioningError> {
        let current = self.load(id).await?;
        let class = self
            .classes
            .get(&current.storage_class)
            .await?
            .ok_or_else(|| ProvisioningError::NotFound(format!("storage class {}", current.storage_class)))?;
        if !class.allow_expansion && new_gib != current.requested_gib {
            return Err(ProvisioningError::Conflict(format!(
                "storage class {} does not allow expansion",
                class.name
            )));
        }

        let claim = self
            .modify(id, |claim| {
                if claim.is_terminating() {
                    return Err(ProvisioningError::Conflict(format!("claim {} is terminating", claim.name)));
                }
                if claim.state == ClaimState::Pending && claim.provisioning.is_some() {
                    return Err(ProvisioningError::Busy(format!(
                        "claim {} is being provisioned",
                        claim.name
                    )));
                }
                claim.request_resize(new_gib)?;
                claim.clear_status();
                Ok(())
            })
            .await?;
        info!(claim_id = %id, requested_gib = new_gib, "Claim resize requested");
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::ResourceStores;
    use crate::domain::storage_class::StorageClass;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::in_memory_stores;

    async fn service(allow_expansion: bool) -> (StandardClaimService, ResourceStores) {
        let stores = in_memory_stores(Arc::new(EventBus::new(256)));
        let class = StorageClass::new("standard", "p")
            .unwrap()
            .with_expansion(allow_expansion);
        stores.classes.create(&class).await.unwrap();
        (
            StandardClaimService::new(stores.claims.clone(), stores.classes.clone()),
            stores,
        )
    }

    #[tokio::test]
    async fn test_create_and_place_consumer() {
        let (svc, _) = service(false).await;
        let claim = svc
            .create_claim("data", 20, AccessMode::SingleWriter, "standard")
            .await
            .unwrap();
        assert_eq!(claim.state, ClaimState::Pending);

        let placed = svc
            .place_consumer(claim.id, NodeId::new("node-a"), PathBuf::from("/data"))
            .await
            .unwrap();
        let hint = placed.consumer.unwrap();
        assert_eq!(hint.node, NodeId::new("node-a"));
        assert_eq!(hint.target_path, PathBuf::from("/data"));

        let cleared = svc.remove_consumer(claim.id).await.unwrap();
        assert!(cleared.consumer.is_none());
    }

    #[tokio::test]
    async fn test_invalid_claims_are_rejected() {
        let (svc, _) = service(false).await;
        assert!(svc
            .create_claim("", 20, AccessMode::SingleWriter, "standard")
            .await
            .is_err());
        assert!(svc
            .create_claim("data", 0, AccessMode::SingleWriter, "standard")
            .await
            .is_err());
        let err = svc.get_claim(ClaimId::new()).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resize_rules() {
        let (fixed, _) = service(false).await;
        let claim = fixed
            .create_claim("data", 20, AccessMode::SingleWriter, "standard")
            .await
            .unwrap();
        let err = fixed.resize_claim(claim.id, 30).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Conflict(_)));

        let (expandable, _) = service(true).await;
        let claim = expandable
            .create_claim("data", 20, AccessMode::SingleWriter, "standard")
            .await
            .unwrap();
        assert!(expandable.resize_claim(claim.id, 10).await.is_err());
        let grown = expandable.resize_claim(claim.id, 30).await.unwrap();
        assert_eq!(grown.requested_gib, 30);
    }

    #[tokio::test]
    async fn test_resize_waits_for_open_provisioning_attempt() {
        let (svc, stores) = service(true).await;
        let claim = svc
            .create_claim("data", 20, AccessMode::SingleWriter, "standard")
            .await
            .unwrap();
        let mut stored = stores.claims.get(&claim.id).await.unwrap().unwrap();
        stored.begin_provisioning("zone-a");
        stores.claims.update(&stored).await.unwrap();

        let err = svc.resize_claim(claim.id, 30).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Busy(_)));
    }

    #[tokio::test]
    async fn test_delete_marks_terminating_and_clears_status() {
        let (svc, stores) = service(false).await;
        let claim = svc
            .create_claim("data", 20, AccessMode::SingleWriter, "standard")
            .await
            .unwrap();
        let mut stored = stores.claims.get(&claim.id).await.unwrap().unwrap();
        stored.record_failure("Throttled", "slow down");
        stores.claims.update(&stored).await.unwrap();

        svc.delete_claim(claim.id).await.unwrap();

        let claim = svc.get_claim(claim.id).await.unwrap();
        assert!(claim.is_terminating());
        assert_eq!(claim.state, ClaimState::Terminating);
        assert_eq!(claim.status.consecutive_failures, 0);
        assert!(svc
            .place_consumer(claim.id, NodeId::new("node-a"), PathBuf::from("/data"))
            .await
            .is_err());
    }
}
