// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the versioned resource store defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Hold claims, volumes, storage classes, attachments and nodes
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryRepository** - `RwLock<HashMap>` storage with optimistic
//!   versioning. Every successful write is published on the event bus as a
//!   `ResourceEvent`, which is what the controllers watch.
//!
//! # Versioning
//!
//! `create` stamps version 1. `update` succeeds only when the presented
//! version equals the stored one, and bumps it. A losing writer gets
//! `RepositoryError::VersionConflict`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::domain::attachment::VolumeAttachment;
use crate::domain::claim::VolumeClaim;
use crate::domain::events::{ResourceChange, ResourceEvent};
use crate::domain::node::Node;
use crate::domain::repository::{Repository, RepositoryError, Resource, ResourceStores};
use crate::domain::storage_class::StorageClass;
use crate::domain::volume::Volume;
use crate::infrastructure::event_bus::EventBus;

/// Watched in-memory stores for every resource kind. Storage classes are
/// immutable once created.
pub fn in_memory_stores(event_bus: Arc<EventBus>) -> ResourceStores {
    ResourceStores {
        claims: Arc::new(InMemoryRepository::<VolumeClaim>::with_event_bus(event_bus.clone())),
        volumes: Arc::new(InMemoryRepository::<Volume>::with_event_bus(event_bus.clone())),
        classes: Arc::new(InMemoryRepository::<StorageClass>::with_event_bus(event_bus.clone()).immutable()),
        attachments: Arc::new(InMemoryRepository::<VolumeAttachment>::with_event_bus(event_bus.clone())),
        nodes: Arc::new(InMemoryRepository::<Node>::with_event_bus(event_bus)),
    }
}

pub struct InMemoryRepository<T: Resource> {
    items: RwLock<HashMap<T::Key, T>>,
    event_bus: Option<Arc<EventBus>>,
    immutable: bool,
}

impl<T: Resource> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            event_bus: None,
            immutable: false,
        }
    }

    /// Store that publishes a watch event for every write
    pub fn with_event_bus(event_bus: Arc<EventBus>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            event_bus: Some(event_bus),
            immutable: false,
        }
    }

    /// Objects may be created and deleted but never updated
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn notify(&self, key: &T::Key, change: ResourceChange, version: u64) {
        if let Some(bus) = &self.event_bus {
            bus.publish_resource_event(ResourceEvent {
                kind: T::KIND,
                key: key.to_string(),
                change,
                version,
            });
        }
    }
}

impl<T: Resource> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource> Repository<T> for InMemoryRepository<T> {
    async fn create(&self, item: &T) -> Result<T, RepositoryError> {
        let key = item.key();
        let stored = {
            let mut items = self.items.write();
            if items.contains_key(&key) {
                return Err(RepositoryError::AlreadyExists(key.to_string()));
            }
            let mut stored = item.clone();
            stored.set_version(1);
            items.insert(key.clone(), stored.clone());
            stored
        };
        debug!(kind = ?T::KIND, key = %key, "Created resource");
        self.notify(&key, ResourceChange::Created, 1);
        Ok(stored)
    }

    async fn update(&self, item: &T) -> Result<T, RepositoryError> {
        let key = item.key();
        if self.immutable {
            return Err(RepositoryError::Immutable(key.to_string()));
        }
        let stored = {
            let mut items = self.items.write();
            let current = items
                .get(&key)
                .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;
            if current.version() != item.version() {
                return Err(RepositoryError::VersionConflict {
                    key: key.to_string(),
                    expected: item.version(),
                    actual: current.version(),
                });
            }
            let mut stored = item.clone();
            stored.set_version(item.version() + 1);
            items.insert(key.clone(), stored.clone());
            stored
        };
        self.notify(&key, ResourceChange::Updated, stored.version());
        Ok(stored)
    }

    async fn get(&self, key: &T::Key) -> Result<Option<T>, RepositoryError> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<T>, RepositoryError> {
        Ok(self.items.read().values().cloned().collect())
    }

    async fn delete(&self, key: &T::Key) -> Result<(), RepositoryError> {
        let removed = self.items.write().remove(key);
        if let Some(item) = removed {
            debug!(kind = ?T::KIND, key = %key, "Deleted resource");
            self.notify(key, ResourceChange::Deleted, item.version());
        }
        Ok(())
    }
}
