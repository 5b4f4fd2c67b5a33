// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over tokio broadcast channels. Controllers use
// it as their watch stream: every repository write publishes a resource
// event, and reconcile outcomes publish claim/volume/attachment events.
//
// Events are not persisted. A lagged or restarted subscriber relies on the
// periodic resync to catch up.

use crate::domain::events::{
    AttachmentEvent, ClaimEvent, CredentialEvent, MountEvent, ResourceEvent, VolumeEvent,
};
use crate::domain::repository::ResourceKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Claim(ClaimEvent),
    Volume(VolumeEvent),
    Attachment(AttachmentEvent),
    Mount(MountEvent),
    Credential(CredentialEvent),
    Resource(ResourceEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1024)
    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    pub fn publish_claim_event(&self, event: ClaimEvent) {
        self.publish(DomainEvent::Claim(event));
    }

    pub fn publish_volume_event(&self, event: VolumeEvent) {
        self.publish(DomainEvent::Volume(event));
    }

    pub fn publish_attachment_event(&self, event: AttachmentEvent) {
        self.publish(DomainEvent::Attachment(event));
    }

    pub fn publish_mount_event(&self, event: MountEvent) {
        self.publish(DomainEvent::Mount(event));
    }

    pub fn publish_credential_event(&self, event: CredentialEvent) {
        self.publish(DomainEvent::Credential(event));
    }

    pub fn publish_resource_event(&self, event: ResourceEvent) {
        self.publish(DomainEvent::Resource(event));
    }

    /// Publish a domain event to all subscribers
    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        let receiver = self.sender.subscribe();
        EventReceiver { receiver }
    }

    /// Subscribe to resource writes of the given kinds only
    pub fn subscribe_resources(&self, kinds: &[ResourceKind]) -> ResourceEventReceiver {
        let receiver = self.sender.subscribe();
        ResourceEventReceiver {
            receiver,
            kinds: kinds.to_vec(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Drain everything currently buffered, skipping over lag gaps
    pub fn drain(&mut self) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// Receiver for resource watch notifications (filtered by kind)
pub struct ResourceEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    kinds: Vec<ResourceKind>,
}

impl ResourceEventReceiver {
    pub async fn recv(&mut self) -> Result<ResourceEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;

            if let DomainEvent::Resource(resource_event) = event {
                if self.kinds.contains(&resource_event.kind) {
                    return Ok(resource_event);
                }
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
