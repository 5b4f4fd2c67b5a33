// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Level-triggered controller runtime
//!
//! A controller is a `Reconciler` (observe, plan, act for one key) driven by a
//! `ControllerRunner`, which owns the work queue, the watch subscription and
//! the periodic resync.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Shared loop for the claim, attach/detach and mount controllers
//!
//! Error handling per reconcile follows `ErrorClass`: transient and conflict
//! errors requeue with per-key exponential backoff, fatal errors are logged and
//! left for the next resync, benign errors count as success.

use async_trait::async_trait;
use metrics::{counter, histogram};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::work_queue::WorkQueue;
use crate::domain::error::{ErrorClass, ProvisioningError};
use crate::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError};

/// What to do with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Never,
    Immediately,
    After(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    /// Controller name used in logs and metric labels
    const NAME: &'static str;

    async fn reconcile(&self, key: &Self::Key) -> Result<Requeue, ProvisioningError>;

    /// Every key this controller is responsible for (full resync)
    async fn keys(&self) -> Result<Vec<Self::Key>, ProvisioningError>;

    /// Keys affected by a watched event
    async fn keys_for_event(&self, event: &DomainEvent) -> Vec<Self::Key>;
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync_period: Duration,
    pub requeue_base: Duration,
    pub requeue_max: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(30),
            requeue_base: Duration::from_millis(500),
            requeue_max: Duration::from_secs(60),
        }
    }
}

pub struct ControllerRunner<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
    event_bus: Arc<EventBus>,
    settings: ControllerSettings,
    shutdown_token: CancellationToken,
}

impl<R: Reconciler> ControllerRunner<R> {
    pub fn new(reconciler: Arc<R>, event_bus: Arc<EventBus>, settings: ControllerSettings) -> Self {
        let queue = Arc::new(WorkQueue::new(settings.requeue_base, settings.requeue_max));
        Self {
            reconciler,
            queue,
            event_bus,
            settings,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Runner that stops when `parent` is cancelled
    pub fn with_shutdown_token(mut self, parent: &CancellationToken) -> Self {
        self.shutdown_token = parent.child_token();
        self
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn enqueue(&self, key: R::Key) {
        self.queue.add(key);
    }

    pub fn queue(&self) -> Arc<WorkQueue<R::Key>> {
        self.queue.clone()
    }

    /// Start workers, watch and resync. The handle resolves after shutdown.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            controller = R::NAME,
            workers = self.settings.workers,
            resync_period_secs = self.settings.resync_period.as_secs(),
            "Starting controller"
        );

        // Subscribe before the first resync so no write falls in between
        let mut events = self.event_bus.subscribe();

        let mut handles = Vec::with_capacity(self.settings.workers);
        for worker in 0..self.settings.workers.max(1) {
            let reconciler = self.reconciler.clone();
            let queue = self.queue.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, reconciler, queue).await;
            }));
        }

        let mut tick = interval(self.settings.resync_period);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.resync().await;
                }
                received = events.recv() => {
                    match received {
                        Ok(event) => {
                            for key in self.reconciler.keys_for_event(&event).await {
                                self.queue.add(key);
                            }
                        }
                        Err(EventBusError::Lagged(n)) => {
                            warn!(controller = R::NAME, missed = n, "Watch lagged, resyncing");
                            self.resync().await;
                        }
                        Err(_) => {
                            warn!(controller = R::NAME, "Event bus closed, stopping watch");
                            self.shutdown_token.cancel();
                        }
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!(controller = R::NAME, "Shutdown signal received, stopping controller");
                    break;
                }
            }
        }

        self.queue.shut_down();
        for handle in handles {
            let _ = handle.await;
        }

        info!(controller = R::NAME, "Controller stopped");
    }

    async fn resync(&self) {
        match self.reconciler.keys().await {
            Ok(keys) => {
                debug!(controller = R::NAME, count = keys.len(), "Resync");
                for key in keys {
                    self.queue.add(key);
                }
            }
            Err(e) => {
                warn!(controller = R::NAME, "Resync listing failed: {}", e);
            }
        }
    }
}

async fn worker_loop<R: Reconciler>(worker: usize, reconciler: Arc<R>, queue: Arc<WorkQueue<R::Key>>) {
    debug!(controller = R::NAME, worker, "Worker started");

    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let result = reconciler.reconcile(&key).await;
        histogram!("aegis_provisioner_reconcile_duration_seconds", "controller" => R::NAME)
            .record(started.elapsed().as_secs_f64());
        counter!("aegis_provisioner_reconciles_total", "controller" => R::NAME).increment(1);

        match result {
            Ok(Requeue::Never) => queue.forget(&key),
            Ok(Requeue::Immediately) => {
                queue.forget(&key);
                queue.add(key.clone());
            }
            Ok(Requeue::After(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                counter!(
                    "aegis_provisioner_reconcile_errors_total",
                    "controller" => R::NAME,
                    "reason" => e.reason()
                )
                .increment(1);
                handle_error::<R>(&queue, &key, e);
            }
        }

        queue.done(&key);
    }

    debug!(controller = R::NAME, worker, "Worker stopped");
}

fn handle_error<R: Reconciler>(queue: &Arc<WorkQueue<R::Key>>, key: &R::Key, e: ProvisioningError) {
    match e.class() {
        ErrorClass::Transient | ErrorClass::Conflict => {
            let delay = queue.add_rate_limited(key.clone());
            warn!(
                controller = R::NAME,
                key = %key,
                retry_in_ms = delay.as_millis() as u64,
                "Reconcile failed: {}",
                e
            );
        }
        ErrorClass::Fatal => {
            queue.forget(key);
            error!(controller = R::NAME, key = %key, "Reconcile failed permanently: {}", e);
        }
        ErrorClass::Benign => {
            queue.forget(key);
            debug!(controller = R::NAME, key = %key, "Reconcile ignored: {}", e);
        }
    }
}
