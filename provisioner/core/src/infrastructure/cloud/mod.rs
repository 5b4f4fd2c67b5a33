// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Block-storage provider backends

pub mod http;
pub mod memory;
pub mod retry;

use std::sync::Arc;
use tracing::info;

use crate::domain::cloud::{CloudBlockStorageClient, CloudError};
use crate::domain::config::{CloudBackendConfig, CloudConfig};

pub use http::HttpBlockStorage;
pub use memory::{CloudCallCounts, SimulatedCloud};
pub use retry::RetryPolicy;

/// Build the backend selected by configuration
pub fn build_backend(config: &CloudConfig) -> Result<Arc<dyn CloudBlockStorageClient>, CloudError> {
    match &config.backend {
        CloudBackendConfig::Http { endpoint } => {
            info!(endpoint = %endpoint, "Using HTTP block-storage backend");
            Ok(Arc::new(HttpBlockStorage::new(endpoint.clone(), config.call_timeout)?))
        }
        CloudBackendConfig::Simulated { settle_polls } => {
            info!(settle_polls, "Using simulated block-storage backend");
            Ok(Arc::new(SimulatedCloud::with_settle_polls(*settle_polls)))
        }
    }
}

impl From<&CloudConfig> for RetryPolicy {
    fn from(config: &CloudConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_backoff,
            max_delay: config.max_backoff,
        }
    }
}
