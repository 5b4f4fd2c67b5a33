// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a schedulable node, as reported by the node surface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node that can host consumers of claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,

    /// Availability zone the node runs in
    pub zone: String,

    /// Node is alive and its mount agent is reporting
    #[serde(default = "default_ready")]
    pub ready: bool,

    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,

    #[serde(default)]
    pub version: u64,
}

fn default_ready() -> bool {
    true
}

impl Node {
    pub fn new(id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            zone: zone.into(),
            ready: true,
            registered_at: Utc::now(),
            version: 0,
        }
    }

    pub fn mark_not_ready(&mut self) {
        self.ready = false;
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }
}
