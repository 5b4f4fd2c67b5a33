// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! StorageClass - operator-defined provisioning template
//!
//! A class captures everything the provisioner needs to create a volume for a
//! claim: backend parameters, when to provision (binding mode), what happens
//! to the volume when the claim goes away (reclaim policy) and whether claims
//! may grow after binding. Classes are immutable once created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Value Objects
// ============================================================================

/// When a volume is created for a pending claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BindingMode {
    /// Provision as soon as the claim exists
    #[default]
    Immediate,
    /// Provision only after a consumer has been placed on a node, in that node's zone
    WaitForConsumer,
}

/// What happens to a bound volume when its claim is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReclaimPolicy {
    /// Delete the cloud volume
    #[default]
    Delete,
    /// Keep the cloud volume, orphaned, for manual recovery
    Retain,
}

/// Filesystem laid down on first use of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[default]
    Ext4,
    Xfs,
}

impl FsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ext4" => Some(Self::Ext4),
            "xfs" => Some(Self::Xfs),
            _ => None,
        }
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend parameters forwarded to the cloud on create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeParameters {
    /// Provider volume type (e.g. "ssd", "gp3")
    #[serde(default = "default_volume_type")]
    pub volume_type: String,

    /// Provisioned IOPS, if the volume type supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u32>,

    /// Provisioned throughput in MiB/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_mibps: Option<u32>,

    /// Request encryption at rest
    #[serde(default)]
    pub encrypted: bool,

    /// Filesystem created on first mount
    #[serde(default)]
    pub fs_type: FsType,
}

fn default_volume_type() -> String {
    "ssd".to_string()
}

impl Default for VolumeParameters {
    fn default() -> Self {
        Self {
            volume_type: default_volume_type(),
            iops: None,
            throughput_mibps: None,
            encrypted: false,
            fs_type: FsType::default(),
        }
    }
}

// ============================================================================
// Aggregate Root: StorageClass
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClass {
    /// Unique class name, referenced by claims
    pub name: String,

    /// Provisioner responsible for this class
    pub provisioner_id: String,

    #[serde(default)]
    pub parameters: VolumeParameters,

    #[serde(default)]
    pub binding_mode: BindingMode,

    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,

    #[serde(default)]
    pub allow_expansion: bool,

    /// Zones volumes of this class may live in. Empty means any zone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_zones: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub version: u64,
}

impl StorageClass {
    pub fn new(
        name: impl Into<String>,
        provisioner_id: impl Into<String>,
    ) -> Result<Self, StorageClassError> {
        let class = Self {
            name: name.into(),
            provisioner_id: provisioner_id.into(),
            parameters: VolumeParameters::default(),
            binding_mode: BindingMode::default(),
            reclaim_policy: ReclaimPolicy::default(),
            allow_expansion: false,
            allowed_zones: Vec::new(),
            created_at: Utc::now(),
            version: 0,
        };
        class.validate()?;
        Ok(class)
    }

    pub fn with_binding_mode(mut self, mode: BindingMode) -> Self {
        self.binding_mode = mode;
        self
    }

    pub fn with_reclaim_policy(mut self, policy: ReclaimPolicy) -> Self {
        self.reclaim_policy = policy;
        self
    }

    pub fn with_expansion(mut self, allow: bool) -> Self {
        self.allow_expansion = allow;
        self
    }

    pub fn with_allowed_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_zones = zones.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: VolumeParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Whether a volume of this class may be created in `zone`
    pub fn allows_zone(&self, zone: &str) -> bool {
        self.allowed_zones.is_empty() || self.allowed_zones.iter().any(|z| z == zone)
    }

    pub fn validate(&self) -> Result<(), StorageClassError> {
        if self.name.trim().is_empty() {
            return Err(StorageClassError::InvalidName(
                "StorageClass name cannot be empty".to_string(),
            ));
        }
        if self.provisioner_id.trim().is_empty() {
            return Err(StorageClassError::InvalidParameters(format!(
                "StorageClass {} has no provisioner",
                self.name
            )));
        }
        if self.parameters.volume_type.trim().is_empty() {
            return Err(StorageClassError::InvalidParameters(format!(
                "StorageClass {} has an empty volume type",
                self.name
            )));
        }
        if self.parameters.iops == Some(0) || self.parameters.throughput_mibps == Some(0) {
            return Err(StorageClassError::InvalidParameters(format!(
                "StorageClass {} declares zero IOPS or throughput",
                self.name
            )));
        }
        if self.allowed_zones.iter().any(|z| z.trim().is_empty()) {
            return Err(StorageClassError::InvalidParameters(format!(
                "StorageClass {} lists an empty zone",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StorageClassError {
    #[error("Invalid storage class name: {0}")]
    InvalidName(String),

    #[error("Invalid storage class parameters: {0}")]
    InvalidParameters(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let class = StorageClass::new("standard", "aegis.100monkeys.ai/block").unwrap();
        assert_eq!(class.binding_mode, BindingMode::Immediate);
        assert_eq!(class.reclaim_policy, ReclaimPolicy::Delete);
        assert!(!class.allow_expansion);
        assert_eq!(class.parameters.fs_type, FsType::Ext4);
        assert!(class.allows_zone("any-zone"));
    }

    #[test]
    fn test_allowed_zones() {
        let class = StorageClass::new("zonal", "p")
            .unwrap()
            .with_allowed_zones(["zone-a", "zone-b"]);
        assert!(class.allows_zone("zone-a"));
        assert!(!class.allows_zone("zone-c"));
    }

    #[test]
    fn test_validation_rejects_empty_name() {
        assert!(StorageClass::new("  ", "p").is_err());
        assert!(StorageClass::new("ok", "").is_err());
    }

    #[test]
    fn test_yaml_parse() {
        let yaml = r#"
name: fast
provisionerId: aegis.100monkeys.ai/block
bindingMode: WaitForConsumer
reclaimPolicy: Retain
allowExpansion: true
parameters:
  volumeType: gp3
  iops: 3000
  encrypted: true
  fsType: xfs
"#;
        let class: StorageClass = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(class.binding_mode, BindingMode::WaitForConsumer);
        assert_eq!(class.reclaim_policy, ReclaimPolicy::Retain);
        assert_eq!(class.parameters.fs_type, FsType::Xfs);
        assert_eq!(class.parameters.iops, Some(3000));
        assert!(class.validate().is_ok());
    }

    #[test]
    fn test_fs_type_parse() {
        assert_eq!(FsType::parse("EXT4"), Some(FsType::Ext4));
        assert_eq!(FsType::parse("xfs\n"), Some(FsType::Xfs));
        assert_eq!(FsType::parse("btrfs"), None);
    }
}
