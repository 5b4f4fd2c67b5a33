// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource manifests for the in-process control plane
//!
//! Multi-document YAML files declaring `StorageClass`, `VolumeClaim` and
//! `Node` objects in the same apiVersion/kind/metadata/spec shape as the
//! provisioner configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use aegis_provisioner_core::application::claims::ClaimService;
use aegis_provisioner_core::domain::claim::AccessMode;
use aegis_provisioner_core::domain::config::API_VERSION;
use aegis_provisioner_core::domain::node::{Node, NodeId};
use aegis_provisioner_core::domain::repository::ResourceStores;
use aegis_provisioner_core::domain::storage_class::{
    BindingMode, ReclaimPolicy, StorageClass, VolumeParameters,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    StorageClass(StorageClassManifest),
    VolumeClaim(VolumeClaimManifest),
    Node(NodeManifest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageClassManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub metadata: Metadata,
    pub spec: StorageClassSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassSpec {
    /// Defaults to the provisioner id of the running control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_id: Option<String>,
    #[serde(default)]
    pub parameters: VolumeParameters,
    #[serde(default)]
    pub binding_mode: BindingMode,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub allow_expansion: bool,
    #[serde(default)]
    pub allowed_zones: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeClaimManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub metadata: Metadata,
    pub spec: VolumeClaimSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimSpec {
    pub storage_class: String,
    /// Requested capacity in GiB
    pub size_gib: u64,
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Placement decided up front, as a scheduler would
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSpec {
    pub node: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub metadata: Metadata,
    pub spec: NodeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub zone: String,
}

impl Manifest {
    fn api_version(&self) -> &str {
        match self {
            Manifest::StorageClass(m) => &m.api_version,
            Manifest::VolumeClaim(m) => &m.api_version,
            Manifest::Node(m) => &m.api_version,
        }
    }

    fn name(&self) -> &str {
        match self {
            Manifest::StorageClass(m) => &m.metadata.name,
            Manifest::VolumeClaim(m) => &m.metadata.name,
            Manifest::Node(m) => &m.metadata.name,
        }
    }
}

/// Parse every document in `yaml`; empty documents are skipped
pub fn parse_manifests(yaml: &str) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("Document {} is not valid YAML", index + 1))?;
        if value.is_null() {
            continue;
        }
        let manifest: Manifest = serde_yaml::from_value(value)
            .with_context(|| format!("Document {} is not a recognized manifest", index + 1))?;
        if manifest.api_version() != API_VERSION {
            anyhow::bail!(
                "Manifest '{}' has apiVersion '{}', expected '{}'",
                manifest.name(),
                manifest.api_version(),
                API_VERSION
            );
        }
        manifests.push(manifest);
    }
    Ok(manifests)
}

pub fn load_manifest_files(paths: &[PathBuf]) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for path in paths {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        manifests.extend(
            parse_manifests(&yaml).with_context(|| format!("Invalid manifest file {:?}", path))?,
        );
    }
    Ok(manifests)
}

impl StorageClassManifest {
    pub fn to_storage_class(&self, default_provisioner: &str) -> Result<StorageClass> {
        let spec = &self.spec;
        let class = StorageClass::new(
            self.metadata.name.clone(),
            spec.provisioner_id
                .clone()
                .unwrap_or_else(|| default_provisioner.to_string()),
        )?
        .with_parameters(spec.parameters.clone())
        .with_binding_mode(spec.binding_mode)
        .with_reclaim_policy(spec.reclaim_policy)
        .with_expansion(spec.allow_expansion)
        .with_allowed_zones(spec.allowed_zones.clone());
        class.validate()?;
        Ok(class)
    }
}

/// Names of the nodes declared in `manifests`
pub fn declared_nodes(manifests: &[Manifest]) -> Vec<NodeId> {
    manifests
        .iter()
        .filter_map(|m| match m {
            Manifest::Node(node) => Some(NodeId::new(node.metadata.name.clone())),
            _ => None,
        })
        .collect()
}

/// Create the declared objects: classes and nodes first, then claims
pub async fn apply(
    manifests: &[Manifest],
    stores: &ResourceStores,
    claims: &dyn ClaimService,
    default_provisioner: &str,
) -> Result<()> {
    for manifest in manifests {
        match manifest {
            Manifest::StorageClass(m) => {
                let class = m.to_storage_class(default_provisioner)?;
                stores
                    .classes
                    .create(&class)
                    .await
                    .with_context(|| format!("Failed to create storage class '{}'", class.name))?;
                info!(class = %class.name, binding_mode = ?class.binding_mode, "Storage class created");
            }
            Manifest::Node(m) => {
                let node = Node::new(m.metadata.name.clone(), m.spec.zone.clone());
                stores
                    .nodes
                    .create(&node)
                    .await
                    .with_context(|| format!("Failed to register node '{}'", node.id))?;
                info!(node_id = %node.id, zone = %node.zone, "Node registered");
            }
            Manifest::VolumeClaim(_) => {}
        }
    }

    for manifest in manifests {
        let Manifest::VolumeClaim(m) = manifest else {
            continue;
        };
        let claim = claims
            .create_claim(
                &m.metadata.name,
                m.spec.size_gib,
                m.spec.access_mode,
                &m.spec.storage_class,
            )
            .await
            .with_context(|| format!("Failed to create claim '{}'", m.metadata.name))?;
        if let Some(consumer) = &m.spec.consumer {
            claims
                .place_consumer(claim.id, NodeId::new(consumer.node.clone()), consumer.path.clone())
                .await
                .with_context(|| format!("Failed to place consumer for claim '{}'", m.metadata.name))?;
        }
    }
    Ok(())
}

/// Bundled demo manifests written by `config generate --examples`
pub fn demo_manifests_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name("aegis-volumes.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_provisioner_core::domain::storage_class::FsType;

    const MANIFESTS: &str = r#"
---
apiVersion: 100monkeys.ai/v1
kind: StorageClass
metadata:
  name: fast
spec:
  bindingMode: WaitForConsumer
  reclaimPolicy: Retain
  allowExpansion: true
  allowedZones: [zone-a]
  parameters:
    volumeType: gp3
    iops: 3000
    fsType: xfs
---
apiVersion: 100monkeys.ai/v1
kind: Node
metadata:
  name: node-a
spec:
  zone: zone-a
---
apiVersion: 100monkeys.ai/v1
kind: VolumeClaim
metadata:
  name: data
spec:
  storageClass: fast
  sizeGib: 20
  accessMode: ManyReaders
  consumer:
    node: node-a
    path: /var/lib/data
"#;

    #[test]
    fn test_parse_multi_document_manifests() {
        let manifests = parse_manifests(MANIFESTS).unwrap();
        assert_eq!(manifests.len(), 3);

        let Manifest::StorageClass(class) = &manifests[0] else {
            panic!("expected a storage class");
        };
        let class = class.to_storage_class("aegis.100monkeys.ai/block").unwrap();
        assert_eq!(class.binding_mode, BindingMode::WaitForConsumer);
        assert_eq!(class.reclaim_policy, ReclaimPolicy::Retain);
        assert_eq!(class.parameters.fs_type, FsType::Xfs);
        assert_eq!(class.parameters.iops, Some(3000));
        assert_eq!(class.provisioner_id, "aegis.100monkeys.ai/block");
        assert!(class.allows_zone("zone-a"));
        assert!(!class.allows_zone("zone-b"));

        let Manifest::VolumeClaim(claim) = &manifests[2] else {
            panic!("expected a claim");
        };
        assert_eq!(claim.spec.size_gib, 20);
        assert_eq!(claim.spec.access_mode, AccessMode::ManyReaders);
        assert_eq!(
            claim.spec.consumer.as_ref().map(|c| c.node.as_str()),
            Some("node-a")
        );

        assert_eq!(declared_nodes(&manifests), vec![NodeId::new("node-a")]);
    }

    #[test]
    fn test_unknown_kind_and_wrong_api_version_are_rejected() {
        let unknown = "apiVersion: 100monkeys.ai/v1\nkind: Pod\nmetadata:\n  name: x\nspec: {}\n";
        assert!(parse_manifests(unknown).is_err());

        let wrong = "apiVersion: v0\nkind: Node\nmetadata:\n  name: n\nspec:\n  zone: z\n";
        let err = parse_manifests(wrong).unwrap_err();
        assert!(err.to_string().contains("apiVersion"));
    }

    #[test]
    fn test_load_manifest_files_reads_every_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("classes.yaml");
        let second = dir.path().join("nodes.yaml");
        std::fs::write(&first, MANIFESTS).unwrap();
        std::fs::write(
            &second,
            "apiVersion: 100monkeys.ai/v1\nkind: Node\nmetadata:\n  name: node-b\nspec:\n  zone: zone-b\n",
        )
        .unwrap();

        let manifests = load_manifest_files(&[first, second]).unwrap();
        assert_eq!(manifests.len(), 4);
        assert_eq!(declared_nodes(&manifests).len(), 2);
    }
}
