// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Provisioner Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) covering:
// - Cluster zones used when a claim has no placement
// - Federation: identity token source, exchange endpoint, principals
// - Cloud backend selection, deadlines and throttling retry
// - Controller worker counts, resync and polling
// - Node mount agent settings
// - Logging

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::credential::{Principal, PrincipalId, TrustCondition};

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "ProvisionerConfig";
/// Provisioner identity written into storage classes this deployment serves
pub const DEFAULT_PROVISIONER_ID: &str = "aegis.100monkeys.ai/block";

/// Top-level provisioner configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ProvisionerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ProvisionerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionerSpec {
    #[serde(default)]
    pub cluster: ClusterConfig,

    pub federation: FederationConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub controllers: ControllerConfig,

    #[serde(default)]
    pub node: NodeAgentConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Storage classes naming another provisioner are left alone
    #[serde(default = "default_provisioner_id")]
    pub provisioner_id: String,

    /// Zones eligible for claims provisioned before any placement
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Identity provider issuer URL; discovery metadata is read from here
    pub issuer: String,

    /// Explicit token-exchange endpoint, skipping discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    pub identity_token: IdentityTokenConfig,

    #[serde(default)]
    pub principals: Vec<PrincipalConfig>,

    /// Credentials are never handed out with less than this left
    #[serde(with = "humantime_serde", default = "default_safety_margin")]
    pub safety_margin: Duration,

    /// Background refresh fires this long before the safety margin
    #[serde(with = "humantime_serde", default = "default_refresh_lead")]
    pub refresh_lead: Duration,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IdentityTokenConfig {
    /// Projected service-account token on disk
    File { path: PathBuf },
    /// Local metadata endpoint returning the token as the response body
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalConfig {
    pub name: String,
    pub role: String,
    pub subject: String,
    pub audience: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl PrincipalConfig {
    pub fn to_principal(&self) -> Principal {
        Principal {
            id: PrincipalId::new(self.name.clone()),
            role: self.role.clone(),
            trust: TrustCondition {
                subject: self.subject.clone(),
                audience: self.audience.clone(),
            },
            scopes: self.scopes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub backend: CloudBackendConfig,

    /// Principal whose credential authenticates cloud calls
    #[serde(default = "default_principal")]
    pub principal: String,

    #[serde(with = "humantime_serde", default = "default_call_timeout")]
    pub call_timeout: Duration,

    /// Attempts per call when throttled
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_base_backoff")]
    pub base_backoff: Duration,

    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CloudBackendConfig {
    /// JSON/HTTP block-storage API
    Http { endpoint: String },
    /// In-process simulated cloud (development)
    Simulated {
        #[serde(default = "default_settle_polls")]
        settle_polls: u32,
    },
}

impl Default for CloudBackendConfig {
    fn default() -> Self {
        Self::Simulated {
            settle_polls: default_settle_polls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Full relist interval
    #[serde(with = "humantime_serde", default = "default_resync_period")]
    pub resync_period: Duration,

    /// Delay between Describe polls while waiting on the cloud
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Attaching longer than this raises a fatal event
    #[serde(with = "humantime_serde", default = "default_attach_timeout")]
    pub attach_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_requeue_base")]
    pub requeue_base: Duration,

    #[serde(with = "humantime_serde", default = "default_requeue_max")]
    pub requeue_max: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAgentConfig {
    /// Node this process runs the mount agent for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default = "default_max_mount_attempts")]
    pub max_mount_attempts: u32,

    /// Directory holding stable device links
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

// Default value functions
fn default_provisioner_id() -> String {
    DEFAULT_PROVISIONER_ID.to_string()
}

fn default_safety_margin() -> Duration {
    Duration::from_secs(60)
}

fn default_refresh_lead() -> Duration {
    Duration::from_secs(120)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_principal() -> String {
    "provisioner".to_string()
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_settle_polls() -> u32 {
    2
}

fn default_workers() -> usize {
    4
}

fn default_resync_period() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_attach_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_requeue_base() -> Duration {
    Duration::from_millis(500)
}

fn default_requeue_max() -> Duration {
    Duration::from_secs(60)
}

fn default_max_mount_attempts() -> u32 {
    5
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/disk/by-id")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            provisioner_id: default_provisioner_id(),
            zones: Vec::new(),
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            issuer: "https://sts.example.internal".to_string(),
            token_endpoint: None,
            identity_token: IdentityTokenConfig::File {
                path: PathBuf::from("/var/run/secrets/tokens/aegis-provisioner"),
            },
            principals: vec![PrincipalConfig {
                name: default_principal(),
                role: "roles/block-storage-admin".to_string(),
                subject: "system:serviceaccount:aegis:provisioner".to_string(),
                audience: "aegis-provisioner".to_string(),
                scopes: vec![],
            }],
            safety_margin: default_safety_margin(),
            refresh_lead: default_refresh_lead(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            backend: CloudBackendConfig::default(),
            principal: default_principal(),
            call_timeout: default_call_timeout(),
            max_attempts: default_max_attempts(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_period: default_resync_period(),
            poll_interval: default_poll_interval(),
            attach_timeout: default_attach_timeout(),
            requeue_base: default_requeue_base(),
            requeue_max: default_requeue_max(),
        }
    }
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            id: None,
            max_mount_attempts: default_max_mount_attempts(),
            device_dir: default_device_dir(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aegis-provisioner".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ProvisionerSpec::default(),
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_PROVISIONER_CONFIG environment variable
    /// 2. ./aegis-provisioner.yaml (working directory)
    /// 3. ~/.aegis/provisioner.yaml (user home)
    /// 4. /etc/aegis/provisioner.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_PROVISIONER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-provisioner.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("provisioner.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/aegis/provisioner.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load from an explicit path, else discovery, else defaults
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AEGIS_PROVISIONER_LOG_LEVEL") {
            tracing::info!("Environment override: AEGIS_PROVISIONER_LOG_LEVEL={}", val);
            self.spec.observability.log_level = val;
        }

        if let Ok(val) = std::env::var("AEGIS_PROVISIONER_CLOUD_ENDPOINT") {
            tracing::info!("Environment override: AEGIS_PROVISIONER_CLOUD_ENDPOINT={}", val);
            self.spec.cloud.backend = CloudBackendConfig::Http { endpoint: val };
        }

        if let Ok(val) = std::env::var("AEGIS_PROVISIONER_NODE_ID") {
            tracing::info!("Environment override: AEGIS_PROVISIONER_NODE_ID={}", val);
            self.spec.node.id = Some(val);
        }
    }

    pub fn principals(&self) -> Vec<Principal> {
        self.spec
            .federation
            .principals
            .iter()
            .map(PrincipalConfig::to_principal)
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let federation = &self.spec.federation;
        if federation.issuer.is_empty() && federation.token_endpoint.is_none() {
            anyhow::bail!("spec.federation needs an issuer or an explicit token_endpoint");
        }
        if federation.principals.is_empty() {
            anyhow::bail!("spec.federation.principals cannot be empty");
        }
        for principal in &federation.principals {
            if principal.name.is_empty() {
                anyhow::bail!("Principal name cannot be empty");
            }
            if principal.subject.is_empty() || principal.audience.is_empty() {
                anyhow::bail!(
                    "Principal '{}' must declare both subject and audience",
                    principal.name
                );
            }
        }
        if !federation
            .principals
            .iter()
            .any(|p| p.name == self.spec.cloud.principal)
        {
            anyhow::bail!(
                "Cloud principal '{}' not found in spec.federation.principals",
                self.spec.cloud.principal
            );
        }
        if federation.safety_margin.is_zero() {
            anyhow::bail!("spec.federation.safety_margin must be greater than zero");
        }

        if self.spec.cloud.max_attempts == 0 {
            anyhow::bail!("spec.cloud.max_attempts must be at least 1");
        }
        if self.spec.cloud.base_backoff > self.spec.cloud.max_backoff {
            anyhow::bail!("spec.cloud.base_backoff cannot exceed max_backoff");
        }
        if let CloudBackendConfig::Http { endpoint } = &self.spec.cloud.backend {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("Invalid cloud endpoint '{}': {}", endpoint, e))?;
        }

        if self.spec.controllers.workers == 0 {
            anyhow::bail!("spec.controllers.workers must be at least 1");
        }
        if self.spec.cluster.provisioner_id.trim().is_empty() {
            anyhow::bail!("spec.cluster.provisioner_id cannot be empty");
        }
        if self.spec.cluster.zones.iter().any(|z| z.trim().is_empty()) {
            anyhow::bail!("spec.cluster.zones cannot contain empty entries");
        }

        if self.spec.node.max_mount_attempts == 0 {
            anyhow::bail!("spec.node.max_mount_attempts must be at least 1");
        }

        match self.spec.observability.log_format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Invalid log_format '{}'. Expected 'text' or 'json'", other),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest_is_valid() {
        let manifest = ProvisionerConfig::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.principals().len(), 1);
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
apiVersion: 100monkeys.ai/v1
kind: ProvisionerConfig
metadata:
  name: prod-provisioner
spec:
  cluster:
    zones: [zone-a, zone-b]
  federation:
    issuer: https://sts.cloud.example
    identity_token:
      type: file
      path: /var/run/secrets/token
    principals:
      - name: provisioner
        role: roles/storage
        subject: system:serviceaccount:aegis:provisioner
        audience: sts.cloud.example
    safety_margin: 2m
  cloud:
    backend:
      type: http
      endpoint: https://block.cloud.example
    max_attempts: 3
"#;
        let config = ProvisionerConfig::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.spec.cluster.zones, vec!["zone-a", "zone-b"]);
        assert_eq!(config.spec.federation.safety_margin, Duration::from_secs(120));
        assert_eq!(config.spec.federation.refresh_lead, Duration::from_secs(120));
        assert_eq!(config.spec.cloud.max_attempts, 3);
        assert_eq!(config.spec.controllers.workers, 4);
        assert!(matches!(
            config.spec.cloud.backend,
            CloudBackendConfig::Http { .. }
        ));
    }

    #[test]
    fn test_validation() {
        let mut manifest = ProvisionerConfig::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.cloud.principal = "nobody".to_string();
        assert!(manifest.validate().is_err());
        manifest.spec.cloud.principal = "provisioner".to_string();

        manifest.spec.cloud.backend = CloudBackendConfig::Http {
            endpoint: "not a url".to_string(),
        };
        assert!(manifest.validate().is_err());
        manifest.spec.cloud.backend = CloudBackendConfig::default();

        manifest.spec.federation.principals[0].audience.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provisioner.yaml");
        let manifest = ProvisionerConfig::default();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = ProvisionerConfig::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "aegis-provisioner");
        assert_eq!(loaded.spec.cloud.principal, "provisioner");
    }
}
