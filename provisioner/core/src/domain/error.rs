// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Provisioning error taxonomy
//!
//! Every failure a controller can observe folds into one of these classes,
//! and the class alone decides how the controller reacts.

use thiserror::Error;

use crate::domain::attachment::AttachmentError;
use crate::domain::claim::ClaimError;
use crate::domain::cloud::CloudError;
use crate::domain::credential::CredentialError;
use crate::domain::mount::MountError;
use crate::domain::repository::RepositoryError;
use crate::domain::storage_class::StorageClassError;
use crate::domain::volume::VolumeError;

/// How a controller handles an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue with backoff
    Transient,
    /// Re-reconcile from fresh state
    Conflict,
    /// Surface to operators, do not retry on a timer
    Fatal,
    /// Treat as success
    Benign,
}

#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Federation rejected: {0}")]
    Federation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Mount failed: {message}")]
    Mount { message: String, terminal: bool },

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProvisioningError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Throttled(_)
            | Self::Timeout(_)
            | Self::Busy(_)
            | Self::Unavailable(_)
            | Self::Repository(_)
            | Self::Configuration(_) => ErrorClass::Transient,
            Self::Mount { terminal, .. } => {
                if *terminal {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Transient
                }
            }
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Federation(_) => ErrorClass::Fatal,
            Self::NotFound(_) => ErrorClass::Benign,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Conflict)
    }

    /// Short machine-readable reason recorded on object status
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Throttled(_) => "Throttled",
            Self::Conflict(_) => "Conflict",
            Self::Federation(_) => "FederationRejected",
            Self::NotFound(_) => "NotFound",
            Self::Timeout(_) => "Timeout",
            Self::Mount { terminal: true, .. } => "MountFailedTerminal",
            Self::Mount { .. } => "MountFailed",
            Self::Busy(_) => "Busy",
            Self::Unavailable(_) => "Unavailable",
            Self::Repository(_) => "RepositoryError",
            Self::Configuration(_) => "ConfigurationError",
        }
    }
}

impl From<CredentialError> for ProvisioningError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Federation { .. } => Self::Federation(err.to_string()),
            CredentialError::UnknownPrincipal(_) => Self::Configuration(err.to_string()),
            CredentialError::IdentityToken(_) | CredentialError::Exchange(_) => {
                Self::Unavailable(err.to_string())
            }
        }
    }
}

impl From<CloudError> for ProvisioningError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Throttled(m) => Self::Throttled(m),
            CloudError::Conflict(m) => Self::Conflict(m),
            CloudError::NotFound(m) => Self::NotFound(m),
            CloudError::Timeout(m) => Self::Timeout(m),
            CloudError::Unavailable(m) => Self::Unavailable(m),
            CloudError::InvalidRequest(m) => Self::Configuration(m),
            CloudError::Unauthorized(m) => Self::Federation(m),
            CloudError::Credential(e) => e.into(),
        }
    }
}

impl From<MountError> for ProvisioningError {
    fn from(err: MountError) -> Self {
        Self::Mount {
            message: err.to_string(),
            terminal: false,
        }
    }
}

impl From<RepositoryError> for ProvisioningError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::VersionConflict { .. } | RepositoryError::AlreadyExists(_) => {
                Self::Conflict(err.to_string())
            }
            RepositoryError::NotFound(m) => Self::NotFound(m),
            other => Self::Repository(other.to_string()),
        }
    }
}

impl From<VolumeError> for ProvisioningError {
    fn from(err: VolumeError) -> Self {
        match err {
            VolumeError::Busy { .. } => Self::Busy(err.to_string()),
            other => Self::Conflict(other.to_string()),
        }
    }
}

impl From<ClaimError> for ProvisioningError {
    fn from(err: ClaimError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl From<AttachmentError> for ProvisioningError {
    fn from(err: AttachmentError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl From<StorageClassError> for ProvisioningError {
    fn from(err: StorageClassError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_errors_map_to_classes() {
        let throttled: ProvisioningError = CloudError::Throttled("slow".into()).into();
        assert_eq!(throttled.class(), ErrorClass::Transient);

        let missing: ProvisioningError = CloudError::NotFound("vol-1".into()).into();
        assert_eq!(missing.class(), ErrorClass::Benign);
        assert!(!missing.is_retryable());

        let conflict: ProvisioningError = CloudError::Conflict("in use".into()).into();
        assert!(conflict.is_retryable());
    }

    #[test]
    fn test_federation_is_fatal() {
        let err: ProvisioningError = CloudError::Credential(CredentialError::Federation {
            principal: "p".into(),
            reason: "audience mismatch".into(),
        })
        .into();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(err.reason(), "FederationRejected");
    }

    #[test]
    fn test_mount_terminal() {
        let transient = ProvisioningError::Mount {
            message: "no device".into(),
            terminal: false,
        };
        let terminal = ProvisioningError::Mount {
            message: "gave up".into(),
            terminal: true,
        };
        assert!(transient.is_retryable());
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn test_version_conflict_is_conflict() {
        let err: ProvisioningError = RepositoryError::VersionConflict {
            key: "k".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Conflict);
    }
}
