// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Federated Credential Types
//!
//! A workload proves its identity with a platform-issued identity token and
//! trades it at the cloud's token-exchange endpoint for a short-lived access
//! token. Access tokens live only in memory and are never printed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Claims the identity token must carry for the exchange to be trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustCondition {
    pub subject: String,
    pub audience: String,
}

/// A cloud identity the provisioner can act as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    /// Cloud role or service account assumed through the exchange
    pub role: String,
    pub trust: TrustCondition,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Workload identity token read from the platform
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 of the token, used to tell a rotated token from a rejected one
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl std::fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentityToken").field(&"<redacted>").finish()
    }
}

/// Result of a successful token exchange
#[derive(Clone)]
pub struct ExchangedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

impl std::fmt::Debug for ExchangedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangedToken")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Short-lived cloud credential held by the broker
#[derive(Clone)]
pub struct Credential {
    pub principal: PrincipalId,
    access_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        principal: PrincipalId,
        access_token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            principal,
            access_token: access_token.into(),
            issued_at,
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Usable only while at least `margin` remains before expiry
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin < self.expires_at
    }

    /// When the background refresher should replace this credential
    pub fn refresh_at(&self, margin: chrono::Duration, lead: chrono::Duration) -> DateTime<Utc> {
        self.expires_at - margin - lead
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("access_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// Anti-Corruption Traits
// ============================================================================

/// Source of the workload identity token (projected file, metadata endpoint)
#[async_trait]
pub trait IdentityTokenSource: Send + Sync {
    async fn read_token(&self) -> Result<IdentityToken, CredentialError>;
}

/// The cloud's token-exchange endpoint
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        principal: &Principal,
        identity_token: &IdentityToken,
    ) -> Result<ExchangedToken, CredentialError>;
}

/// Wall clock, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// The identity provider refused the identity token. Never retried.
    #[error("Federation rejected for principal {principal}: {reason}")]
    Federation { principal: String, reason: String },

    #[error("Identity token unavailable: {0}")]
    IdentityToken(String),

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("Unknown principal: {0}")]
    UnknownPrincipal(String),
}

impl CredentialError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IdentityToken(_) | Self::Exchange(_))
    }
}
