// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! OAuth 2.0 Token Exchange (RFC 8693) client
//!
//! The token endpoint comes from configuration or, when absent, from the
//! issuer's `/.well-known/openid-configuration`, fetched once per process.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::domain::credential::{
    CredentialError, ExchangedToken, IdentityToken, Principal, TokenExchanger,
};

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
const REQUESTED_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Identity provider metadata
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct StsTokenExchanger {
    issuer: String,
    token_endpoint: Option<String>,
    client: Client,
    discovery: OnceCell<DiscoveryDocument>,
}

impl StsTokenExchanger {
    pub fn new(
        issuer: impl Into<String>,
        token_endpoint: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CredentialError::Exchange(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            token_endpoint,
            client,
            discovery: OnceCell::new(),
        })
    }

    /// Discovery metadata, fetched on first use and cached
    pub async fn discovery(&self) -> Result<&DiscoveryDocument, CredentialError> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!("{}/.well-known/openid-configuration", self.issuer);
                debug!(url = %url, "Fetching identity provider metadata");
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| CredentialError::Exchange(format!("Discovery failed: {}", e)))?;
                if !response.status().is_success() {
                    return Err(CredentialError::Exchange(format!(
                        "Discovery returned {}",
                        response.status()
                    )));
                }
                let document: DiscoveryDocument = response
                    .json()
                    .await
                    .map_err(|e| CredentialError::Exchange(format!("Malformed discovery document: {}", e)))?;
                info!(
                    issuer = %document.issuer,
                    token_endpoint = %document.token_endpoint,
                    "Discovered identity provider"
                );
                Ok(document)
            })
            .await
    }

    async fn endpoint(&self) -> Result<String, CredentialError> {
        match &self.token_endpoint {
            Some(endpoint) => Ok(endpoint.clone()),
            None => Ok(self.discovery().await?.token_endpoint.clone()),
        }
    }
}

#[async_trait]
impl TokenExchanger for StsTokenExchanger {
    async fn exchange(
        &self,
        principal: &Principal,
        identity_token: &IdentityToken,
    ) -> Result<ExchangedToken, CredentialError> {
        let endpoint = self.endpoint().await?;
        let scope = principal.scopes.join(" ");

        let mut form = vec![
            ("grant_type", GRANT_TYPE),
            ("subject_token", identity_token.as_str()),
            ("subject_token_type", SUBJECT_TOKEN_TYPE),
            ("requested_token_type", REQUESTED_TOKEN_TYPE),
            ("audience", principal.trust.audience.as_str()),
            ("resource", principal.role.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .client
            .post(&endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Exchange(format!("Token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| CredentialError::Exchange(format!("Malformed token response: {}", e)))?;
            return Ok(ExchangedToken {
                access_token: token.access_token,
                expires_in: Duration::from_secs(token.expires_in),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let oauth: OAuthError = serde_json::from_str(&body).unwrap_or_default();
        let reason = oauth
            .error_description
            .filter(|d| !d.is_empty())
            .or_else(|| (!oauth.error.is_empty()).then(|| oauth.error.clone()))
            .unwrap_or_else(|| format!("token endpoint returned {}", status));

        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(CredentialError::Federation {
                    principal: principal.id.to_string(),
                    reason,
                })
            }
            _ => Err(CredentialError::Exchange(format!("{}: {}", status, reason))),
        }
    }
}
