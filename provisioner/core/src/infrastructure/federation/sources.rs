// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Workload identity token sources

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::credential::{CredentialError, IdentityToken, IdentityTokenSource};

/// Projected token file, re-read on every exchange so rotation is picked up
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IdentityTokenSource for FileTokenSource {
    async fn read_token(&self) -> Result<IdentityToken, CredentialError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CredentialError::IdentityToken(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        non_empty(raw, || self.path.display().to_string())
    }
}

/// Local metadata endpoint returning the raw token as its body
pub struct HttpTokenSource {
    url: String,
    headers: HashMap<String, String>,
    client: Client,
}

impl HttpTokenSource {
    pub fn new(
        url: impl Into<String>,
        headers: HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CredentialError::IdentityToken(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            headers,
            client,
        })
    }
}

#[async_trait]
impl IdentityTokenSource for HttpTokenSource {
    async fn read_token(&self) -> Result<IdentityToken, CredentialError> {
        let mut request = self.client.get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| CredentialError::IdentityToken(format!("Metadata endpoint unreachable: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::IdentityToken(format!(
                "Metadata endpoint returned {}",
                status
            )));
        }
        let raw = response
            .text()
            .await
            .map_err(|e| CredentialError::IdentityToken(e.to_string()))?;
        non_empty(raw, || self.url.clone())
    }
}

/// Token held in memory; `set` simulates platform rotation
pub struct StaticTokenSource {
    token: RwLock<String>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(token.into()),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }
}

#[async_trait]
impl IdentityTokenSource for StaticTokenSource {
    async fn read_token(&self) -> Result<IdentityToken, CredentialError> {
        let token = self.token.read().clone();
        non_empty(token, || "static source".to_string())
    }
}

fn non_empty(raw: String, origin: impl FnOnce() -> String) -> Result<IdentityToken, CredentialError> {
    let token = raw.trim();
    if token.is_empty() {
        return Err(CredentialError::IdentityToken(format!(
            "Identity token from {} is empty",
            origin()
        )));
    }
    Ok(IdentityToken::new(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_source_trims_and_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first-token\n").unwrap();

        let source = FileTokenSource::new(&path);
        assert_eq!(source.read_token().await.unwrap().as_str(), "first-token");

        std::fs::write(&path, "rotated-token").unwrap();
        assert_eq!(source.read_token().await.unwrap().as_str(), "rotated-token");
    }

    #[tokio::test]
    async fn test_missing_or_empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileTokenSource::new(dir.path().join("absent"));
        assert!(matches!(
            missing.read_token().await,
            Err(CredentialError::IdentityToken(_))
        ));

        let path = dir.path().join("empty");
        std::fs::write(&path, "  \n").unwrap();
        assert!(FileTokenSource::new(&path).read_token().await.is_err());
    }

    #[tokio::test]
    async fn test_http_source_sends_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/identity")
            .match_header("metadata-flavor", "aegis")
            .with_status(200)
            .with_body("jwt-from-metadata\n")
            .create_async()
            .await;

        let mut headers = HashMap::new();
        headers.insert("Metadata-Flavor".to_string(), "aegis".to_string());
        let source = HttpTokenSource::new(
            format!("{}/identity", server.url()),
            headers,
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(source.read_token().await.unwrap().as_str(), "jwt-from-metadata");
        mock.assert_async().await;
    }
}
