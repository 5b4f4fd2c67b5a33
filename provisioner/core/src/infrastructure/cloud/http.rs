// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! JSON/HTTP block-storage backend
//!
//! Talks to a provider REST API:
//!
//! | Operation       | Route                                      |
//! |-----------------|--------------------------------------------|
//! | create          | `POST   /v1/volumes`                       |
//! | delete          | `DELETE /v1/volumes/{id}`                  |
//! | attach          | `POST   /v1/volumes/{id}/attachments`      |
//! | detach          | `DELETE /v1/volumes/{id}/attachments/{node}` |
//! | describe        | `GET    /v1/volumes/{id}`                  |
//! | modify          | `PATCH  /v1/volumes/{id}`                  |
//! | find by token   | `GET    /v1/volumes?idempotency_token=..`  |
//! | snapshot        | `POST   /v1/volumes/{id}/snapshots`        |
//! | tags            | `POST   /v1/volumes/{id}/tags`             |
//!
//! Mutating requests carry the idempotency token in the `Idempotency-Key`
//! header. Every request carries the broker credential as a bearer token.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::domain::cloud::{
    CloudBlockStorageClient, CloudError, CloudSnapshot, CloudVolume, CreateVolumeRequest,
};
use crate::domain::credential::Credential;
use crate::domain::node::NodeId;
use crate::domain::volume::VolumeId;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct HttpBlockStorage {
    endpoint: String,
    client: Client,
}

#[derive(Serialize)]
struct AttachRequest<'a> {
    node_id: &'a NodeId,
}

#[derive(Serialize)]
struct ModifyRequest {
    capacity_gib: u64,
}

#[derive(Serialize)]
struct TagsRequest<'a> {
    tags: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct VolumeList {
    #[serde(default)]
    volumes: Vec<CloudVolume>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl HttpBlockStorage {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CloudError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn send(&self, request: RequestBuilder, credential: &Credential) -> Result<Response, CloudError> {
        let response = request
            .bearer_auth(credential.access_token())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(body);
        debug!(status = status.as_u16(), "Block-storage API error: {}", message);
        Err(status_error(status, message))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        credential: &Credential,
    ) -> Result<T, CloudError> {
        let response = self.send(request, credential).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CloudError::Unavailable(format!("Malformed provider response: {}", e)))
    }
}

fn transport_error(err: reqwest::Error) -> CloudError {
    if err.is_timeout() {
        CloudError::Timeout(err.to_string())
    } else {
        CloudError::Unavailable(err.to_string())
    }
}

fn status_error(status: StatusCode, message: String) -> CloudError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CloudError::Throttled(message),
        StatusCode::NOT_FOUND => CloudError::NotFound(message),
        StatusCode::CONFLICT => CloudError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CloudError::Timeout(message),
        s if s.is_server_error() => CloudError::Unavailable(message),
        _ => CloudError::InvalidRequest(message),
    }
}

#[async_trait]
impl CloudBlockStorageClient for HttpBlockStorage {
    async fn create_volume(
        &self,
        credential: &Credential,
        request: &CreateVolumeRequest,
        idempotency_token: &str,
    ) -> Result<CloudVolume, CloudError> {
        let builder = self
            .client
            .post(self.url("/v1/volumes"))
            .header(IDEMPOTENCY_HEADER, idempotency_token)
            .json(request);
        self.send_json(builder, credential).await
    }

    async fn delete_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        let builder = self
            .client
            .delete(self.url(&format!("/v1/volumes/{}", volume_id)))
            .header(IDEMPOTENCY_HEADER, idempotency_token);
        self.send(builder, credential).await.map(|_| ())
    }

    async fn attach_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        node_id: &NodeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        let builder = self
            .client
            .post(self.url(&format!("/v1/volumes/{}/attachments", volume_id)))
            .header(IDEMPOTENCY_HEADER, idempotency_token)
            .json(&AttachRequest { node_id });
        self.send(builder, credential).await.map(|_| ())
    }

    async fn detach_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        node_id: &NodeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        let builder = self
            .client
            .delete(self.url(&format!("/v1/volumes/{}/attachments/{}", volume_id, node_id)))
            .header(IDEMPOTENCY_HEADER, idempotency_token);
        self.send(builder, credential).await.map(|_| ())
    }

    async fn describe_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
    ) -> Result<CloudVolume, CloudError> {
        let builder = self.client.get(self.url(&format!("/v1/volumes/{}", volume_id)));
        self.send_json(builder, credential).await
    }

    async fn modify_volume(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        capacity_gib: u64,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        let builder = self
            .client
            .patch(self.url(&format!("/v1/volumes/{}", volume_id)))
            .header(IDEMPOTENCY_HEADER, idempotency_token)
            .json(&ModifyRequest { capacity_gib });
        self.send(builder, credential).await.map(|_| ())
    }

    async fn find_by_token(
        &self,
        credential: &Credential,
        idempotency_token: &str,
    ) -> Result<Option<CloudVolume>, CloudError> {
        let builder = self
            .client
            .get(self.url("/v1/volumes"))
            .query(&[("idempotency_token", idempotency_token)]);
        let list: VolumeList = self.send_json(builder, credential).await?;
        Ok(list.volumes.into_iter().next())
    }

    async fn create_snapshot(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        idempotency_token: &str,
    ) -> Result<CloudSnapshot, CloudError> {
        let builder = self
            .client
            .post(self.url(&format!("/v1/volumes/{}/snapshots", volume_id)))
            .header(IDEMPOTENCY_HEADER, idempotency_token);
        self.send_json(builder, credential).await
    }

    async fn create_tags(
        &self,
        credential: &Credential,
        volume_id: &VolumeId,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError> {
        let builder = self
            .client
            .post(self.url(&format!("/v1/volumes/{}/tags", volume_id)))
            .json(&TagsRequest { tags });
        self.send(builder, credential).await.map(|_| ())
    }
}
