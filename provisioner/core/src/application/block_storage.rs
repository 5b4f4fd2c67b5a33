// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cloud Block-Storage Client
//!
//! Typed entry point the controllers use for every provider call. It wraps a
//! `CloudBlockStorageClient` backend and adds what every call needs:
//!
//! - a live credential from the broker, fetched right before each attempt
//! - a per-call deadline (expiry surfaces as `CloudError::Timeout`)
//! - exponential backoff with full jitter while the provider throttles
//!
//! Only throttling is retried here. Timeouts and everything else go back to
//! the controller, which re-polls `describe_volume` instead of re-issuing.

use metrics::counter;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::application::credential_broker::CredentialBroker;
use crate::domain::cloud::{
    CloudBlockStorageClient, CloudError, CloudSnapshot, CloudVolume, CreateVolumeRequest,
};
use crate::domain::credential::{Credential, PrincipalId};
use crate::domain::node::NodeId;
use crate::domain::volume::VolumeId;
use crate::infrastructure::cloud::retry::RetryPolicy;

pub struct BlockStorageClient {
    backend: Arc<dyn CloudBlockStorageClient>,
    broker: Arc<CredentialBroker>,
    principal: PrincipalId,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl BlockStorageClient {
    pub fn new(
        backend: Arc<dyn CloudBlockStorageClient>,
        broker: Arc<CredentialBroker>,
        principal: PrincipalId,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            broker,
            principal,
            retry,
            call_timeout,
        }
    }

    pub fn principal(&self) -> &PrincipalId {
        &self.principal
    }

    pub async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
        idempotency_token: &str,
    ) -> Result<CloudVolume, CloudError> {
        self.dispatch("create_volume", move |backend, credential| async move {
            backend
                .create_volume(&credential, request, idempotency_token)
                .await
        })
        .await
    }

    pub async fn delete_volume(&self, volume_id: &VolumeId, idempotency_token: &str) -> Result<(), CloudError> {
        self.dispatch("delete_volume", move |backend, credential| async move {
            backend
                .delete_volume(&credential, volume_id, idempotency_token)
                .await
        })
        .await
    }

    pub async fn attach_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.dispatch("attach_volume", move |backend, credential| async move {
            backend
                .attach_volume(&credential, volume_id, node_id, idempotency_token)
                .await
        })
        .await
    }

    pub async fn detach_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.dispatch("detach_volume", move |backend, credential| async move {
            backend
                .detach_volume(&credential, volume_id, node_id, idempotency_token)
                .await
        })
        .await
    }

    pub async fn describe_volume(&self, volume_id: &VolumeId) -> Result<CloudVolume, CloudError> {
        self.dispatch("describe_volume", move |backend, credential| async move {
            backend.describe_volume(&credential, volume_id).await
        })
        .await
    }

    /// Grow a volume (ModifyVolume)
    pub async fn resize_volume(
        &self,
        volume_id: &VolumeId,
        capacity_gib: u64,
        idempotency_token: &str,
    ) -> Result<(), CloudError> {
        self.dispatch("modify_volume", move |backend, credential| async move {
            backend
                .modify_volume(&credential, volume_id, capacity_gib, idempotency_token)
                .await
        })
        .await
    }

    pub async fn find_by_token(&self, idempotency_token: &str) -> Result<Option<CloudVolume>, CloudError> {
        self.dispatch("find_by_token", move |backend, credential| async move {
            backend.find_by_token(&credential, idempotency_token).await
        })
        .await
    }

    pub async fn snapshot_volume(
        &self,
        volume_id: &VolumeId,
        idempotency_token: &str,
    ) -> Result<CloudSnapshot, CloudError> {
        self.dispatch("create_snapshot", move |backend, credential| async move {
            backend
                .create_snapshot(&credential, volume_id, idempotency_token)
                .await
        })
        .await
    }

    pub async fn tag_volume(&self, volume_id: &VolumeId, tags: &HashMap<String, String>) -> Result<(), CloudError> {
        self.dispatch("create_tags", move |backend, credential| async move {
            backend.create_tags(&credential, volume_id, tags).await
        })
        .await
    }

    async fn dispatch<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, CloudError>
    where
        F: Fn(Arc<dyn CloudBlockStorageClient>, Credential) -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut attempt = 0;
        loop {
            let credential = self.broker.get_credential(&self.principal).await?;

            let outcome = match timeout(self.call_timeout, call(self.backend.clone(), credential)).await {
                Ok(result) => result,
                Err(_) => Err(CloudError::Timeout(format!(
                    "{} exceeded {}ms",
                    operation,
                    self.call_timeout.as_millis()
                ))),
            };

            let label = match &outcome {
                Ok(_) => "ok",
                Err(CloudError::Throttled(_)) => "throttled",
                Err(CloudError::Timeout(_)) => "timeout",
                Err(_) => "error",
            };
            counter!(
                "aegis_provisioner_cloud_calls_total",
                "operation" => operation,
                "outcome" => label
            )
            .increment(1);

            match outcome {
                Err(CloudError::Throttled(message)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        warn!(operation, attempts = attempt, "Cloud call still throttled, giving up");
                        return Err(CloudError::Throttled(message));
                    }
                    let delay = self.retry.delay(attempt - 1);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Cloud call throttled, backing off"
                    );
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::credential_broker::BrokerSettings;
    use crate::domain::credential::{Principal, TrustCondition};
    use crate::infrastructure::cloud::memory::SimulatedCloud;
    use crate::infrastructure::federation::{LocalTokenExchanger, StaticTokenSource};
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn broker(audience: &str) -> Arc<CredentialBroker> {
        let token = encode(
            &Header::default(),
            &serde_json::json!({"sub": "system:serviceaccount:aegis:provisioner", "aud": audience}),
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        let principal = Principal {
            id: PrincipalId::new("provisioner"),
            role: "roles/storage".to_string(),
            trust: TrustCondition {
                subject: "system:serviceaccount:aegis:provisioner".to_string(),
                audience: "sts.cloud.example".to_string(),
            },
            scopes: vec![],
        };
        Arc::new(CredentialBroker::new(
            vec![principal],
            Arc::new(StaticTokenSource::new(token)),
            Arc::new(LocalTokenExchanger::new(Duration::from_secs(3600))),
            BrokerSettings::default(),
        ))
    }

    fn client(cloud: Arc<SimulatedCloud>, broker: Arc<CredentialBroker>) -> BlockStorageClient {
        BlockStorageClient::new(
            cloud,
            broker,
            PrincipalId::new("provisioner"),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            Duration::from_millis(200),
        )
    }

    fn request() -> CreateVolumeRequest {
        CreateVolumeRequest {
            capacity_gib: 10,
            zone: "zone-a".to_string(),
            volume_type: "ssd".to_string(),
            iops: None,
            throughput_mibps: None,
            encrypted: true,
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_throttling_is_retried() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.throttle_next(2);
        let client = client(cloud.clone(), broker("sts.cloud.example"));

        let volume = client.create_volume(&request(), "tok-1").await.unwrap();
        assert_eq!(volume.zone, "zone-a");
        assert_eq!(cloud.calls().create, 3);
        assert_eq!(cloud.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_throttling_gives_up_after_max_attempts() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.throttle_next(10);
        let client = client(cloud.clone(), broker("sts.cloud.example"));

        let err = client.create_volume(&request(), "tok-1").await.unwrap_err();
        assert!(matches!(err, CloudError::Throttled(_)));
        assert_eq!(cloud.calls().create, 3);
    }

    #[tokio::test]
    async fn test_snapshot_and_tags_go_through_the_broker() {
        let cloud = Arc::new(SimulatedCloud::new());
        let client = client(cloud.clone(), broker("sts.cloud.example"));
        let volume = client.create_volume(&request(), "tok-1").await.unwrap();

        cloud.throttle_next(1);
        let snapshot = client.snapshot_volume(&volume.id, "snap-1").await.unwrap();
        let replay = client.snapshot_volume(&volume.id, "snap-1").await.unwrap();
        assert_eq!(snapshot.id, replay.id);
        assert_eq!(snapshot.capacity_gib, 10);

        let tags = HashMap::from([("owner".to_string(), "postgres".to_string())]);
        client.tag_volume(&volume.id, &tags).await.unwrap();
        let tagged = cloud.volume(&volume.id).unwrap();
        assert_eq!(tagged.tags.get("owner").map(String::as_str), Some("postgres"));

        let calls = cloud.calls();
        assert_eq!(calls.snapshot, 3);
        assert_eq!(calls.tag, 1);
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_volume_is_not_retried() {
        let cloud = Arc::new(SimulatedCloud::new());
        let client = client(cloud.clone(), broker("sts.cloud.example"));

        let err = client
            .snapshot_volume(&VolumeId::from("vol-gone"), "snap-1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cloud.calls().snapshot, 1);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.set_latency(Duration::from_secs(5));
        let client = client(cloud.clone(), broker("sts.cloud.example"));

        let err = client.describe_volume(&VolumeId::from("vol-x")).await.unwrap_err();
        assert!(matches!(err, CloudError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_federation_failure_makes_no_cloud_call() {
        let cloud = Arc::new(SimulatedCloud::new());
        let client = client(cloud.clone(), broker("wrong-audience"));

        let err = client.create_volume(&request(), "tok-1").await.unwrap_err();
        assert!(matches!(err, CloudError::Credential(_)));
        assert_eq!(cloud.calls().total(), 0);
    }
}
