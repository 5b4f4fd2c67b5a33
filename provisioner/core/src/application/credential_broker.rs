// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Credential Broker
//!
//! Trades the workload identity token for short-lived cloud credentials and
//! keeps one cached credential per principal.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** The only component that talks to the federation endpoint
//!
//! Each principal has a slot guarded by its own async mutex. Callers that
//! find the cached credential past its refresh point queue on that mutex,
//! so a burst of callers produces a single exchange. A federation rejection
//! is remembered together with the fingerprint of the rejected identity token
//! and replayed without network traffic until the token rotates or `reset`
//! is called.

use dashmap::DashMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use metrics::counter;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::credential::{
    Clock, Credential, CredentialError, IdentityToken, IdentityTokenSource, Principal, PrincipalId,
    SystemClock, TokenExchanger,
};
use crate::domain::events::CredentialEvent;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Credentials closer than this to expiry are never handed out
    pub safety_margin: Duration,
    /// How far ahead of the margin the background refresh fires
    pub refresh_lead: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
            refresh_lead: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct Slot {
    credential: Option<Credential>,
    /// Fingerprint of the identity token that was rejected, and the rejection
    rejected: Option<(String, CredentialError)>,
}

/// Subset of identity token claims checked before any exchange
#[derive(Debug, Deserialize)]
struct IdentityClaims {
    sub: Option<String>,
    aud: Option<Audience>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == expected,
            Audience::Multiple(auds) => auds.iter().any(|a| a == expected),
        }
    }
}

pub struct CredentialBroker {
    principals: HashMap<PrincipalId, Principal>,
    source: Arc<dyn IdentityTokenSource>,
    exchanger: Arc<dyn TokenExchanger>,
    clock: Arc<dyn Clock>,
    margin: chrono::Duration,
    lead: chrono::Duration,
    slots: DashMap<PrincipalId, Arc<Mutex<Slot>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl CredentialBroker {
    pub fn new(
        principals: Vec<Principal>,
        source: Arc<dyn IdentityTokenSource>,
        exchanger: Arc<dyn TokenExchanger>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            principals: principals
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
            source,
            exchanger,
            clock: Arc::new(SystemClock),
            margin: to_chrono(settings.safety_margin),
            lead: to_chrono(settings.refresh_lead),
            slots: DashMap::new(),
            event_bus: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn principal(&self, id: &PrincipalId) -> Option<&Principal> {
        self.principals.get(id)
    }

    pub fn principal_ids(&self) -> Vec<PrincipalId> {
        self.principals.keys().cloned().collect()
    }

    /// A credential with more than the safety margin left.
    ///
    /// Once the cached credential passes its refresh point the first caller
    /// exchanges a new one while the rest wait on the slot. A transient
    /// refresh failure keeps serving the cached credential until it enters
    /// the margin.
    pub async fn get_credential(&self, principal_id: &PrincipalId) -> Result<Credential, CredentialError> {
        let principal = self
            .principals
            .get(principal_id)
            .ok_or_else(|| CredentialError::UnknownPrincipal(principal_id.to_string()))?;

        let slot = self.slot(principal_id);
        let mut slot = slot.lock().await;

        let now = self.clock.now();
        let cached = slot
            .credential
            .clone()
            .filter(|credential| credential.is_usable_at(now, self.margin));
        if let Some(credential) = &cached {
            if now < credential.refresh_at(self.margin, self.lead) {
                return Ok(credential.clone());
            }
        }

        match (self.exchange_locked(principal, &mut slot).await, cached) {
            (Ok(credential), _) => Ok(credential),
            (Err(e), Some(credential)) if e.is_retryable() => {
                warn!(principal = %principal.id, "Early credential refresh failed, serving cached credential: {}", e);
                Ok(credential)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Refresh every principal whose credential is missing or due.
    /// Returns the number of successful exchanges.
    pub async fn refresh_due(&self) -> usize {
        let mut refreshed = 0;
        for principal in self.principals.values() {
            let slot = self.slot(&principal.id);
            let mut slot = slot.lock().await;

            let due = match &slot.credential {
                Some(credential) => self.clock.now() >= credential.refresh_at(self.margin, self.lead),
                None => slot.rejected.is_none(),
            };
            if !due {
                continue;
            }

            match self.exchange_locked(principal, &mut slot).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(principal = %principal.id, "Background credential refresh failed: {}", e),
            }
        }
        refreshed
    }

    /// Background task refreshing credentials ahead of expiry
    pub fn spawn_refresher(self: Arc<Self>, every: Duration, shutdown_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = every.as_millis() as u64, "Starting credential refresher");
            let mut tick = interval(every);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let refreshed = self.refresh_due().await;
                        if refreshed > 0 {
                            debug!(refreshed, "Credential refresh cycle completed");
                        }
                    }
                    _ = shutdown_token.cancelled() => {
                        info!("Shutdown signal received, stopping credential refresher");
                        break;
                    }
                }
            }
        })
    }

    /// Drop the cached credential and any remembered rejection
    pub async fn reset(&self, principal_id: &PrincipalId) {
        let slot = self.slot(principal_id);
        let mut slot = slot.lock().await;
        slot.credential = None;
        slot.rejected = None;
        info!(principal = %principal_id, "Credential state reset");
    }

    fn slot(&self, principal_id: &PrincipalId) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(principal_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone()
    }

    async fn exchange_locked(&self, principal: &Principal, slot: &mut Slot) -> Result<Credential, CredentialError> {
        let token = self.source.read_token().await?;
        let fingerprint = token.fingerprint();

        if let Some((rejected_fingerprint, rejection)) = &slot.rejected {
            if *rejected_fingerprint == fingerprint {
                debug!(principal = %principal.id, "Identity token was already rejected, failing fast");
                return Err(rejection.clone());
            }
            info!(principal = %principal.id, "Identity token rotated since last rejection, retrying exchange");
            slot.rejected = None;
        }

        if let Err(reason) = check_trust(principal, &token) {
            return Err(self.reject(principal, slot, fingerprint, reason));
        }

        counter!("aegis_provisioner_credential_exchanges_total").increment(1);
        let exchanged = match self.exchanger.exchange(principal, &token).await {
            Ok(exchanged) => exchanged,
            Err(CredentialError::Federation { reason, .. }) => {
                return Err(self.reject(principal, slot, fingerprint, reason));
            }
            Err(e) => {
                counter!("aegis_provisioner_credential_exchange_failures_total").increment(1);
                warn!(principal = %principal.id, "Token exchange failed: {}", e);
                return Err(e);
            }
        };

        let issued_at = self.clock.now();
        let lifetime = chrono::Duration::from_std(exchanged.expires_in)
            .map_err(|e| CredentialError::Exchange(format!("Invalid credential lifetime: {}", e)))?;
        let credential = Credential::new(
            principal.id.clone(),
            exchanged.access_token,
            issued_at,
            issued_at + lifetime,
        );

        if !credential.is_usable_at(issued_at, self.margin) {
            return Err(CredentialError::Exchange(format!(
                "Issued credential lives {}s, not longer than the {}s safety margin",
                lifetime.num_seconds(),
                self.margin.num_seconds()
            )));
        }

        info!(
            principal = %principal.id,
            expires_at = %credential.expires_at,
            "Obtained cloud credential"
        );
        if let Some(bus) = &self.event_bus {
            bus.publish_credential_event(CredentialEvent::CredentialRefreshed {
                principal: principal.id.to_string(),
                expires_at: credential.expires_at,
            });
        }

        slot.credential = Some(credential.clone());
        Ok(credential)
    }

    fn reject(&self, principal: &Principal, slot: &mut Slot, fingerprint: String, reason: String) -> CredentialError {
        let err = CredentialError::Federation {
            principal: principal.id.to_string(),
            reason: reason.clone(),
        };
        counter!("aegis_provisioner_federation_rejections_total").increment(1);
        warn!(principal = %principal.id, "Federation rejected: {}", reason);

        slot.credential = None;
        slot.rejected = Some((fingerprint, err.clone()));

        if let Some(bus) = &self.event_bus {
            bus.publish_credential_event(CredentialEvent::FederationRejected {
                principal: principal.id.to_string(),
                reason,
                rejected_at: self.clock.now(),
            });
        }
        err
    }
}

/// Check `sub`/`aud` of the identity token against the principal's trust
/// condition. The signature is not verified here; the exchange endpoint does
/// that.
fn check_trust(principal: &Principal, token: &IdentityToken) -> Result<(), String> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let claims = decode::<IdentityClaims>(token.as_str(), &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| format!("identity token is not a decodable JWT: {}", e))?
        .claims;

    let expected = &principal.trust;
    match claims.sub.as_deref() {
        Some(sub) if sub == expected.subject => {}
        Some(sub) => {
            return Err(format!(
                "subject mismatch: expected '{}', token carries '{}'",
                expected.subject, sub
            ))
        }
        None => return Err("identity token has no subject".to_string()),
    }

    match &claims.aud {
        Some(aud) if aud.contains(&expected.audience) => Ok(()),
        Some(_) => Err(format!("audience '{}' not present in identity token", expected.audience)),
        None => Err("identity token has no audience".to_string()),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
