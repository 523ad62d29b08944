//! Periodic credential probing.
//!
//! A probe is a lightweight authenticated call to the provider. Its result
//! moves the credential through the health state machine:
//! `pending -> healthy | unhealthy`, `unhealthy -> healthy`, and any state
//! to `invalid` on an authentication rejection. `invalid` is never left here.

use crate::classifier::HealthUpdate;
use crate::config::{HealthCheckPolicy, KeyPoolPolicy};
use crate::credential::{Credential, CredentialStatus, Secret};
use crate::metrics_defs::{CREDENTIAL_TRANSITION, HEALTH_CHECK_DURATION, HEALTH_CHECK_PROBED};
use crate::store::{CredentialStore, StoreError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

#[derive(Clone, Debug, PartialEq)]
pub enum ProbeResult {
    Unauthorized,
    Failed { status: Option<u16>, error: String },
    Succeeded { tier: Option<i64> },
}

#[async_trait]
pub trait SubscriptionProbe: Send + Sync {
    async fn probe(&self, secret: &Secret, policy: &HealthCheckPolicy) -> ProbeResult;
}

#[derive(Deserialize)]
struct SubscriptionResponse {
    tier: Option<i64>,
}

/// Probes the provider's subscription endpoint over HTTP.
#[derive(Clone, Default)]
pub struct HttpSubscriptionProbe {
    client: reqwest::Client,
}

impl HttpSubscriptionProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionProbe for HttpSubscriptionProbe {
    async fn probe(&self, secret: &Secret, policy: &HealthCheckPolicy) -> ProbeResult {
        let url = match policy.health_check_url() {
            Ok(url) => url,
            Err(e) => {
                return ProbeResult::Failed {
                    status: None,
                    error: format!("Error: {e}"),
                };
            }
        };

        let response = self
            .client
            .get(url)
            .bearer_auth(secret.expose())
            .timeout(policy.timeout())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return ProbeResult::Failed {
                    status: None,
                    error: format!("Error: {e}"),
                };
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return ProbeResult::Unauthorized;
        }
        if status.is_client_error() || status.is_server_error() {
            return ProbeResult::Failed {
                status: Some(status.as_u16()),
                error: format!("HTTP {}", status.as_u16()),
            };
        }

        match response.json::<SubscriptionResponse>().await {
            Ok(body) => ProbeResult::Succeeded { tier: body.tier },
            Err(e) => ProbeResult::Failed {
                status: Some(status.as_u16()),
                error: format!("Error: {e}"),
            },
        }
    }
}

/// Health transition for one probe result. `None` for credentials that a
/// probe may not touch.
pub fn probe_transition(
    credential: &Credential,
    result: &ProbeResult,
    policy: &KeyPoolPolicy,
    now: SystemTime,
) -> Option<HealthUpdate> {
    if credential.status == CredentialStatus::Invalid {
        return None;
    }

    let mut update = HealthUpdate::unchanged(credential);
    update.checked_at = Some(now);

    match result {
        ProbeResult::Unauthorized => {
            update.status = CredentialStatus::Invalid;
            update.tier = None;
            update.fail_streak = credential.fail_streak.saturating_add(1);
            update.last_error = Some("Unauthorized".into());
        }
        ProbeResult::Failed { error, .. } => {
            update.fail_streak = credential.fail_streak.saturating_add(1);
            if update.fail_streak >= policy.fail_threshold() {
                update.status = CredentialStatus::Unhealthy;
            }
            update.last_error = Some(error.clone());
        }
        ProbeResult::Succeeded { tier } => {
            update.tier = *tier;
            match policy.tier_requirement() {
                Some(required) if *tier != Some(required) => {
                    update.status = CredentialStatus::Unhealthy;
                    update.last_error = Some(format!("Tier {required} required"));
                }
                _ => {
                    update.status = CredentialStatus::Healthy;
                    update.fail_streak = 0;
                    update.last_error = None;
                }
            }
        }
    }

    Some(update)
}

pub struct HealthChecker {
    store: Arc<dyn CredentialStore>,
    probe: Arc<dyn SubscriptionProbe>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn CredentialStore>, probe: Arc<dyn SubscriptionProbe>) -> Self {
        HealthChecker { store, probe }
    }

    /// Probes every enabled, recoverable credential. Returns how many were probed.
    pub async fn check_all(
        &self,
        policy: &KeyPoolPolicy,
        health: &HealthCheckPolicy,
        now: impl Fn() -> SystemTime,
    ) -> Result<usize, StoreError> {
        let started = Instant::now();
        let candidates = self.store.probe_candidates().await?;

        for credential in &candidates {
            let result = self.probe.probe(&credential.secret, health).await;
            self.apply(credential, &result, policy, now()).await?;
        }

        histogram!(HEALTH_CHECK_DURATION).record(started.elapsed().as_secs_f64());
        counter!(HEALTH_CHECK_PROBED).increment(candidates.len() as u64);
        Ok(candidates.len())
    }

    async fn apply(
        &self,
        credential: &Credential,
        result: &ProbeResult,
        policy: &KeyPoolPolicy,
        now: SystemTime,
    ) -> Result<(), StoreError> {
        // Relayed outcomes may have moved the row while the probe was in flight.
        let transition =
            |current: &Credential| probe_transition(current, result, policy, now);

        match self.store.update_health(credential.id, &transition).await {
            Ok(Some(change)) if change.changed() => {
                counter!(CREDENTIAL_TRANSITION, "status" => change.to.as_str()).increment(1);
                tracing::info!(
                    credential_id = credential.id,
                    from = %change.from,
                    to = %change.to,
                    "Credential status changed by probe"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            // Deleted while the probe was in flight.
            Err(StoreError::NotFound(id)) => {
                tracing::debug!(credential_id = id, "Probed credential no longer exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
