//! Maps an upstream outcome to a credential health transition.
//!
//! The classifier is pure: it reads the current credential and returns a
//! [`HealthUpdate`] for the store to apply. Cooldowns are expressed as
//! [`CooldownChange::ExtendTo`] so the store can enforce that a deadline is
//! never moved earlier, even when several writers race.

use crate::config::KeyPoolPolicy;
use crate::credential::{Credential, CredentialStatus};
use http::HeaderMap;
use http::header::RETRY_AFTER;
use shared::backoff::compute_backoff;
use std::time::{Duration, SystemTime};

const MAX_ERROR_LEN: usize = 1000;

/// Result of one upstream call made with a credential.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    /// `None` when the call never produced a response.
    pub status: Option<u16>,
    pub message: Option<String>,
    /// Numeric `Retry-After` hint, in seconds.
    pub retry_after: Option<u64>,
}

impl Outcome {
    pub fn status(code: u16) -> Self {
        Outcome {
            status: Some(code),
            ..Default::default()
        }
    }

    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        Outcome {
            status: Some(code),
            message: Some(message.into()),
            retry_after: None,
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Outcome {
            status: None,
            message: Some(message.into()),
            retry_after: None,
        }
    }

    pub fn from_response(code: u16, message: Option<String>, headers: &HeaderMap) -> Self {
        Outcome {
            status: Some(code),
            message,
            retry_after: parse_retry_after(headers),
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|code| code < 400)
    }
}

/// Reads a delay-seconds `Retry-After` header. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    value.parse::<i64>().ok().map(|secs| secs.max(0) as u64)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CooldownChange {
    Keep,
    Clear,
    /// Move the deadline to this instant unless it is already later.
    ExtendTo(SystemTime),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RequestTally {
    Succeeded,
    Failed,
}

/// New health fields for one credential.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthUpdate {
    pub status: CredentialStatus,
    pub tier: Option<i64>,
    pub fail_streak: u32,
    pub cooldown: CooldownChange,
    pub last_error: Option<String>,
    /// Set by probes.
    pub checked_at: Option<SystemTime>,
    /// Set for relayed requests so per-credential counters can be kept.
    pub tally: Option<RequestTally>,
}

impl HealthUpdate {
    /// An update that leaves every field as it is.
    pub fn unchanged(credential: &Credential) -> Self {
        HealthUpdate {
            status: credential.status,
            tier: credential.tier,
            fail_streak: credential.fail_streak,
            cooldown: CooldownChange::Keep,
            last_error: credential.last_error.clone(),
            checked_at: None,
            tally: None,
        }
    }

    pub fn apply_to(&self, credential: &mut Credential) {
        // Only re-verification by the owner leaves `invalid`.
        if credential.status != CredentialStatus::Invalid {
            credential.status = self.status;
        }
        credential.tier = self.tier;
        credential.fail_streak = self.fail_streak;
        credential.last_error = self.last_error.clone();

        match self.cooldown {
            CooldownChange::Keep => {}
            CooldownChange::Clear => credential.cooldown_until = None,
            CooldownChange::ExtendTo(until) => {
                if credential.cooldown_until.is_none_or(|current| current < until) {
                    credential.cooldown_until = Some(until);
                }
            }
        }

        if let Some(checked_at) = self.checked_at {
            credential.last_checked_at = Some(checked_at);
        }

        match self.tally {
            Some(RequestTally::Succeeded) => {
                credential.total_requests += 1;
                credential.success_requests += 1;
            }
            Some(RequestTally::Failed) => {
                credential.total_requests += 1;
                credential.fail_requests += 1;
            }
            None => {}
        }
    }

    fn set_backoff(&mut self, base_seconds: u64, policy: &KeyPoolPolicy, now: SystemTime) {
        self.set_backoff_with_hint(base_seconds, None, policy, now);
    }

    fn set_backoff_with_hint(
        &mut self,
        base_seconds: u64,
        hint: Option<u64>,
        policy: &KeyPoolPolicy,
        now: SystemTime,
    ) {
        if !policy.dynamic_cooldown_enabled {
            return;
        }

        let computed = compute_backoff(base_seconds, self.fail_streak, policy.cooldown_max_seconds);
        let seconds = hint.map_or(computed, |h| computed.max(h));
        if seconds > 0 {
            self.cooldown = CooldownChange::ExtendTo(now + Duration::from_secs(seconds));
        }
    }

    fn escalate_at(&mut self, threshold: u32) {
        if self.fail_streak >= threshold && self.status != CredentialStatus::Invalid {
            self.status = CredentialStatus::Unhealthy;
        }
    }
}

/// Computes the health transition for `credential` after a relayed request.
pub fn classify(
    credential: &Credential,
    outcome: &Outcome,
    policy: &KeyPoolPolicy,
    now: SystemTime,
) -> HealthUpdate {
    let threshold = policy.fail_threshold();
    let mut update = HealthUpdate::unchanged(credential);

    let Some(code) = outcome.status else {
        // The path is blamed for network errors; the credential only counts them.
        update.fail_streak = credential.fail_streak.saturating_add(1);
        update.last_error = Some(truncate(
            outcome.message.as_deref().unwrap_or("network error"),
        ));
        update.tally = Some(RequestTally::Failed);
        return update;
    };

    if code < 400 {
        update.fail_streak = 0;
        update.last_error = None;
        update.cooldown = CooldownChange::Clear;
        update.tally = Some(RequestTally::Succeeded);
        return update;
    }

    update.tally = Some(RequestTally::Failed);
    update.last_error = Some(match outcome.message.as_deref() {
        Some(msg) if !msg.trim().is_empty() => truncate(&format!("{code}: {}", msg.trim())),
        _ => code.to_string(),
    });

    match code {
        401 | 403 => {
            update.status = CredentialStatus::Invalid;
            update.fail_streak = credential.fail_streak.saturating_add(1);
        }
        402 => {
            update.fail_streak = credential.fail_streak.saturating_add(1);
            update.set_backoff(policy.cooldown_402_base_seconds, policy, now);
            update.escalate_at(threshold);
        }
        409 | 429 => {
            // Contention and rate limiting are transient: the streak saturates at the
            // threshold but never marks the credential unhealthy on its own.
            update.fail_streak = credential.fail_streak.saturating_add(1).min(threshold);
            if code == 429 {
                update.set_backoff_with_hint(
                    policy.cooldown_429_base_seconds,
                    outcome.retry_after,
                    policy,
                    now,
                );
            } else {
                update.set_backoff(policy.cooldown_409_base_seconds, policy, now);
            }
        }
        c if c >= 500 => {
            update.fail_streak = credential.fail_streak.saturating_add(1);
            update.set_backoff(policy.cooldown_5xx_base_seconds, policy, now);
            update.escalate_at(threshold);
        }
        _ => {
            update.fail_streak = credential.fail_streak.saturating_add(1);
            update.set_backoff(policy.cooldown_409_base_seconds, policy, now);
            update.escalate_at(threshold);
        }
    }

    update
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}
