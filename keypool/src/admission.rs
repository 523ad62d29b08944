//! Per-user request quota.
//!
//! The quota is derived from what the user contributes to the pool and enforced
//! over a sliding 60 second window counted from the attempt log.

use crate::config::AdmissionPolicy;
use crate::credential::UserId;
use crate::metrics_defs::ADMISSION_REJECTED;
use crate::store::{CredentialStore, OwnedFilter, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::counter;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub const ADMISSION_WINDOW: Duration = Duration::from_secs(60);

/// The subset of a user record that admission needs.
#[derive(Clone, Debug, PartialEq)]
pub struct UserProfile {
    pub id: UserId,
    /// Operator override. Bypasses every other rule when set.
    pub manual_rpm: Option<i64>,
}

impl UserProfile {
    pub fn new(id: UserId) -> Self {
        UserProfile {
            id,
            manual_rpm: None,
        }
    }

    pub fn with_manual_rpm(mut self, rpm: i64) -> Self {
        self.manual_rpm = Some(rpm);
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AdmissionError {
    #[error("no quota available")]
    NoQuota,
    #[error("rate limit exceeded ({used}/{quota} per minute)")]
    RateLimited { used: usize, quota: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admitted {
    pub quota: i64,
    pub used: usize,
}

/// Request audit log, as far as admission is concerned.
#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn count_recent_attempts(
        &self,
        user: UserId,
        window: Duration,
        now: SystemTime,
    ) -> Result<usize, StoreError>;

    async fn record_attempt(&self, user: UserId, at: SystemTime) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryAttemptLog {
    attempts: Mutex<HashMap<UserId, VecDeque<SystemTime>>>,
}

impl InMemoryAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptLog for InMemoryAttemptLog {
    async fn count_recent_attempts(
        &self,
        user: UserId,
        window: Duration,
        now: SystemTime,
    ) -> Result<usize, StoreError> {
        let mut guard = self.attempts.lock();
        let Some(entries) = guard.get_mut(&user) else {
            return Ok(0);
        };

        let window_start = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
        while entries.front().is_some_and(|at| *at < window_start) {
            entries.pop_front();
        }
        Ok(entries.iter().filter(|at| **at <= now).count())
    }

    async fn record_attempt(&self, user: UserId, at: SystemTime) -> Result<(), StoreError> {
        let mut guard = self.attempts.lock();
        let entries = guard.entry(user).or_default();
        // Keep entries ordered so pruning from the front stays correct.
        let position = entries.partition_point(|existing| *existing <= at);
        entries.insert(position, at);
        Ok(())
    }
}

pub struct AdmissionController {
    store: Arc<dyn CredentialStore>,
    attempts: Arc<dyn AttemptLog>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CredentialStore>, attempts: Arc<dyn AttemptLog>) -> Self {
        AdmissionController { store, attempts }
    }

    /// Requests per minute allowed for `user`.
    pub async fn quota_for(
        &self,
        user: &UserProfile,
        policy: &AdmissionPolicy,
    ) -> Result<i64, StoreError> {
        if let Some(manual) = user.manual_rpm {
            return Ok(manual.max(0));
        }

        if !policy.auto_quota_enabled {
            return Ok(policy.manual_global_rpm.max(0));
        }

        if policy.base_rpm_contributor_only {
            let contributed = self.store.count_owned(user.id, OwnedFilter::Enabled).await?;
            if contributed == 0 {
                return Ok(0);
            }
        }

        let healthy = self
            .store
            .count_owned(user.id, OwnedFilter::HealthyAndEnabled)
            .await?;
        let healthy = i64::try_from(healthy).unwrap_or(i64::MAX);

        let mut rpm = policy
            .base_rpm
            .saturating_add(healthy.saturating_mul(policy.per_key_rpm));
        if policy.max_rpm > 0 {
            rpm = rpm.min(policy.max_rpm);
        }
        Ok(rpm.max(0))
    }

    /// Checks the user's quota against their attempts in the trailing window.
    pub async fn admit(
        &self,
        user: &UserProfile,
        policy: &AdmissionPolicy,
        now: SystemTime,
    ) -> Result<Admitted, AdmissionError> {
        let quota = self.quota_for(user, policy).await?;
        if quota <= 0 {
            counter!(ADMISSION_REJECTED, "reason" => "no_quota").increment(1);
            return Err(AdmissionError::NoQuota);
        }

        let used = self
            .attempts
            .count_recent_attempts(user.id, ADMISSION_WINDOW, now)
            .await?;
        if i64::try_from(used).unwrap_or(i64::MAX) >= quota {
            counter!(ADMISSION_REJECTED, "reason" => "rate_limited").increment(1);
            tracing::debug!(user_id = user.id, used, quota, "Rate limit reached");
            return Err(AdmissionError::RateLimited { used, quota });
        }

        Ok(Admitted { quota, used })
    }

    pub async fn record_attempt(&self, user: UserId, at: SystemTime) -> Result<(), StoreError> {
        self.attempts.record_attempt(user, at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{Credential, CredentialStatus, Secret};
    use crate::store::InMemoryCredentialStore;

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn owned(id: u64, owner: UserId, status: CredentialStatus, enabled: bool) -> Credential {
        let mut c = Credential::new(id, owner, Secret::new("k"));
        c.status = status;
        c.is_enabled = enabled;
        c
    }

    fn controller(credentials: Vec<Credential>) -> AdmissionController {
        AdmissionController::new(
            Arc::new(InMemoryCredentialStore::from_credentials(credentials)),
            Arc::new(InMemoryAttemptLog::new()),
        )
    }

    #[tokio::test]
    async fn test_manual_override_wins() {
        let controller = controller(vec![owned(1, 7, CredentialStatus::Healthy, true)]);
        let policy = AdmissionPolicy {
            auto_quota_enabled: true,
            base_rpm: 50,
            ..Default::default()
        };

        let user = UserProfile::new(7).with_manual_rpm(0);
        assert_eq!(controller.quota_for(&user, &policy).await.unwrap(), 0);
        assert!(matches!(
            controller.admit(&user, &policy, epoch(0)).await,
            Err(AdmissionError::NoQuota)
        ));

        let user = UserProfile::new(7).with_manual_rpm(-5);
        assert_eq!(controller.quota_for(&user, &policy).await.unwrap(), 0);

        let user = UserProfile::new(8).with_manual_rpm(4);
        assert_eq!(controller.quota_for(&user, &policy).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_global_manual_quota() {
        let controller = controller(vec![]);
        let policy = AdmissionPolicy {
            auto_quota_enabled: false,
            manual_global_rpm: 6,
            ..Default::default()
        };
        assert_eq!(
            controller.quota_for(&UserProfile::new(1), &policy).await.unwrap(),
            6
        );
    }

    #[tokio::test]
    async fn test_contributor_only_base() {
        let controller = controller(vec![
            owned(1, 7, CredentialStatus::Healthy, false),
            owned(2, 8, CredentialStatus::Pending, true),
        ]);
        let policy = AdmissionPolicy {
            base_rpm: 5,
            per_key_rpm: 10,
            base_rpm_contributor_only: true,
            ..Default::default()
        };

        // Only a disabled credential: nothing contributed.
        assert_eq!(
            controller.quota_for(&UserProfile::new(7), &policy).await.unwrap(),
            0
        );
        // Enabled but not yet healthy: base allowance only.
        assert_eq!(
            controller.quota_for(&UserProfile::new(8), &policy).await.unwrap(),
            5
        );

        let open = AdmissionPolicy {
            base_rpm_contributor_only: false,
            ..policy
        };
        assert_eq!(
            controller.quota_for(&UserProfile::new(7), &open).await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn test_quota_scales_and_caps() {
        let credentials = (1..=20)
            .map(|id| owned(id, 7, CredentialStatus::Healthy, true))
            .collect();
        let controller = controller(credentials);

        let policy = AdmissionPolicy {
            base_rpm: 2,
            per_key_rpm: 10,
            max_rpm: 120,
            ..Default::default()
        };
        assert_eq!(
            controller.quota_for(&UserProfile::new(7), &policy).await.unwrap(),
            120
        );

        let uncapped = AdmissionPolicy {
            max_rpm: 0,
            ..policy.clone()
        };
        assert_eq!(
            controller.quota_for(&UserProfile::new(7), &uncapped).await.unwrap(),
            202
        );

        let negative = AdmissionPolicy {
            base_rpm: -500,
            ..policy
        };
        assert_eq!(
            controller.quota_for(&UserProfile::new(7), &negative).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_sliding_window() {
        let controller = controller(vec![]);
        let policy = AdmissionPolicy {
            auto_quota_enabled: false,
            manual_global_rpm: 2,
            ..Default::default()
        };
        let user = UserProfile::new(1);

        controller.record_attempt(1, epoch(100)).await.unwrap();
        controller.record_attempt(1, epoch(130)).await.unwrap();
        // Another user's attempts do not count.
        controller.record_attempt(2, epoch(130)).await.unwrap();

        assert!(matches!(
            controller.admit(&user, &policy, epoch(150)).await,
            Err(AdmissionError::RateLimited { used: 2, quota: 2 })
        ));

        // The first attempt slides out of the window.
        let admitted = controller.admit(&user, &policy, epoch(161)).await.unwrap();
        assert_eq!(admitted, Admitted { quota: 2, used: 1 });
    }

    #[tokio::test]
    async fn test_attempt_log_orders_out_of_order_writes() {
        let log = InMemoryAttemptLog::new();
        log.record_attempt(1, epoch(120)).await.unwrap();
        log.record_attempt(1, epoch(50)).await.unwrap();
        log.record_attempt(1, epoch(90)).await.unwrap();

        assert_eq!(
            log.count_recent_attempts(1, ADMISSION_WINDOW, epoch(125))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            log.count_recent_attempts(9, ADMISSION_WINDOW, epoch(125))
                .await
                .unwrap(),
            0
        );
    }
}
