//! Contract for the shared credential store, and an in-process implementation.
//!
//! Deployments with several processes back this trait with a shared database;
//! `InMemoryCredentialStore` serves single-process deployments and tests.

use crate::classifier::HealthUpdate;
use crate::credential::{Credential, CredentialId, CredentialStatus, UserId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential {0} not found")]
    NotFound(CredentialId),
}

/// Computes a credential's next health from its current row, or `None` to
/// leave the row untouched.
pub type HealthTransition<'a> = dyn Fn(&Credential) -> Option<HealthUpdate> + Send + Sync + 'a;

/// Status before and after an applied [`HealthTransition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub from: CredentialStatus,
    pub to: CredentialStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Which credentials may serve a request at `now`.
#[derive(Clone, Debug, PartialEq)]
pub struct EligibilityFilter {
    pub now: SystemTime,
    /// Credentials stamped more recently than this are skipped.
    pub min_spacing: Duration,
    pub required_tier: Option<i64>,
    pub limit: Option<usize>,
}

impl EligibilityFilter {
    pub fn admits(&self, credential: &Credential) -> bool {
        credential.status == CredentialStatus::Healthy
            && credential.is_enabled
            && !credential.in_cooldown(self.now)
            && !credential.used_within(self.min_spacing, self.now)
            && self
                .required_tier
                .is_none_or(|tier| credential.tier == Some(tier))
    }
}

/// Least recently used first, never-used before everything, then by id.
pub fn lru_order(a: &Credential, b: &Credential) -> std::cmp::Ordering {
    a.last_used_at
        .cmp(&b.last_used_at)
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnedFilter {
    Enabled,
    HealthyAndEnabled,
}

impl OwnedFilter {
    fn admits(&self, credential: &Credential) -> bool {
        match self {
            OwnedFilter::Enabled => credential.is_enabled,
            OwnedFilter::HealthyAndEnabled => {
                credential.is_enabled && credential.status == CredentialStatus::Healthy
            }
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credentials passing `filter`, in [`lru_order`].
    async fn eligible(&self, filter: &EligibilityFilter) -> Result<Vec<Credential>, StoreError>;

    async fn get(&self, id: CredentialId) -> Result<Option<Credential>, StoreError>;

    async fn stamp_used(&self, id: CredentialId, at: SystemTime) -> Result<(), StoreError>;

    /// Reads the credential, runs `transition` on it and writes the result back
    /// as one atomic step. Concurrent writers never see or overwrite each
    /// other's intermediate state. `Ok(None)` when the transition declined.
    async fn update_health(
        &self,
        id: CredentialId,
        transition: &HealthTransition<'_>,
    ) -> Result<Option<StatusChange>, StoreError>;

    /// Enabled credentials that a probe may still recover, i.e. not `invalid`.
    async fn probe_candidates(&self) -> Result<Vec<Credential>, StoreError>;

    async fn count_owned(&self, owner: UserId, filter: OwnedFilter) -> Result<usize, StoreError>;
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: RwLock<BTreeMap<CredentialId, Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let store = Self::new();
        for credential in credentials {
            store.insert(credential);
        }
        store
    }

    pub fn insert(&self, credential: Credential) {
        self.credentials.write().insert(credential.id, credential);
    }

    pub fn snapshot(&self, id: CredentialId) -> Option<Credential> {
        self.credentials.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.credentials.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.read().is_empty()
    }

    pub fn set_enabled(&self, id: CredentialId, enabled: bool) -> Result<(), StoreError> {
        let mut guard = self.credentials.write();
        let credential = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        credential.is_enabled = enabled;
        Ok(())
    }

    /// Owner re-submitted the key: back to `pending` with a clean slate.
    pub fn reverify(&self, id: CredentialId) -> Result<(), StoreError> {
        let mut guard = self.credentials.write();
        let credential = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        credential.status = CredentialStatus::Pending;
        credential.fail_streak = 0;
        credential.cooldown_until = None;
        credential.last_error = None;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn eligible(&self, filter: &EligibilityFilter) -> Result<Vec<Credential>, StoreError> {
        let guard = self.credentials.read();
        let mut eligible: Vec<Credential> = guard
            .values()
            .filter(|c| filter.admits(c))
            .cloned()
            .collect();
        eligible.sort_by(lru_order);
        if let Some(limit) = filter.limit {
            eligible.truncate(limit);
        }
        Ok(eligible)
    }

    async fn get(&self, id: CredentialId) -> Result<Option<Credential>, StoreError> {
        Ok(self.snapshot(id))
    }

    async fn stamp_used(&self, id: CredentialId, at: SystemTime) -> Result<(), StoreError> {
        let mut guard = self.credentials.write();
        let credential = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        credential.last_used_at = Some(at);
        Ok(())
    }

    async fn update_health(
        &self,
        id: CredentialId,
        transition: &HealthTransition<'_>,
    ) -> Result<Option<StatusChange>, StoreError> {
        let mut guard = self.credentials.write();
        let credential = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let Some(update) = transition(credential) else {
            return Ok(None);
        };
        let from = credential.status;
        update.apply_to(credential);
        Ok(Some(StatusChange {
            from,
            to: credential.status,
        }))
    }

    async fn probe_candidates(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self
            .credentials
            .read()
            .values()
            .filter(|c| c.is_enabled && c.status != CredentialStatus::Invalid)
            .cloned()
            .collect())
    }

    async fn count_owned(&self, owner: UserId, filter: OwnedFilter) -> Result<usize, StoreError> {
        Ok(self
            .credentials
            .read()
            .values()
            .filter(|c| c.owner == owner && filter.admits(c))
            .count())
    }
}
