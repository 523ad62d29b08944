use crate::config::KeyPoolPolicy;
use crate::credential::Credential;
use crate::metrics_defs::{CREDENTIAL_SELECTED, CREDENTIAL_UNAVAILABLE};
use crate::store::{CredentialStore, EligibilityFilter, StoreError};
use shared::counter;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Picks the least recently used eligible credential and stamps it as used.
pub struct CredentialSelector {
    store: Arc<dyn CredentialStore>,
    // Held across select + stamp so two requests never claim the same credential.
    select_lock: Semaphore,
}

impl CredentialSelector {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        CredentialSelector {
            store,
            select_lock: Semaphore::new(1),
        }
    }

    /// Returns `Ok(None)` when nothing is eligible. That is a capacity condition,
    /// not a failure.
    pub async fn select(
        &self,
        policy: &KeyPoolPolicy,
        now: SystemTime,
    ) -> Result<Option<Credential>, StoreError> {
        let _permit = self.get_permit().await?;

        let filter = EligibilityFilter {
            now,
            min_spacing: policy.min_spacing(),
            required_tier: policy.tier_requirement(),
            limit: Some(1),
        };

        let Some(mut credential) = self.store.eligible(&filter).await?.into_iter().next() else {
            counter!(CREDENTIAL_UNAVAILABLE).increment(1);
            tracing::debug!("No eligible credential");
            return Ok(None);
        };

        self.store.stamp_used(credential.id, now).await?;
        credential.last_used_at = Some(now);

        counter!(CREDENTIAL_SELECTED).increment(1);
        tracing::debug!(credential_id = credential.id, "Selected credential");
        Ok(Some(credential))
    }

    async fn get_permit(&self) -> Result<SemaphorePermit<'_>, StoreError> {
        self.select_lock
            .acquire()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}
