use crate::config::{Settings, SharedSettings};
use crate::config_source::ConfigSource;
use crate::errors::RelayError;
use crate::metrics_defs::OUTCOME_RECORDED;
use crate::refresh::{ConfigRefresher, RefreshOutcome};
use crate::scheduler::{LoopContext, ReconcileReport, Scheduler};
use egress::{EgressPool, HttpPathProber, Keepalive, PathProber, PathSnapshot};
use keypool::admission::{AdmissionController, AttemptLog, InMemoryAttemptLog, UserProfile};
use keypool::classifier::{Outcome, classify};
use keypool::health::{HealthChecker, HttpSubscriptionProbe, SubscriptionProbe};
use keypool::metrics_defs::CREDENTIAL_TRANSITION;
use keypool::selector::CredentialSelector;
use keypool::store::{CredentialStore, StoreError};
use keypool::{Credential, CredentialId, UserId};
use shared::clock::{Clock, SystemClock};
use shared::counter;
use std::sync::Arc;

pub struct EngineBuilder {
    settings: Settings,
    store: Arc<dyn CredentialStore>,
    attempts: Option<Arc<dyn AttemptLog>>,
    subscription_probe: Option<Arc<dyn SubscriptionProbe>>,
    path_prober: Option<Arc<dyn PathProber>>,
    config_source: Option<Arc<dyn ConfigSource>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn attempts(mut self, attempts: Arc<dyn AttemptLog>) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn subscription_probe(mut self, probe: Arc<dyn SubscriptionProbe>) -> Self {
        self.subscription_probe = Some(probe);
        self
    }

    pub fn path_prober(mut self, prober: Arc<dyn PathProber>) -> Self {
        self.path_prober = Some(prober);
        self
    }

    /// Enables runtime overlay from a shared config store.
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Engine {
        let settings = Arc::new(SharedSettings::new(self.settings));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let attempts = self
            .attempts
            .unwrap_or_else(|| Arc::new(InMemoryAttemptLog::new()));
        let subscription_probe = self
            .subscription_probe
            .unwrap_or_else(|| Arc::new(HttpSubscriptionProbe::new()));
        let path_prober = self.path_prober.unwrap_or_else(|| Arc::new(HttpPathProber));

        let pool = Arc::new(EgressPool::new());
        let context = Arc::new(LoopContext {
            settings: settings.clone(),
            health: Arc::new(HealthChecker::new(self.store.clone(), subscription_probe)),
            keepalive: Arc::new(Keepalive::new(pool.clone(), path_prober)),
            clock: clock.clone(),
        });

        Engine {
            admission: AdmissionController::new(self.store.clone(), attempts),
            selector: CredentialSelector::new(self.store.clone()),
            refresher: self
                .config_source
                .map(|source| ConfigRefresher::new(source, settings.clone())),
            scheduler: Scheduler::new(context.clone()),
            store: self.store,
            settings,
            pool,
            context,
            clock,
        }
    }
}

/// Routes relay requests onto credentials and egress paths.
pub struct Engine {
    settings: Arc<SharedSettings>,
    store: Arc<dyn CredentialStore>,
    admission: AdmissionController,
    selector: CredentialSelector,
    pool: Arc<EgressPool>,
    context: Arc<LoopContext>,
    scheduler: Scheduler,
    refresher: Option<ConfigRefresher>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn builder(settings: Settings, store: Arc<dyn CredentialStore>) -> EngineBuilder {
        EngineBuilder {
            settings,
            store,
            attempts: None,
            subscription_probe: None,
            path_prober: None,
            config_source: None,
            clock: None,
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.current()
    }

    /// Overlays the shared config store, if one is configured. Failures are
    /// logged and leave the static settings in effect.
    pub async fn load_shared_config(&self) {
        if let Some(refresher) = &self.refresher {
            if let Err(e) = refresher.load_initial().await {
                tracing::warn!(error = %e, "Initial shared config load failed");
            }
        }
    }

    /// Applies the shared config once and starts the background loops that
    /// should run on this process.
    pub async fn start(&self) -> ReconcileReport {
        self.load_shared_config().await;
        self.scheduler.reconcile()
    }

    pub fn reconcile(&self) -> ReconcileReport {
        self.scheduler.reconcile()
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    async fn refresh(&self) {
        let Some(refresher) = &self.refresher else {
            return;
        };
        if refresher.refresh_if_due(self.clock.now()).await == RefreshOutcome::Reloaded {
            let report = self.scheduler.reconcile();
            tracing::debug!(?report, "Reconciled after config reload");
        }
    }

    /// Admits the user and claims a credential for one upstream call.
    ///
    /// Admission runs first so a user without quota never consumes a
    /// credential's turn. The attempt is logged once admitted, whether or not a
    /// credential turns out to be available.
    pub async fn admit_and_select(&self, user: &UserProfile) -> Result<Credential, RelayError> {
        self.refresh().await;
        let settings = self.settings.current();
        let now = self.clock.now();

        self.admission.admit(user, &settings.admission, now).await?;
        self.admission.record_attempt(user.id, now).await?;

        self.selector
            .select(&settings.keys, now)
            .await?
            .ok_or(RelayError::NoCredentialAvailable)
    }

    /// The egress path for this user's next call, or `None` to go direct.
    pub fn select_egress_path(&self, user_id: UserId) -> Option<String> {
        let settings = self.settings.current();
        self.pool
            .select_for_user(user_id, &settings.egress, self.clock.now())
    }

    /// Feeds an upstream outcome back into credential and path health.
    pub async fn record_outcome(
        &self,
        credential_id: CredentialId,
        path: Option<&str>,
        outcome: &Outcome,
    ) -> Result<(), RelayError> {
        let settings = self.settings.current();
        let now = self.clock.now();

        if let Some(path) = path {
            // Upstream bodies are not path errors; only network failures carry one.
            let error = outcome
                .status
                .is_none()
                .then_some(outcome.message.as_deref())
                .flatten();
            self.pool
                .report_result(path, outcome.status, error, &settings.egress, now);
        }

        let class = match outcome.status {
            None => "network",
            Some(code) if code < 400 => "success",
            Some(_) => "rejected",
        };
        counter!(OUTCOME_RECORDED, "class" => class).increment(1);

        // Classified against the row as the store holds it at write time, so
        // overlapping outcomes for one credential all count.
        let transition =
            |current: &Credential| Some(classify(current, outcome, &settings.keys, now));

        match self.store.update_health(credential_id, &transition).await {
            Ok(Some(change)) if change.changed() => {
                counter!(CREDENTIAL_TRANSITION, "status" => change.to.as_str()).increment(1);
                tracing::info!(
                    credential_id,
                    from = %change.from,
                    to = %change.to,
                    status = ?outcome.status,
                    "Credential status changed"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(credential_id, "Outcome for unknown credential ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Probes every credential now, outside the loop schedule.
    pub async fn trigger_probe_now(&self) -> Result<usize, StoreError> {
        let settings = self.settings.current();
        self.context
            .health
            .check_all(&settings.keys, &settings.health, || self.clock.now())
            .await
    }

    /// One keepalive pass over the egress paths, outside the loop schedule.
    pub async fn keepalive_now(&self) -> usize {
        let settings = self.settings.current();
        self.context
            .keepalive
            .probe_all(&settings.egress, || self.clock.now())
            .await
    }

    pub fn pool_snapshot(&self) -> Vec<PathSnapshot> {
        let settings = self.settings.current();
        self.pool.snapshot(&settings.egress, self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_source::InMemoryConfigSource;
    use crate::scheduler::LoopKind;
    use crate::testutils::{CountingPathProber, CountingProbe};
    use egress::ProxyMode;
    use keypool::{CredentialStatus, Secret};
    use keypool::store::InMemoryCredentialStore;
    use shared::clock::ManualClock;
    use std::time::{Duration, SystemTime};

    const OWNER: UserId = 7;

    fn healthy(id: CredentialId) -> Credential {
        let mut c = Credential::new(id, OWNER, Secret::new(format!("key-{id}")));
        c.status = CredentialStatus::Healthy;
        c.tier = Some(3);
        c
    }

    struct Fixture {
        engine: Engine,
        store: Arc<InMemoryCredentialStore>,
        clock: Arc<ManualClock>,
        probe: Arc<CountingProbe>,
    }

    fn fixture(settings: Settings, credentials: Vec<Credential>) -> Fixture {
        let store = Arc::new(InMemoryCredentialStore::from_credentials(credentials));
        let clock = Arc::new(ManualClock::at_epoch_offset(10_000));
        let probe = Arc::new(CountingProbe::default());
        let engine = Engine::builder(settings, store.clone())
            .clock(clock.clone())
            .subscription_probe(probe.clone())
            .path_prober(Arc::new(CountingPathProber::default()))
            .build();
        Fixture {
            engine,
            store,
            clock,
            probe,
        }
    }

    #[tokio::test]
    async fn test_admit_and_select_rotates_credentials() {
        let f = fixture(Settings::default(), vec![healthy(1), healthy(2)]);
        let user = UserProfile::new(OWNER);

        let first = f.engine.admit_and_select(&user).await.unwrap();
        let second = f.engine.admit_and_select(&user).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        // Both credentials are inside the 3 second spacing.
        let err = f.engine.admit_and_select(&user).await.unwrap_err();
        assert!(matches!(err, RelayError::NoCredentialAvailable));
        assert!(err.is_capacity());

        f.clock.advance(Duration::from_secs(3));
        assert_eq!(f.engine.admit_and_select(&user).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_rejected_user_consumes_no_credential() {
        let f = fixture(Settings::default(), vec![healthy(1)]);

        let err = f
            .engine
            .admit_and_select(&UserProfile::new(OWNER).with_manual_rpm(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::QuotaExhausted));
        assert_eq!(f.store.snapshot(1).unwrap().last_used_at, None);

        // A non-contributor gets no base quota by default.
        let err = f
            .engine
            .admit_and_select(&UserProfile::new(99))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::QuotaExhausted));
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let f = fixture(Settings::default(), vec![healthy(1)]);
        let user = UserProfile::new(OWNER).with_manual_rpm(2);

        f.engine.admit_and_select(&user).await.unwrap();
        f.clock.advance(Duration::from_secs(5));
        f.engine.admit_and_select(&user).await.unwrap();
        f.clock.advance(Duration::from_secs(5));

        let err = f.engine.admit_and_select(&user).await.unwrap_err();
        assert!(matches!(err, RelayError::RateLimited { used: 2, quota: 2 }));

        // The first attempt leaves the window.
        f.clock.advance(Duration::from_secs(51));
        f.engine.admit_and_select(&user).await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_429_cools_down_without_escalating() {
        let mut settings = Settings::default();
        settings.keys.cooldown_429_base_seconds = 10;
        settings.keys.health_check_fail_threshold = 10;
        settings.keys.cooldown_max_seconds = 120;
        let f = fixture(settings, vec![healthy(1)]);

        for _ in 0..3 {
            f.engine
                .record_outcome(1, None, &Outcome::status(429))
                .await
                .unwrap();
        }

        let credential = f.store.snapshot(1).unwrap();
        assert_eq!(credential.fail_streak, 3);
        assert_eq!(credential.status, CredentialStatus::Healthy);
        assert_eq!(
            credential.cooldown_until,
            Some(f.clock.now() + Duration::from_secs(40))
        );
        assert_eq!(credential.fail_requests, 3);
    }

    /// Yields before every read and write so overlapping calls interleave.
    struct SlowStore {
        inner: Arc<InMemoryCredentialStore>,
    }

    #[async_trait::async_trait]
    impl CredentialStore for SlowStore {
        async fn eligible(
            &self,
            filter: &keypool::store::EligibilityFilter,
        ) -> Result<Vec<Credential>, StoreError> {
            self.inner.eligible(filter).await
        }

        async fn get(&self, id: CredentialId) -> Result<Option<Credential>, StoreError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.get(id).await
        }

        async fn stamp_used(&self, id: CredentialId, at: SystemTime) -> Result<(), StoreError> {
            self.inner.stamp_used(id, at).await
        }

        async fn update_health(
            &self,
            id: CredentialId,
            transition: &keypool::store::HealthTransition<'_>,
        ) -> Result<Option<keypool::store::StatusChange>, StoreError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.update_health(id, transition).await
        }

        async fn probe_candidates(&self) -> Result<Vec<Credential>, StoreError> {
            self.inner.probe_candidates().await
        }

        async fn count_owned(
            &self,
            owner: UserId,
            filter: keypool::store::OwnedFilter,
        ) -> Result<usize, StoreError> {
            self.inner.count_owned(owner, filter).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_outcomes_all_count() {
        let inner = Arc::new(InMemoryCredentialStore::from_credentials([healthy(1)]));
        let store = Arc::new(SlowStore {
            inner: inner.clone(),
        });
        let engine = Engine::builder(Settings::default(), store)
            .clock(Arc::new(ManualClock::at_epoch_offset(10_000)))
            .subscription_probe(Arc::new(CountingProbe::default()))
            .path_prober(Arc::new(CountingPathProber::default()))
            .build();

        let failure = Outcome::status(500);
        let (first, second) = tokio::join!(
            engine.record_outcome(1, None, &failure),
            engine.record_outcome(1, None, &failure),
        );
        first.unwrap();
        second.unwrap();

        let credential = inner.snapshot(1).unwrap();
        assert_eq!(credential.fail_requests, 2);
        assert_eq!(credential.fail_streak, 2);
        assert_eq!(credential.status, CredentialStatus::Healthy);

        engine.record_outcome(1, None, &failure).await.unwrap();
        let credential = inner.snapshot(1).unwrap();
        assert_eq!(credential.fail_streak, 3);
        assert_eq!(credential.status, CredentialStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_invalid_credential_never_selected() {
        let f = fixture(Settings::default(), vec![healthy(1)]);
        f.engine
            .record_outcome(1, None, &Outcome::rejected(401, "Unauthorized"))
            .await
            .unwrap();

        let err = f
            .engine
            .admit_and_select(&UserProfile::new(OWNER).with_manual_rpm(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoCredentialAvailable));

        // A probe pass leaves it invalid and skips it.
        assert_eq!(f.engine.trigger_probe_now().await.unwrap(), 0);
        assert_eq!(f.probe.calls(), 0);
        assert_eq!(f.store.snapshot(1).unwrap().status, CredentialStatus::Invalid);
    }

    #[tokio::test]
    async fn test_record_outcome_feeds_egress_path() {
        let mut settings = Settings::default();
        settings.egress.upstream_proxy_mode = ProxyMode::ProxyPool;
        settings.egress.upstream_proxies = vec!["http://user:pw@p1:1".into()];
        let f = fixture(settings, vec![healthy(1)]);

        let path = f.engine.select_egress_path(OWNER).unwrap();
        assert_eq!(path, "http://user:pw@p1:1");

        f.engine
            .record_outcome(1, Some(&path), &Outcome::network_error("connection reset"))
            .await
            .unwrap();

        let snapshot = f.engine.pool_snapshot();
        assert_eq!(snapshot[0].proxy, "http://p1:1");
        assert!(!snapshot[0].is_available);
        assert_eq!(snapshot[0].last_error.as_deref(), Some("connection reset"));
        assert_eq!(f.engine.select_egress_path(OWNER), None);

        // The credential only counts the network error.
        let credential = f.store.snapshot(1).unwrap();
        assert_eq!(credential.fail_streak, 1);
        assert_eq!(credential.cooldown_until, None);
    }

    #[tokio::test]
    async fn test_unknown_credential_outcome_is_ignored() {
        let f = fixture(Settings::default(), vec![]);
        f.engine
            .record_outcome(404, None, &Outcome::status(500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_trigger_probe_now() {
        let mut pending = healthy(1);
        pending.status = CredentialStatus::Pending;
        let f = fixture(Settings::default(), vec![pending, healthy(2)]);

        assert_eq!(f.engine.trigger_probe_now().await.unwrap(), 2);
        assert_eq!(f.store.snapshot(1).unwrap().status, CredentialStatus::Healthy);
        assert_eq!(
            f.store.snapshot(2).unwrap().last_checked_at,
            Some(f.clock.now())
        );
    }

    #[tokio::test]
    async fn test_config_reload_reconciles_loops() {
        let mut settings = Settings::default();
        settings.scheduler.multi_node_enabled = true;
        settings.scheduler.health_check_enabled = false;

        let source = Arc::new(InMemoryConfigSource::new());
        let store = Arc::new(InMemoryCredentialStore::from_credentials([healthy(1)]));
        let clock = Arc::new(ManualClock::at_epoch_offset(10_000));
        let engine = Engine::builder(settings, store)
            .clock(clock.clone())
            .subscription_probe(Arc::new(CountingProbe::default()))
            .config_source(source.clone())
            .build();

        assert!(engine.start().await.is_noop());

        source.set("health_check_enabled", "true", SystemTime::UNIX_EPOCH);
        source.set("node_id", "node-9", SystemTime::UNIX_EPOCH);
        clock.advance(Duration::from_secs(5));
        engine
            .admit_and_select(&UserProfile::new(OWNER))
            .await
            .unwrap();

        assert!(engine.scheduler.is_running(LoopKind::HealthCheck));
        assert_eq!(engine.settings().scheduler.node_id, "node-1");
        assert!(engine.reconcile().is_noop());
        engine.shutdown().await;
    }
}
