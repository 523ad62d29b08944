//! Keeps this process's settings in step with the shared config store.

use crate::config::SharedSettings;
use crate::config_source::{ConfigSource, ConfigSourceError};
use crate::metrics_defs::{CONFIG_REFRESH_FAILED, CONFIG_RELOADED};
use parking_lot::Mutex;
use shared::counter;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Refresh is off, or the poll interval has not elapsed.
    Skipped,
    /// The shared store was checked and nothing changed, or it could not be read.
    Unchanged,
    /// New settings are live. Background loops should be reconciled.
    Reloaded,
}

pub struct ConfigRefresher {
    source: Arc<dyn ConfigSource>,
    settings: Arc<SharedSettings>,
    last_check: Mutex<Option<SystemTime>>,
    // Held across check-then-reload. Also guards the version we last applied.
    reload_lock: tokio::sync::Mutex<Option<SystemTime>>,
}

impl ConfigRefresher {
    pub fn new(source: Arc<dyn ConfigSource>, settings: Arc<SharedSettings>) -> Self {
        ConfigRefresher {
            source,
            settings,
            last_check: Mutex::new(None),
            reload_lock: tokio::sync::Mutex::new(None),
        }
    }

    fn is_due(&self, now: SystemTime) -> bool {
        let interval = self.settings.current().scheduler.refresh_interval();
        match *self.last_check.lock() {
            None => true,
            Some(last) => now.duration_since(last).is_ok_and(|elapsed| elapsed >= interval),
        }
    }

    /// Overlays the shared store once, regardless of the refresh policy.
    pub async fn load_initial(&self) -> Result<(), ConfigSourceError> {
        let mut applied_version = self.reload_lock.lock().await;
        let version = self.source.config_version().await?;
        self.reload(version).await?;
        *applied_version = version;
        Ok(())
    }

    /// Reloads settings if the shared store changed since the last reload.
    ///
    /// When not due this is a timestamp compare. Read failures are logged and
    /// keep the current settings.
    pub async fn refresh_if_due(&self, now: SystemTime) -> RefreshOutcome {
        if !self.settings.current().scheduler.refresh_active() || !self.is_due(now) {
            return RefreshOutcome::Skipped;
        }

        let mut applied_version = self.reload_lock.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if !self.is_due(now) {
            return RefreshOutcome::Skipped;
        }

        let outcome = match self.check(*applied_version).await {
            Ok(Some(version)) => {
                *applied_version = Some(version);
                counter!(CONFIG_RELOADED).increment(1);
                RefreshOutcome::Reloaded
            }
            Ok(None) => RefreshOutcome::Unchanged,
            Err(e) => {
                counter!(CONFIG_REFRESH_FAILED).increment(1);
                tracing::warn!(error = %e, "Shared config refresh failed");
                RefreshOutcome::Unchanged
            }
        };

        *self.last_check.lock() = Some(now);
        outcome
    }

    /// Returns the version that was applied, if a reload happened.
    async fn check(
        &self,
        applied: Option<SystemTime>,
    ) -> Result<Option<SystemTime>, ConfigSourceError> {
        let Some(latest) = self.source.config_version().await? else {
            return Ok(None);
        };
        if applied.is_some_and(|applied| latest <= applied) {
            return Ok(None);
        }

        self.reload(Some(latest)).await?;
        Ok(Some(latest))
    }

    async fn reload(&self, version: Option<SystemTime>) -> Result<(), ConfigSourceError> {
        let entries = self.source.load_config().await?;
        let overlay = self.settings.current().overlay(&entries);
        tracing::info!(
            applied = overlay.applied.len(),
            skipped = overlay.skipped.len(),
            ?version,
            "Applied shared config"
        );
        self.settings.replace(overlay.settings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::config_source::InMemoryConfigSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn multi_node() -> Settings {
        let mut settings = Settings::default();
        settings.scheduler.multi_node_enabled = true;
        settings
    }

    #[tokio::test]
    async fn test_reload_on_new_version_only() {
        let source = Arc::new(InMemoryConfigSource::new());
        let settings = Arc::new(SharedSettings::new(multi_node()));
        let refresher = ConfigRefresher::new(source.clone(), settings.clone());

        // Nothing stored yet.
        assert_eq!(refresher.refresh_if_due(epoch(100)).await, RefreshOutcome::Unchanged);

        source.set("max_rpm", "30", epoch(101));
        // Within the 5 second poll interval.
        assert_eq!(refresher.refresh_if_due(epoch(103)).await, RefreshOutcome::Skipped);
        assert_eq!(refresher.refresh_if_due(epoch(105)).await, RefreshOutcome::Reloaded);
        assert_eq!(settings.current().admission.max_rpm, 30);

        // Same version again.
        assert_eq!(refresher.refresh_if_due(epoch(110)).await, RefreshOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_inactive_outside_multi_node() {
        let source = Arc::new(InMemoryConfigSource::new());
        source.set("max_rpm", "30", epoch(1));
        let settings = Arc::new(SharedSettings::new(Settings::default()));
        let refresher = ConfigRefresher::new(source, settings.clone());

        assert_eq!(refresher.refresh_if_due(epoch(100)).await, RefreshOutcome::Skipped);
        assert_eq!(settings.current().admission.max_rpm, 120);

        // The startup load still applies.
        refresher.load_initial().await.unwrap();
        assert_eq!(settings.current().admission.max_rpm, 30);
    }

    #[tokio::test]
    async fn test_refresh_cannot_disable_itself() {
        let source = Arc::new(InMemoryConfigSource::new());
        source.set("system_config_refresh_enabled", "false", epoch(1));
        source.set("per_key_rpm", "2", epoch(1));
        let settings = Arc::new(SharedSettings::new(multi_node()));
        let refresher = ConfigRefresher::new(source, settings.clone());

        assert_eq!(refresher.refresh_if_due(epoch(10)).await, RefreshOutcome::Reloaded);
        assert!(settings.current().scheduler.system_config_refresh_enabled);
        assert_eq!(settings.current().admission.per_key_rpm, 2);
    }

    struct FailingSource {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl ConfigSource for FailingSource {
        async fn config_version(&self) -> Result<Option<SystemTime>, ConfigSourceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(ConfigSourceError::Unavailable("database is down".into()))
        }

        async fn load_config(&self) -> Result<Vec<(String, String)>, ConfigSourceError> {
            Err(ConfigSourceError::Unavailable("database is down".into()))
        }
    }

    #[tokio::test]
    async fn test_failure_keeps_settings_and_advances_check() {
        let source = Arc::new(FailingSource {
            reads: AtomicUsize::new(0),
        });
        let settings = Arc::new(SharedSettings::new(multi_node()));
        let refresher = ConfigRefresher::new(source.clone(), settings.clone());

        assert_eq!(refresher.refresh_if_due(epoch(10)).await, RefreshOutcome::Unchanged);
        assert_eq!(refresher.refresh_if_due(epoch(11)).await, RefreshOutcome::Skipped);
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
        assert_eq!(*settings.current(), multi_node());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_check_once() {
        let source = Arc::new(FailingSource {
            reads: AtomicUsize::new(0),
        });
        let settings = Arc::new(SharedSettings::new(multi_node()));
        let refresher = Arc::new(ConfigRefresher::new(source.clone(), settings));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let refresher = refresher.clone();
                tokio::spawn(async move { refresher.refresh_if_due(epoch(50)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    }
}
