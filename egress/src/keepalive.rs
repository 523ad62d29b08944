use crate::config::EgressPolicy;
use crate::mask::mask_proxy_url;
use crate::metrics_defs::PATHS_AVAILABLE;
use crate::pool::EgressPool;
use async_trait::async_trait;
use shared::gauge;
use std::sync::Arc;
use std::time::SystemTime;

/// Makes one lightweight request through an egress path.
#[async_trait]
pub trait PathProber: Send + Sync {
    /// The response status, or the network error that prevented one.
    async fn probe(&self, proxy_url: &str, policy: &EgressPolicy) -> Result<u16, String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HttpPathProber;

#[async_trait]
impl PathProber for HttpPathProber {
    async fn probe(&self, proxy_url: &str, policy: &EgressPolicy) -> Result<u16, String> {
        let target = policy.keepalive_url().map_err(|e| e.to_string())?;
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| e.to_string())?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(policy.keepalive_timeout())
            .build()
            .map_err(|e| e.to_string())?;

        let response = client
            .get(target)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

pub struct Keepalive {
    pool: Arc<EgressPool>,
    prober: Arc<dyn PathProber>,
}

impl Keepalive {
    pub fn new(pool: Arc<EgressPool>, prober: Arc<dyn PathProber>) -> Self {
        Keepalive { pool, prober }
    }

    /// Probes every configured path once, sequentially, and reports each
    /// outcome to the pool. Returns how many paths were probed.
    pub async fn probe_all(&self, policy: &EgressPolicy, now: impl Fn() -> SystemTime) -> usize {
        let paths = self.pool.paths(policy);

        for url in &paths {
            match self.prober.probe(url, policy).await {
                Ok(status) => {
                    tracing::debug!(proxy = %mask_proxy_url(url), status, "Keepalive probe");
                    self.pool.report_result(url, Some(status), None, policy, now());
                }
                Err(error) => {
                    tracing::info!(proxy = %mask_proxy_url(url), error = %error, "Keepalive probe failed");
                    self.pool.report_result(url, None, Some(&error), policy, now());
                }
            }
        }

        let available = self
            .pool
            .snapshot(policy, now())
            .iter()
            .filter(|row| row.is_available)
            .count();
        gauge!(PATHS_AVAILABLE).set(available as f64);
        paths.len()
    }
}
