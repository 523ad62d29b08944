use async_trait::async_trait;
use egress::{EgressPolicy, PathProber};
use keypool::Secret;
use keypool::config::HealthCheckPolicy;
use keypool::health::{ProbeResult, SubscriptionProbe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Reports every credential as a tier 3 subscription.
#[derive(Default)]
pub struct CountingProbe {
    calls: AtomicUsize,
}

impl CountingProbe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionProbe for CountingProbe {
    async fn probe(&self, _secret: &Secret, _policy: &HealthCheckPolicy) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ProbeResult::Succeeded { tier: Some(3) }
    }
}

/// Every path answers 200.
#[derive(Default)]
pub struct CountingPathProber {
    calls: AtomicUsize,
}

impl CountingPathProber {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PathProber for CountingPathProber {
    async fn probe(&self, _proxy_url: &str, _policy: &EgressPolicy) -> Result<u16, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(200)
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}
