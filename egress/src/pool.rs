use crate::config::{EgressPolicy, ProxyStrategy};
use crate::mask::mask_proxy_url;
use crate::metrics_defs::{PATH_COOLDOWN, PATH_EXHAUSTED, PATH_SELECTED};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::backoff::{compute_backoff, extend_deadline, remaining_seconds};
use shared::counter;
use std::time::SystemTime;

#[derive(Clone, Debug, Default, PartialEq)]
struct PathState {
    cooldown_until: Option<SystemTime>,
    fail_streak: u32,
    last_error: Option<String>,
}

impl PathState {
    fn is_available(&self, now: SystemTime) -> bool {
        self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// One row of [`EgressPool::snapshot`]. The path is always masked.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PathSnapshot {
    pub proxy: String,
    pub is_available: bool,
    pub cooldown_seconds: u64,
    pub fail_streak: u32,
    pub last_error: Option<String>,
}

/// Process-local registry of egress paths.
///
/// The path list follows the policy passed to each call. When it changes the
/// registry is rebuilt in configured order; paths that survive the change keep
/// their state.
#[derive(Default)]
pub struct EgressPool {
    paths: Mutex<IndexMap<String, PathState>>,
}

impl EgressPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn sync(paths: &mut IndexMap<String, PathState>, policy: &EgressPolicy) {
        let configured = policy.proxies();
        if paths.len() == configured.len() && paths.keys().eq(configured.iter()) {
            return;
        }

        let mut previous = std::mem::take(paths);
        for url in configured {
            let state = previous.swap_remove(&url).unwrap_or_default();
            paths.insert(url, state);
        }
        tracing::info!(paths = paths.len(), "Rebuilt egress path registry");
    }

    /// Picks the path for a user, or `None` to go direct. `None` is not an error:
    /// the pool may be disabled or every path may be cooling down.
    pub fn select_for_user(
        &self,
        user_id: u64,
        policy: &EgressPolicy,
        now: SystemTime,
    ) -> Option<String> {
        if !policy.pool_enabled() {
            return None;
        }

        let mut paths = self.paths.lock();
        Self::sync(&mut paths, policy);

        let available: Vec<&String> = paths
            .iter()
            .filter(|(_, state)| state.is_available(now))
            .map(|(url, _)| url)
            .collect();

        if available.is_empty() {
            counter!(PATH_EXHAUSTED).increment(1);
            tracing::debug!(user_id, "All egress paths cooling down, going direct");
            return None;
        }

        let key = match policy.upstream_proxy_strategy {
            ProxyStrategy::Sticky => format!("{user_id}:{}", policy.upstream_proxy_sticky_salt),
            ProxyStrategy::UserHash => user_id.to_string(),
        };
        let index = hash_index(&key, available.len());

        counter!(PATH_SELECTED).increment(1);
        Some(available[index].clone())
    }

    /// Feeds the outcome of a call made through `url` back into its health.
    ///
    /// `status` is `None` for a network-level error. Unknown paths and a
    /// disabled pool are ignored.
    pub fn report_result(
        &self,
        url: &str,
        status: Option<u16>,
        error: Option<&str>,
        policy: &EgressPolicy,
        now: SystemTime,
    ) {
        if !policy.pool_enabled() {
            return;
        }

        let mut paths = self.paths.lock();
        Self::sync(&mut paths, policy);
        let Some(state) = paths.get_mut(url) else {
            return;
        };

        if status.is_some_and(|code| code < 500 && code != 429) {
            state.fail_streak = 0;
            state.last_error = None;
            return;
        }

        if !policy.handles(status) {
            return;
        }

        state.fail_streak = (state.fail_streak + 1).min(policy.fail_streak_cap());
        state.last_error = Some(match (error, status) {
            (Some(error), _) => error.to_string(),
            (None, Some(code)) => format!("HTTP {code}"),
            (None, None) => "unknown error".to_string(),
        });

        if state.fail_streak < policy.failure_threshold() {
            return;
        }

        let seconds = compute_backoff(
            policy.cooldown_base(status),
            state.fail_streak,
            policy.upstream_proxy_max_cooldown_seconds,
        );
        state.cooldown_until = extend_deadline(state.cooldown_until, now, seconds);

        let class = match status {
            Some(429) => "429",
            Some(code) if code >= 500 => "5xx",
            None => "error",
            Some(_) => "other",
        };
        counter!(PATH_COOLDOWN, "class" => class).increment(1);
        tracing::warn!(
            proxy = %mask_proxy_url(url),
            fail_streak = state.fail_streak,
            cooldown_seconds = seconds,
            class,
            "Egress path cooling down"
        );
    }

    /// Configured paths for the current policy, in order. Empty when disabled.
    pub fn paths(&self, policy: &EgressPolicy) -> Vec<String> {
        if !policy.pool_enabled() {
            return Vec::new();
        }
        let mut paths = self.paths.lock();
        Self::sync(&mut paths, policy);
        paths.keys().cloned().collect()
    }

    pub fn snapshot(&self, policy: &EgressPolicy, now: SystemTime) -> Vec<PathSnapshot> {
        if !policy.pool_enabled() {
            return Vec::new();
        }

        let mut paths = self.paths.lock();
        Self::sync(&mut paths, policy);
        paths
            .iter()
            .map(|(url, state)| PathSnapshot {
                proxy: mask_proxy_url(url),
                is_available: state.is_available(now),
                cooldown_seconds: remaining_seconds(state.cooldown_until, now),
                fail_streak: state.fail_streak,
                last_error: state.last_error.clone(),
            })
            .collect()
    }
}

/// First four bytes of SHA-256 as a big-endian integer, modulo `len`.
fn hash_index(key: &str, len: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix as usize % len
}
