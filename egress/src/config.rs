use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_KEEPALIVE_URL: &str = "https://api.novelai.net/";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    ProxyPool,
    #[default]
    #[serde(other)]
    Direct,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStrategy {
    #[default]
    Sticky,
    /// Hash of the user alone. Any unrecognised strategy name lands here.
    #[serde(other)]
    UserHash,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EgressPolicy {
    pub upstream_proxy_mode: ProxyMode,
    pub upstream_proxies: Vec<String>,
    pub upstream_proxy_strategy: ProxyStrategy,
    pub upstream_proxy_sticky_salt: String,

    /// Base for failures that match no specific class.
    pub upstream_proxy_cooldown_seconds: u64,
    pub upstream_proxy_max_cooldown_seconds: u64,
    pub upstream_proxy_failure_threshold: u32,
    pub upstream_proxy_fail_streak_cap: u32,

    pub upstream_proxy_handle_429: bool,
    pub upstream_proxy_handle_5xx: bool,
    pub upstream_proxy_handle_network_errors: bool,
    pub upstream_proxy_cooldown_429_seconds: u64,
    pub upstream_proxy_cooldown_5xx_seconds: u64,
    pub upstream_proxy_cooldown_error_seconds: u64,

    /// Unset means the provider's API root.
    pub upstream_proxy_keepalive_url: Option<Url>,
    pub upstream_proxy_keepalive_timeout_seconds: u64,
}

impl Default for EgressPolicy {
    fn default() -> Self {
        EgressPolicy {
            upstream_proxy_mode: ProxyMode::Direct,
            upstream_proxies: Vec::new(),
            upstream_proxy_strategy: ProxyStrategy::Sticky,
            upstream_proxy_sticky_salt: String::new(),
            upstream_proxy_cooldown_seconds: 10,
            upstream_proxy_max_cooldown_seconds: 120,
            upstream_proxy_failure_threshold: 1,
            upstream_proxy_fail_streak_cap: 6,
            upstream_proxy_handle_429: true,
            upstream_proxy_handle_5xx: true,
            upstream_proxy_handle_network_errors: true,
            upstream_proxy_cooldown_429_seconds: 10,
            upstream_proxy_cooldown_5xx_seconds: 15,
            upstream_proxy_cooldown_error_seconds: 10,
            upstream_proxy_keepalive_url: None,
            upstream_proxy_keepalive_timeout_seconds: 8,
        }
    }
}

impl EgressPolicy {
    /// Configured paths, trimmed, without empty entries. A path listed more
    /// than once keeps its first position.
    pub fn proxies(&self) -> Vec<String> {
        self.upstream_proxies
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<IndexSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// The pool is active only in pool mode with at least one path configured.
    pub fn pool_enabled(&self) -> bool {
        self.upstream_proxy_mode == ProxyMode::ProxyPool
            && self.upstream_proxies.iter().any(|p| !p.trim().is_empty())
    }

    pub fn failure_threshold(&self) -> u32 {
        self.upstream_proxy_failure_threshold.max(1)
    }

    pub fn fail_streak_cap(&self) -> u32 {
        self.upstream_proxy_fail_streak_cap.max(1)
    }

    pub fn keepalive_url(&self) -> Result<Url, url::ParseError> {
        match &self.upstream_proxy_keepalive_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(DEFAULT_KEEPALIVE_URL),
        }
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_proxy_keepalive_timeout_seconds)
    }

    /// Cooldown base for a failure class. `None` status is a network error.
    pub fn cooldown_base(&self, status: Option<u16>) -> u64 {
        match status {
            Some(429) => self.upstream_proxy_cooldown_429_seconds,
            Some(code) if code >= 500 => self.upstream_proxy_cooldown_5xx_seconds,
            None => self.upstream_proxy_cooldown_error_seconds,
            Some(_) => self.upstream_proxy_cooldown_seconds,
        }
    }

    /// Whether a failure class is allowed to affect path health at all.
    pub fn handles(&self, status: Option<u16>) -> bool {
        match status {
            Some(429) => self.upstream_proxy_handle_429,
            Some(code) if code >= 500 => self.upstream_proxy_handle_5xx,
            None => self.upstream_proxy_handle_network_errors,
            Some(_) => true,
        }
    }
}
