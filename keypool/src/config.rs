use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_HEALTH_CHECK_URL: &str = "https://api.novelai.net/user/subscription";

/// Selection and failure-handling policy for credentials.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct KeyPoolPolicy {
    /// Minimum spacing between two uses of the same credential.
    pub key_cooldown_seconds: u64,
    /// Apply exponential cooldowns on upstream failures.
    pub dynamic_cooldown_enabled: bool,
    /// Upper bound on any computed cooldown. Zero means uncapped.
    pub cooldown_max_seconds: u64,
    /// Base for 409 and for unclassified 4xx responses.
    pub cooldown_409_base_seconds: u64,
    pub cooldown_429_base_seconds: u64,
    pub cooldown_5xx_base_seconds: u64,
    pub cooldown_402_base_seconds: u64,
    /// Consecutive failures after which a credential becomes unhealthy.
    pub health_check_fail_threshold: u32,
    /// Only select credentials holding `required_tier`.
    pub require_tier: bool,
    pub required_tier: i64,
}

impl Default for KeyPoolPolicy {
    fn default() -> Self {
        KeyPoolPolicy {
            key_cooldown_seconds: 3,
            dynamic_cooldown_enabled: true,
            cooldown_max_seconds: 300,
            cooldown_409_base_seconds: 3,
            cooldown_429_base_seconds: 8,
            cooldown_5xx_base_seconds: 15,
            cooldown_402_base_seconds: 60,
            health_check_fail_threshold: 3,
            require_tier: true,
            required_tier: 3,
        }
    }
}

impl KeyPoolPolicy {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_secs(self.key_cooldown_seconds)
    }

    pub fn fail_threshold(&self) -> u32 {
        self.health_check_fail_threshold.max(1)
    }

    pub fn tier_requirement(&self) -> Option<i64> {
        self.require_tier.then_some(self.required_tier)
    }
}

/// Per-user request quota policy, in requests per minute.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Derive quotas from contributed credentials. When off, `manual_global_rpm` applies.
    pub auto_quota_enabled: bool,
    pub base_rpm: i64,
    pub per_key_rpm: i64,
    /// Zero or negative means uncapped.
    pub max_rpm: i64,
    /// Users who have not contributed an enabled credential get no base allowance.
    pub base_rpm_contributor_only: bool,
    pub manual_global_rpm: i64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy {
            auto_quota_enabled: true,
            base_rpm: 0,
            per_key_rpm: 10,
            max_rpm: 120,
            base_rpm_contributor_only: true,
            manual_global_rpm: 0,
        }
    }
}

/// Settings for the periodic credential probe.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckPolicy {
    /// Unset means the provider's subscription endpoint.
    pub health_check_url: Option<Url>,
    pub health_check_timeout_seconds: u64,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        HealthCheckPolicy {
            health_check_url: None,
            health_check_timeout_seconds: 15,
        }
    }
}

impl HealthCheckPolicy {
    pub fn health_check_url(&self) -> Result<Url, url::ParseError> {
        match &self.health_check_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(DEFAULT_HEALTH_CHECK_URL),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds.max(1))
    }
}
