//! Runtime settings.
//!
//! [`Settings`] is the flat set of tunables every component reads. It is
//! loaded from the static config file and can be overlaid at runtime with
//! `(key, value)` pairs from the shared config store.

use egress::EgressPolicy;
use keypool::config::{AdmissionPolicy, HealthCheckPolicy, KeyPoolPolicy};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Keys the shared store may never change: secrets, process identity, and the
/// refresh mechanism itself.
pub const FORBIDDEN_CONFIG_KEYS: &[&str] = &[
    "secret_key",
    "encryption_key",
    "admin_password",
    "admin_username",
    "database_url",
    "node_id",
    "multi_node_enabled",
    "system_config_refresh_enabled",
    "system_config_refresh_interval_seconds",
    "jwt_algorithm",
    "access_token_expire_minutes",
    "cors_allow_origins",
    "cors_allow_credentials",
    "trust_proxy_headers",
];

pub fn is_config_key_allowed(key: &str) -> bool {
    let key = key.trim();
    !key.is_empty() && !FORBIDDEN_CONFIG_KEYS.contains(&key)
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} must be greater than 0")]
    Zero(&'static str),
}

#[derive(Error, Debug, PartialEq)]
pub enum OverlayError {
    #[error("{0} cannot be changed at runtime")]
    Forbidden(String),
    #[error("unknown setting {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    Uncastable { key: String, reason: String },
}

/// Process identity and background loop policy.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SchedulerPolicy {
    pub node_id: String,
    pub multi_node_enabled: bool,

    pub health_check_enabled: bool,
    pub health_check_interval_seconds: u64,
    pub health_check_leader_only: bool,
    pub health_check_leader_node_id: String,

    pub upstream_proxy_keepalive_enabled: bool,
    pub upstream_proxy_keepalive_interval_seconds: u64,
    pub upstream_proxy_keepalive_leader_only: bool,
    pub upstream_proxy_keepalive_leader_node_id: String,

    pub system_config_refresh_enabled: bool,
    pub system_config_refresh_interval_seconds: u64,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        SchedulerPolicy {
            node_id: "node-1".into(),
            multi_node_enabled: false,
            health_check_enabled: true,
            health_check_interval_seconds: 300,
            health_check_leader_only: false,
            health_check_leader_node_id: "node-1".into(),
            upstream_proxy_keepalive_enabled: false,
            upstream_proxy_keepalive_interval_seconds: 300,
            upstream_proxy_keepalive_leader_only: false,
            upstream_proxy_keepalive_leader_node_id: "node-1".into(),
            system_config_refresh_enabled: true,
            system_config_refresh_interval_seconds: 5,
        }
    }
}

impl SchedulerPolicy {
    /// Leader gating only applies in multi-node deployments. The leader is
    /// configured, not elected.
    fn is_gated_out(&self, leader_only: bool, leader: &str) -> bool {
        self.multi_node_enabled && leader_only && self.node_id != leader
    }

    pub fn should_run_health_check(&self) -> bool {
        self.health_check_enabled
            && !self.is_gated_out(
                self.health_check_leader_only,
                &self.health_check_leader_node_id,
            )
    }

    pub fn should_run_keepalive(&self) -> bool {
        self.upstream_proxy_keepalive_enabled
            && !self.is_gated_out(
                self.upstream_proxy_keepalive_leader_only,
                &self.upstream_proxy_keepalive_leader_node_id,
            )
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.upstream_proxy_keepalive_interval_seconds.max(1))
    }

    pub fn refresh_active(&self) -> bool {
        self.multi_node_enabled && self.system_config_refresh_enabled
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.system_config_refresh_interval_seconds.max(1))
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    #[serde(flatten)]
    pub keys: KeyPoolPolicy,
    #[serde(flatten)]
    pub admission: AdmissionPolicy,
    #[serde(flatten)]
    pub health: HealthCheckPolicy,
    #[serde(flatten)]
    pub egress: EgressPolicy,
    #[serde(flatten)]
    pub scheduler: SchedulerPolicy,
}

/// Result of [`Settings::overlay`].
#[derive(Debug)]
pub struct Overlay {
    pub settings: Settings,
    pub applied: Vec<String>,
    pub skipped: Vec<OverlayError>,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            (
                "health_check_interval_seconds",
                self.scheduler.health_check_interval_seconds,
            ),
            (
                "upstream_proxy_keepalive_interval_seconds",
                self.scheduler.upstream_proxy_keepalive_interval_seconds,
            ),
            (
                "system_config_refresh_interval_seconds",
                self.scheduler.system_config_refresh_interval_seconds,
            ),
            (
                "health_check_timeout_seconds",
                self.health.health_check_timeout_seconds,
            ),
            (
                "upstream_proxy_keepalive_timeout_seconds",
                self.egress.upstream_proxy_keepalive_timeout_seconds,
            ),
            (
                "health_check_fail_threshold",
                u64::from(self.keys.health_check_fail_threshold),
            ),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ValidationError::Zero(*name));
        }

        // A bad entry only fails the calls routed through it.
        for proxy in self.egress.proxies() {
            if url::Url::parse(&proxy).is_err() {
                tracing::warn!(
                    proxy = %egress::mask_proxy_url(&proxy),
                    "Egress path is not a valid URL"
                );
            }
        }

        Ok(())
    }

    /// Applies shared-store entries on top of these settings.
    ///
    /// Values are cast by the type of the current value. Forbidden and unknown
    /// keys are skipped, and a value that does not fit skips only its own key.
    pub fn overlay(&self, entries: &[(String, String)]) -> Overlay {
        let mut overlay = Overlay {
            settings: self.clone(),
            applied: Vec::new(),
            skipped: Vec::new(),
        };

        let mut current = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::error!("Settings do not serialize to a map, overlay skipped");
                return overlay;
            }
        };

        for (key, raw) in entries {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            match apply_entry(&current, key, raw) {
                Ok((map, settings)) => {
                    current = map;
                    overlay.settings = settings;
                    overlay.applied.push(key.to_string());
                }
                Err(error) => {
                    if matches!(error, OverlayError::Uncastable { .. }) {
                        tracing::warn!(error = %error, "Skipping shared config entry");
                    } else {
                        tracing::debug!(error = %error, "Skipping shared config entry");
                    }
                    overlay.skipped.push(error);
                }
            }
        }

        overlay
    }
}

fn apply_entry(
    current: &Map<String, Value>,
    key: &str,
    raw: &str,
) -> Result<(Map<String, Value>, Settings), OverlayError> {
    if !is_config_key_allowed(key) {
        return Err(OverlayError::Forbidden(key.to_string()));
    }
    let existing = current
        .get(key)
        .ok_or_else(|| OverlayError::UnknownKey(key.to_string()))?;

    let uncastable = |reason: String| OverlayError::Uncastable {
        key: key.to_string(),
        reason,
    };

    let value = cast_value(raw, existing).map_err(uncastable)?;
    let mut candidate = current.clone();
    candidate.insert(key.to_string(), value);
    let settings = serde_json::from_value::<Settings>(Value::Object(candidate.clone()))
        .map_err(|e| uncastable(e.to_string()))?;
    Ok((candidate, settings))
}

fn cast_value(raw: &str, current: &Value) -> Result<Value, String> {
    match current {
        Value::Bool(_) => Ok(Value::Bool(matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ))),
        Value::Number(n) if n.is_f64() => raw
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|e| e.to_string()),
        Value::Number(_) => {
            let raw = raw.trim();
            raw.parse::<u64>()
                .map(Value::from)
                .or_else(|_| raw.parse::<i64>().map(Value::from))
                .map_err(|e| e.to_string())
        }
        Value::Array(_) => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        )),
        Value::String(_) | Value::Null => Ok(Value::String(raw.to_string())),
        Value::Object(_) => Err("nested settings cannot be overlaid".to_string()),
    }
}

/// The live settings snapshot.
///
/// Readers hold an `Arc` to a complete snapshot, so a reload never changes
/// settings under an in-flight operation.
pub struct SharedSettings {
    current: RwLock<Arc<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        SharedSettings {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    pub fn replace(&self, settings: Settings) {
        *self.current.write() = Arc::new(settings);
    }
}
