use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

pub type CredentialId = u64;
pub type UserId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    /// Registered but not yet verified by a probe.
    Pending,
    Healthy,
    /// Failed a probe or crossed the failure threshold. Recoverable.
    Unhealthy,
    /// Rejected by the provider. Only the owner re-verifying brings it back.
    Invalid,
}

impl CredentialStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Pending => "pending",
            CredentialStatus::Healthy => "healthy",
            CredentialStatus::Unhealthy => "unhealthy",
            CredentialStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider API key. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Credential {
    pub id: CredentialId,
    pub owner: UserId,
    pub secret: Secret,
    pub status: CredentialStatus,
    /// Entitlement level reported by the provider on the last successful probe.
    pub tier: Option<i64>,
    /// Owner/operator kill switch, independent of `status`.
    pub is_enabled: bool,
    pub fail_streak: u32,
    pub cooldown_until: Option<SystemTime>,
    pub last_used_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub last_checked_at: Option<SystemTime>,
    pub total_requests: u64,
    pub success_requests: u64,
    pub fail_requests: u64,
}

impl Credential {
    pub fn new(id: CredentialId, owner: UserId, secret: Secret) -> Self {
        Credential {
            id,
            owner,
            secret,
            status: CredentialStatus::Pending,
            tier: None,
            is_enabled: true,
            fail_streak: 0,
            cooldown_until: None,
            last_used_at: None,
            last_error: None,
            last_checked_at: None,
            total_requests: 0,
            success_requests: 0,
            fail_requests: 0,
        }
    }

    pub fn in_cooldown(&self, now: SystemTime) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// True if the credential was stamped less than `min_spacing` ago.
    pub fn used_within(&self, min_spacing: Duration, now: SystemTime) -> bool {
        match self.last_used_at {
            Some(used) => now.duration_since(used).is_ok_and(|d| d < min_spacing),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let credential = Credential::new(1, 7, Secret::new("pst-abcdef"));
        let debug = format!("{credential:?}");
        assert!(!debug.contains("pst-abcdef"));
        assert!(debug.contains("Secret(***)"));
        assert_eq!(credential.secret.expose(), "pst-abcdef");
    }

    #[test]
    fn test_cooldown_and_spacing() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let mut credential = Credential::new(1, 7, Secret::new("k"));
        assert!(!credential.in_cooldown(now));
        assert!(!credential.used_within(Duration::from_secs(3), now));

        credential.cooldown_until = Some(now + Duration::from_secs(1));
        assert!(credential.in_cooldown(now));
        // Cooldown ends exactly at the deadline.
        assert!(!credential.in_cooldown(now + Duration::from_secs(1)));

        credential.last_used_at = Some(now - Duration::from_secs(2));
        assert!(credential.used_within(Duration::from_secs(3), now));
        assert!(!credential.used_within(Duration::from_secs(2), now));
    }

    #[test]
    fn test_status_serialization() {
        let status: CredentialStatus = serde_yaml::from_str("unhealthy").unwrap();
        assert_eq!(status, CredentialStatus::Unhealthy);
        assert_eq!(CredentialStatus::Invalid.to_string(), "invalid");
    }
}
