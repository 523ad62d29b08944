use engine::Settings;
use engine::config::ValidationError;
use keypool::{Credential, CredentialId, Secret, UserId};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "keyrelay".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            sentry_dsn: None,
            filter: default_log_filter(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

/// A credential loaded at startup in single-process deployments.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CredentialSeed {
    pub id: CredentialId,
    pub owner: UserId,
    pub secret: Secret,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CredentialSeed {
    /// New credentials start `pending` until their first probe.
    pub fn to_credential(&self) -> Credential {
        let mut credential = Credential::new(self.id, self.owner, self.secret.clone());
        credential.is_enabled = self.enabled;
        credential
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub admin_listener: Option<Listener>,
    /// YAML file holding runtime overrides shared by every process.
    pub shared_config: Option<PathBuf>,
    #[serde(default)]
    pub credentials: Vec<CredentialSeed>,
    #[serde(default)]
    pub policy: Settings,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(listener) = &self.admin_listener {
            if listener.port == 0 {
                return Err(ConfigError::InvalidPort);
            }
        }

        let mut ids = HashSet::new();
        for seed in &self.credentials {
            if !ids.insert(seed.id) {
                return Err(ConfigError::DuplicateCredential(seed.id));
            }
        }

        self.policy.validate()?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid policy: {0}")]
    InvalidPolicy(#[from] ValidationError),
    #[error("Port cannot be 0")]
    InvalidPort,
    #[error("duplicate credential id: {0}")]
    DuplicateCredential(CredentialId),
}
