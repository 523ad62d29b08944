//! Versioned key/value configuration shared by every process of a deployment.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(thiserror::Error, Debug)]
pub enum ConfigSourceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// When the shared config last changed. `None` if there is nothing stored.
    async fn config_version(&self) -> Result<Option<SystemTime>, ConfigSourceError>;

    /// All stored entries, in stored order.
    async fn load_config(&self) -> Result<Vec<(String, String)>, ConfigSourceError>;
}

/// A YAML map on disk. The version is the file's modification time.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigSource { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn config_version(&self) -> Result<Option<SystemTime>, ConfigSourceError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Ok(Some(metadata.modified()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_config(&self) -> Result<Vec<(String, String)>, ConfigSourceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let map: IndexMap<String, serde_yaml::Value> = serde_yaml::from_str(&contents)?;
        Ok(map
            .into_iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key, v)))
            .collect())
    }
}

/// Entries are stored as strings, the way a database column would hold them.
fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    use serde_yaml::Value;
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s),
        Value::Sequence(items) => Some(
            items
                .into_iter()
                .filter_map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Mapping(_) | Value::Tagged(_) => None,
    }
}

#[derive(Default)]
struct InMemoryEntries {
    entries: IndexMap<String, String>,
    version: Option<SystemTime>,
}

/// Settable source for single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryConfigSource {
    inner: Mutex<InMemoryEntries>,
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entry and moves the version to `updated_at`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>, updated_at: SystemTime) {
        let mut inner = self.inner.lock();
        inner.entries.insert(key.into(), value.into());
        inner.version = Some(inner.version.map_or(updated_at, |v| v.max(updated_at)));
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn config_version(&self) -> Result<Option<SystemTime>, ConfigSourceError> {
        Ok(self.inner.lock().version)
    }

    async fn load_config(&self) -> Result<Vec<(String, String)>, ConfigSourceError> {
        Ok(self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
