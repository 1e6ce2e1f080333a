// Configuration persistence backends

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, error, warn};

use super::Configuration;

/// Load/save contract for the configuration record.
///
/// `load` never fails the caller; any read or parse problem yields defaults.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Configuration;
    async fn save(&self, config: &Configuration) -> bool;
}

/// JSON file store
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    /// Store backed by the JSON file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the JSON record
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, body: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn load(&self) -> Configuration {
        let body = match fs::read_to_string(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted configuration, using defaults");
                return Configuration::default();
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read configuration");
                return Configuration::default();
            }
        };

        match serde_json::from_str::<Value>(&body) {
            Ok(overrides) => Configuration::from_override(&overrides),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse configuration, using defaults");
                Configuration::default()
            }
        }
    }

    async fn save(&self, config: &Configuration) -> bool {
        let body = match serde_json::to_string_pretty(config) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize configuration");
                return false;
            }
        };

        match self.write(&body).await {
            Ok(()) => true,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to save configuration");
                false
            }
        }
    }
}

/// In-memory store; keeps the serialised form so loads go through the same merge
#[derive(Default)]
pub struct MemoryConfigStore {
    persisted: Mutex<Option<Value>>,
}

impl MemoryConfigStore {
    /// Empty store; loads return defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a raw persisted record
    pub fn with_raw(raw: Value) -> Self {
        Self {
            persisted: Mutex::new(Some(raw)),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Configuration {
        match self.persisted.lock().as_ref() {
            Some(raw) => Configuration::from_override(raw),
            None => Configuration::default(),
        }
    }

    async fn save(&self, config: &Configuration) -> bool {
        *self.persisted.lock() = Some(config.to_value());
        true
    }
}
