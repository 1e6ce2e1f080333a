//! Persisted configuration record
//!
//! The record is a fixed set of keys. A persisted override is merged onto
//! the defaults key by key: unknown keys and keys with the wrong value type
//! are dropped, so every default is present even for an empty or partial
//! override.

mod store;

pub use store::{ConfigStore, JsonConfigStore, MemoryConfigStore};

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::inventory::BackupCategory;

lazy_static! {
    static ref CRON_FIELD: Regex = Regex::new(r"^[0-9A-Za-z*/,?\-]+$").expect("static regex");
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Rejected by validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The store could not write the record
    #[error("Failed to persist configuration")]
    SaveFailed,
}

/// Where to pull backups from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Remote hostname or address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Remote account
    pub user: String,
    /// Directory holding the remote archives
    pub remote_backup_path: String,
}

impl RemoteTarget {
    /// `user@host` as understood by ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// True when both host and user are set
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && !self.user.trim().is_empty()
    }
}

/// Retention window per backup category, in days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionWindows {
    /// Days a daily archive is kept
    pub daily_days: u32,
    /// Days a weekly archive is kept
    pub weekly_days: u32,
    /// Days a monthly archive is kept
    pub monthly_days: u32,
}

impl RetentionWindows {
    /// Window for one category
    pub fn days_for(&self, category: BackupCategory) -> u32 {
        match category {
            BackupCategory::Daily => self.daily_days,
            BackupCategory::Weekly => self.weekly_days,
            BackupCategory::Monthly => self.monthly_days,
        }
    }
}

/// The configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Remote hostname, empty until configured
    pub remote_host: String,
    /// Remote account, empty until configured
    pub remote_user: String,
    /// Remote SSH port
    pub remote_port: u16,
    /// Directory holding the remote archives
    pub remote_backup_path: String,
    /// Local root with daily/weekly/monthly subdirectories
    pub backup_storage_path: PathBuf,
    /// Days a daily archive is kept
    pub daily_retention_days: u32,
    /// Days a weekly archive is kept
    pub weekly_retention_days: u32,
    /// Days a monthly archive is kept
    pub monthly_retention_days: u32,
    /// Five-field cron expression for the scheduled sync
    pub schedule: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_user: String::new(),
            remote_port: 22,
            remote_backup_path: "/var/lib/docker/volumes/discourse_data/_data/backups/default"
                .to_string(),
            backup_storage_path: PathBuf::from("/backup/discourse"),
            daily_retention_days: 7,
            weekly_retention_days: 90,
            monthly_retention_days: 730,
            schedule: "0 3 * * *".to_string(),
        }
    }
}

impl Configuration {
    /// Merge a persisted override onto the defaults.
    ///
    /// Never fails: a non-object override yields the defaults, and each key
    /// is accepted only if it is recognised and its value has the right type.
    pub fn from_override(overrides: &Value) -> Self {
        let defaults = Self::default();
        let Some(overrides) = overrides.as_object() else {
            warn!("Persisted configuration is not a JSON object, using defaults");
            return defaults;
        };

        let mut merged = match serde_json::to_value(&defaults) {
            Ok(Value::Object(map)) => map,
            _ => return defaults,
        };

        for (key, value) in overrides {
            if !merged.contains_key(key) {
                continue;
            }
            let mut candidate = merged.clone();
            candidate.insert(key.clone(), value.clone());
            if serde_json::from_value::<Self>(Value::Object(candidate.clone())).is_ok() {
                merged = candidate;
            } else {
                warn!(key = %key, "Ignoring configuration value with unexpected type");
            }
        }

        serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
    }

    /// Serialised form written to disk
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Remote target fields as one value
    pub fn remote_target(&self) -> RemoteTarget {
        RemoteTarget {
            host: self.remote_host.clone(),
            port: self.remote_port,
            user: self.remote_user.clone(),
            remote_backup_path: self.remote_backup_path.clone(),
        }
    }

    /// Record the connection fields of a bootstrap attempt
    pub fn set_remote(&mut self, host: &str, port: u16, user: &str) {
        self.remote_host = host.to_string();
        self.remote_port = port;
        self.remote_user = user.to_string();
    }

    /// Retention windows by category
    pub fn retention(&self) -> RetentionWindows {
        RetentionWindows {
            daily_days: self.daily_retention_days,
            weekly_days: self.weekly_retention_days,
            monthly_days: self.monthly_retention_days,
        }
    }

    /// Check field-level constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_port == 0 {
            return Err(ConfigError::Invalid("remote_port must be between 1 and 65535".into()));
        }
        if self.backup_storage_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("backup_storage_path must not be empty".into()));
        }
        if !self.backup_storage_path.is_absolute() {
            return Err(ConfigError::Invalid("backup_storage_path must be absolute".into()));
        }
        for (name, days) in [
            ("daily_retention_days", self.daily_retention_days),
            ("weekly_retention_days", self.weekly_retention_days),
            ("monthly_retention_days", self.monthly_retention_days),
        ] {
            if days == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        let fields: Vec<&str> = self.schedule.split_whitespace().collect();
        if fields.len() != 5 || !fields.iter().all(|f| CRON_FIELD.is_match(f)) {
            return Err(ConfigError::Invalid(format!(
                "schedule '{}' is not a five-field cron expression",
                self.schedule
            )));
        }
        Ok(())
    }

    /// Overlay the keys present in `patch`
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(v) = patch.remote_host {
            self.remote_host = v;
        }
        if let Some(v) = patch.remote_user {
            self.remote_user = v;
        }
        if let Some(v) = patch.remote_port {
            self.remote_port = v;
        }
        if let Some(v) = patch.remote_backup_path {
            self.remote_backup_path = v;
        }
        if let Some(v) = patch.backup_storage_path {
            self.backup_storage_path = v;
        }
        if let Some(v) = patch.daily_retention_days {
            self.daily_retention_days = v;
        }
        if let Some(v) = patch.weekly_retention_days {
            self.weekly_retention_days = v;
        }
        if let Some(v) = patch.monthly_retention_days {
            self.monthly_retention_days = v;
        }
        if let Some(v) = patch.schedule {
            self.schedule = v;
        }
    }
}

/// Partial update of the recognised keys; anything else is ignored
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    /// Replaces the field of the same name when set
    pub remote_host: Option<String>,
    /// Replaces the field of the same name when set
    pub remote_user: Option<String>,
    /// Replaces the field of the same name when set
    pub remote_port: Option<u16>,
    /// Replaces the field of the same name when set
    pub remote_backup_path: Option<String>,
    /// Replaces the field of the same name when set
    pub backup_storage_path: Option<PathBuf>,
    /// Replaces the field of the same name when set
    pub daily_retention_days: Option<u32>,
    /// Replaces the field of the same name when set
    pub weekly_retention_days: Option<u32>,
    /// Replaces the field of the same name when set
    pub monthly_retention_days: Option<u32>,
    /// Replaces the field of the same name when set
    pub schedule: Option<String>,
}

impl ConfigPatch {
    /// True if no key is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_empty_override_yields_defaults() {
        assert_eq!(Configuration::from_override(&json!({})), Configuration::default());
        assert_eq!(Configuration::from_override(&json!([1, 2])), Configuration::default());
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config = Configuration::from_override(&json!({
            "remote_host": "forum.example.org",
            "remote_port": 2222,
        }));

        assert_eq!(config.remote_host, "forum.example.org");
        assert_eq!(config.remote_port, 2222);
        assert_eq!(config.daily_retention_days, 7);
        assert_eq!(config.schedule, "0 3 * * *");
    }

    #[test]
    fn test_unknown_and_mistyped_keys_are_dropped() {
        let config = Configuration::from_override(&json!({
            "remote_user": "discourse",
            "remote_port": "not-a-port",
            "ssh_configured": true,
            "favourite_colour": "green",
        }));

        assert_eq!(config.remote_user, "discourse");
        assert_eq!(config.remote_port, 22);
        let value = config.to_value();
        assert!(value.get("ssh_configured").is_none());
        assert!(value.get("favourite_colour").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Configuration::default();
        assert!(config.validate().is_ok());

        config.schedule = "every night".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Configuration::default();
        config.remote_port = 0;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.weekly_retention_days = 0;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.backup_storage_path = PathBuf::from("relative/backups");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_patch_ignores_unknown_keys() {
        let patch: ConfigPatch = serde_json::from_value(json!({
            "schedule": "30 2 * * 1",
            "password": "never stored",
        }))
        .unwrap();

        let mut config = Configuration::default();
        config.apply(patch);
        assert_eq!(config.schedule, "30 2 * * 1");
        assert_eq!(config.remote_host, "");
    }

    #[test]
    fn test_retention_lookup() {
        let windows = Configuration::default().retention();
        assert_eq!(windows.days_for(BackupCategory::Daily), 7);
        assert_eq!(windows.days_for(BackupCategory::Weekly), 90);
        assert_eq!(windows.days_for(BackupCategory::Monthly), 730);
    }
}
