//! Local backup inventory
//!
//! Archives live in three fixed category directories under the storage
//! root. Nothing here is persisted: every call rescans the filesystem.

mod delete;

pub use delete::DeleteError;

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::config::RetentionWindows;

/// File suffix of a backup archive
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Errors raised while scanning the storage root
#[derive(Error, Debug)]
pub enum InventoryError {
    /// A directory or file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// Path being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Retention category, one directory per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupCategory {
    /// Kept for the daily window
    Daily,
    /// Kept for the weekly window
    Weekly,
    /// Kept for the monthly window
    Monthly,
}

impl BackupCategory {
    /// Every category, in scan order
    pub const ALL: [BackupCategory; 3] = [BackupCategory::Daily, BackupCategory::Weekly, BackupCategory::Monthly];

    /// Subdirectory name under the storage root
    pub fn dir_name(self) -> &'static str {
        match self {
            BackupCategory::Daily => "daily",
            BackupCategory::Weekly => "weekly",
            BackupCategory::Monthly => "monthly",
        }
    }
}

impl fmt::Display for BackupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for BackupCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupCategory::ALL
            .into_iter()
            .find(|c| c.dir_name() == s)
            .ok_or_else(|| format!("unknown backup category '{s}'"))
    }
}

/// One archive on local storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArtifact {
    /// File name without directory
    pub filename: String,
    /// Category directory it was found in
    pub category: BackupCategory,
    /// Size on disk
    pub size_bytes: u64,
    /// File modification time
    pub created_at: DateTime<Utc>,
    /// Absolute path, valid input to delete
    pub path: PathBuf,
}

impl BackupArtifact {
    /// Age relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }
}

/// Scans, reports on and deletes archives under one storage root
#[derive(Debug, Clone)]
pub struct BackupInventory {
    root: PathBuf,
}

impl BackupInventory {
    /// Inventory over the storage root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All archives, newest first; ties ordered by filename
    pub async fn list(&self) -> Result<Vec<BackupArtifact>, InventoryError> {
        let mut artifacts = Vec::new();

        for category in BackupCategory::ALL {
            let dir = self.root.join(category.dir_name());
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(dir = %dir.display(), "Category directory missing, skipping");
                    continue;
                }
                Err(source) => return Err(InventoryError::Io { path: dir, source }),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| InventoryError::Io { path: dir.clone(), source })?
            {
                let filename = entry.file_name().to_string_lossy().into_owned();
                if !filename.ends_with(ARCHIVE_EXTENSION) {
                    continue;
                }

                let path = entry.path();
                let metadata = match fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    // Removed between readdir and stat
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(source) => return Err(InventoryError::Io { path, source }),
                };
                if !metadata.is_file() {
                    continue;
                }

                let created_at: DateTime<Utc> = metadata.modified().unwrap_or(UNIX_EPOCH).into();
                artifacts.push(BackupArtifact {
                    filename,
                    category,
                    size_bytes: metadata.len(),
                    created_at,
                    path,
                });
            }
        }

        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.filename.cmp(&b.filename))
        });

        debug!(root = %self.root.display(), count = artifacts.len(), "Listed local backups");
        Ok(artifacts)
    }

    /// Archives older than their category's retention window
    pub async fn expired(
        &self,
        windows: &RetentionWindows,
        now: DateTime<Utc>,
    ) -> Result<Vec<BackupArtifact>, InventoryError> {
        let expired: Vec<BackupArtifact> = self
            .list()
            .await?
            .into_iter()
            .filter(|artifact| artifact.age(now) > Duration::days(i64::from(windows.days_for(artifact.category))))
            .collect();

        info!(count = expired.len(), "Computed retention report");
        Ok(expired)
    }

    /// Remove one archive. `path` must resolve inside the storage root.
    pub async fn delete(&self, path: &Path) -> Result<(), DeleteError> {
        delete::delete_within(&self.root, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip() {
        for category in BackupCategory::ALL {
            assert_eq!(category.dir_name().parse::<BackupCategory>(), Ok(category));
        }
        assert!("yearly".parse::<BackupCategory>().is_err());
    }

    #[test]
    fn test_category_serializes_lowercase() {
        assert_eq!(serde_json::to_value(BackupCategory::Weekly).unwrap(), serde_json::json!("weekly"));
    }

    #[tokio::test]
    async fn test_missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = BackupInventory::new(dir.path().join("fresh-install"));
        assert!(inventory.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ignores_other_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let daily = dir.path().join("daily");
        std::fs::create_dir_all(daily.join("nested.tar.gz")).unwrap();
        std::fs::write(daily.join("notes.txt"), "x").unwrap();
        std::fs::write(daily.join("site-2024-01-01.tar.gz"), "abc").unwrap();

        let artifacts = BackupInventory::new(dir.path()).list().await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "site-2024-01-01.tar.gz");
        assert_eq!(artifacts[0].category, BackupCategory::Daily);
        assert_eq!(artifacts[0].size_bytes, 3);
    }
}
