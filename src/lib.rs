//! # backup-sync
//!
//! Configures and verifies unattended, passwordless SSH access from a backup
//! host to a remote server, then inventories and prunes the locally synced
//! backup archives.
//!
//! ## Overview
//!
//! The interesting part of the system is the trust bootstrap: a one-time,
//! password-authenticated install of a freshly generated Ed25519 identity on
//! the remote account, followed by an independent key-only verification.
//! Everything that touches the outside world goes through a
//! [`process::ProcessRunner`], so the orchestration can be driven by a fake
//! runner in tests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use backup_sync::config::JsonConfigStore;
//! use backup_sync::process::{Password, TokioProcessRunner};
//! use backup_sync::service::{BackupSyncService, ServiceSettings};
//!
//! # async fn example() -> backup_sync::Result<()> {
//! let settings = ServiceSettings::new("/data");
//! let store = Arc::new(JsonConfigStore::new(settings.config_path()));
//! let service = BackupSyncService::new(settings, Arc::new(TokioProcessRunner::new()), store);
//!
//! service
//!     .setup_ssh("backup.example.org", 22, "discourse", Password::new("hunter2"))
//!     .await?;
//! service.test_connection().await?;
//! let backups = service.list_backups().await?;
//! println!("{} local backups", backups.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`process`]: external program execution with timeouts
//! - [`config`]: persisted configuration record
//! - [`identity`]: local SSH keypair lifecycle
//! - [`remote`]: trust bootstrap and read-only remote probes
//! - [`inventory`]: local backup listing, retention report and guarded deletion
//! - [`sync`]: manual invocation of the backup-execution script
//! - [`service`]: the single guarded entry point shared by all callers

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for backup-sync operations
pub type Result<T> = std::result::Result<T, BackupSyncError>;

/// Main error type for backup-sync operations
#[derive(Error, Debug)]
pub enum BackupSyncError {
    /// Identity keypair lifecycle error
    #[error("Key error: {0}")]
    Key(#[from] identity::KeyError),

    /// Trust bootstrap error
    #[error("SSH setup error: {0}")]
    Bootstrap(#[from] remote::BootstrapError),

    /// Remote probe error
    #[error("Probe error: {0}")]
    Probe(#[from] remote::ProbeError),

    /// Local inventory scan error
    #[error("Inventory error: {0}")]
    Inventory(#[from] inventory::InventoryError),

    /// Guarded deletion error
    #[error("Delete error: {0}")]
    Delete(#[from] inventory::DeleteError),

    /// Manual sync error
    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Another operation holds the identity; retry once it completes
    #[error("Busy: {0}")]
    Busy(String),

    /// The data directory lock could not be opened or queried
    #[error("Lock error on {}: {source}", path.display())]
    Lock {
        /// Lock file
        path: std::path::PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Local backup listing and guarded deletion
pub mod inventory;

/// Persisted configuration record
pub mod config;

/// Local SSH identity keypair
pub mod identity;

/// Tracing subscriber setup
pub mod logging;

/// External program execution
pub mod process;

/// SSH trust bootstrap and remote probes
pub mod remote;

/// Guarded service facade
pub mod service;

/// Manual backup sync
pub mod sync;
