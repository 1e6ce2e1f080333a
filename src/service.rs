//! Guarded service facade
//!
//! One [`BackupSyncService`] per process. The identity files, the trust
//! tracker and the configuration record form a single exclusion domain:
//!
//! - identity-mutating operations (`setup_ssh`, `reset_ssh`,
//!   `regenerate_key`, `update_config`) take it exclusively;
//! - operations that rely on an installed key (`test_connection`,
//!   `test_backup_path`, `manual_sync`) take it shared;
//! - local inventory and status reads do not take it.
//!
//! The domain is an in-process `RwLock` paired with an advisory `flock` on
//! `<data_dir>/.lock`, so separate processes sharing a data directory
//! exclude each other the same way. Contention is never waited out: a call
//! that cannot acquire both immediately fails with [`BackupSyncError::Busy`].

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::config::{ConfigError, ConfigPatch, ConfigStore, Configuration};
use crate::identity::{IdentityPaths, KeyManager};
use crate::inventory::{BackupArtifact, BackupInventory};
use crate::process::{Password, ProcessRunner};
use crate::remote::{
    BootstrapReport, BootstrapRequest, BootstrapSettings, ProbeError, ProbeSettings, RemoteProbe, TrustBootstrap,
    TrustState, TrustTracker,
};
use crate::sync::{SyncOutput, SyncTrigger, DEFAULT_SYNC_PROGRAM, DEFAULT_SYNC_TIMEOUT};
use crate::{BackupSyncError, Result};

/// Runtime settings that are not part of the persisted record
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Holds the identity, known_hosts and config.json
    pub data_dir: PathBuf,
    /// Backup-execution script
    pub sync_program: PathBuf,
    /// Limit on one sync run
    pub sync_timeout: Duration,
    /// Bootstrap step timeouts
    pub bootstrap: BootstrapSettings,
    /// Probe timeouts
    pub probe: ProbeSettings,
}

impl ServiceSettings {
    /// Defaults for the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_program: PathBuf::from(DEFAULT_SYNC_PROGRAM),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            bootstrap: BootstrapSettings::default(),
            probe: ProbeSettings::default(),
        }
    }

    /// Persisted configuration record
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Identity and known_hosts locations
    pub fn identity_paths(&self) -> IdentityPaths {
        IdentityPaths::in_dir(&self.data_dir)
    }

    /// Last recorded trust outcome
    pub fn trust_path(&self) -> PathBuf {
        self.data_dir.join("trust.json")
    }

    /// Advisory lock file for the exclusion domain
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(".lock")
    }
}

/// Held for the duration of a guarded operation; dropping it releases both
/// the in-process guard and the file lock.
struct DomainGuard<G> {
    _local: G,
    _file: File,
}

/// Snapshot reported to operators
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Identity present on disk
    pub ssh_configured: bool,
    /// Derived trust
    pub trust_state: TrustState,
    /// Persisted configuration
    pub configuration: Configuration,
}

/// Entry point shared by every caller
pub struct BackupSyncService {
    store: Arc<dyn ConfigStore>,
    keys: KeyManager,
    tracker: Arc<TrustTracker>,
    bootstrap: TrustBootstrap,
    probe: RemoteProbe,
    sync: SyncTrigger,
    identity_lock: RwLock<()>,
    data_dir: PathBuf,
    lock_path: PathBuf,
}

impl BackupSyncService {
    /// Build the service and its components
    pub fn new(settings: ServiceSettings, runner: Arc<dyn ProcessRunner>, store: Arc<dyn ConfigStore>) -> Self {
        let paths = settings.identity_paths();
        let keys = KeyManager::new(paths.clone(), runner.clone());
        let tracker = Arc::new(TrustTracker::persistent(settings.trust_path()));
        let bootstrap = TrustBootstrap::new(
            keys.clone(),
            runner.clone(),
            tracker.clone(),
            store.clone(),
            settings.bootstrap.clone(),
        );
        let probe = RemoteProbe::new(runner.clone(), paths.clone(), settings.probe.clone());
        let sync = SyncTrigger::new(runner, settings.sync_program.clone(), paths.private_key)
            .with_timeout(settings.sync_timeout);

        Self {
            store,
            keys,
            tracker,
            bootstrap,
            probe,
            sync,
            identity_lock: RwLock::new(()),
            lock_path: settings.lock_path(),
            data_dir: settings.data_dir,
        }
    }

    fn exclusive(&self) -> Result<DomainGuard<RwLockWriteGuard<'_, ()>>> {
        const BUSY: &str = "another SSH operation is in progress";
        let local = self
            .identity_lock
            .try_write()
            .map_err(|_| BackupSyncError::Busy(BUSY.into()))?;
        let file = self.open_lock_file()?;
        self.acquired(FileExt::try_lock_exclusive(&file), BUSY)?;
        Ok(DomainGuard {
            _local: local,
            _file: file,
        })
    }

    fn shared(&self) -> Result<DomainGuard<RwLockReadGuard<'_, ()>>> {
        const BUSY: &str = "SSH setup is in progress";
        let local = self
            .identity_lock
            .try_read()
            .map_err(|_| BackupSyncError::Busy(BUSY.into()))?;
        let file = self.open_lock_file()?;
        self.acquired(FileExt::try_lock_shared(&file), BUSY)?;
        Ok(DomainGuard {
            _local: local,
            _file: file,
        })
    }

    fn open_lock_file(&self) -> Result<File> {
        let lock_error = |source| BackupSyncError::Lock {
            path: self.lock_path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.data_dir).map_err(lock_error)?;
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(lock_error)
    }

    fn acquired(&self, attempt: std::io::Result<()>, busy: &str) -> Result<()> {
        match attempt {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == fs2::lock_contended_error().kind() => {
                debug!(path = %self.lock_path.display(), "Exclusion domain held by another process");
                Err(BackupSyncError::Busy(busy.into()))
            }
            Err(source) => Err(BackupSyncError::Lock {
                path: self.lock_path.clone(),
                source,
            }),
        }
    }

    /// Bootstrap passwordless trust with the remote account
    pub async fn setup_ssh(&self, host: &str, port: u16, user: &str, password: Password) -> Result<BootstrapReport> {
        let _guard = self.exclusive()?;
        let request = BootstrapRequest {
            host: host.trim().to_string(),
            port,
            user: user.trim().to_string(),
            password,
        };
        Ok(self.bootstrap.run(request).await?)
    }

    /// Delete the identity and forget any recorded trust
    pub async fn reset_ssh(&self) -> Result<()> {
        let _guard = self.exclusive()?;
        self.keys.reset().await?;
        self.tracker.clear();
        Ok(())
    }

    /// Replace the identity; previously installed trust no longer applies
    pub async fn regenerate_key(&self) -> Result<()> {
        let _guard = self.exclusive()?;
        if let Err(e) = self.keys.generate().await {
            self.tracker.clear();
            return Err(e.into());
        }
        self.tracker.transition(TrustState::IdentityGenerated);
        Ok(())
    }

    /// Key-only connectivity check; the outcome becomes the recorded trust
    pub async fn test_connection(&self) -> Result<()> {
        let _guard = self.shared()?;
        let target = self.store.load().await.remote_target();
        match self.probe.test_connection(&target).await {
            Ok(()) => {
                self.tracker.transition(TrustState::Verified);
                Ok(())
            }
            Err(e) => {
                if let ProbeError::Connection(diagnostic) = &e {
                    self.tracker.transition(TrustState::Failed(diagnostic.clone()));
                }
                Err(e.into())
            }
        }
    }

    /// Recent archives in the configured remote backup path
    pub async fn test_backup_path(&self) -> Result<Vec<String>> {
        let _guard = self.shared()?;
        let target = self.store.load().await.remote_target();
        Ok(self.probe.test_backup_path(&target, &target.remote_backup_path).await?)
    }

    /// Run the backup-execution script now
    pub async fn manual_sync(&self) -> Result<SyncOutput> {
        let _guard = self.shared()?;
        Ok(self.sync.run().await?)
    }

    async fn inventory(&self) -> BackupInventory {
        BackupInventory::new(self.store.load().await.backup_storage_path)
    }

    /// Local archives, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupArtifact>> {
        Ok(self.inventory().await.list().await?)
    }

    /// Archives past their category's retention window
    pub async fn expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<BackupArtifact>> {
        let config = self.store.load().await;
        let inventory = BackupInventory::new(&config.backup_storage_path);
        Ok(inventory.expired(&config.retention(), now).await?)
    }

    /// Delete one archive inside the storage root
    pub async fn delete_backup(&self, path: &Path) -> Result<()> {
        Ok(self.inventory().await.delete(path).await?)
    }

    /// Current configuration record
    pub async fn configuration(&self) -> Configuration {
        self.store.load().await
    }

    /// Validate and persist a partial configuration update
    pub async fn update_config(&self, patch: ConfigPatch) -> Result<Configuration> {
        let _guard = self.exclusive()?;
        let mut config = self.store.load().await;
        config.apply(patch);
        config.validate()?;
        if !self.store.save(&config).await {
            return Err(ConfigError::SaveFailed.into());
        }
        info!("Configuration saved");
        Ok(config)
    }

    /// Identity presence, trust and configuration
    pub async fn status(&self) -> ServiceStatus {
        let ssh_configured = self.keys.exists();
        ServiceStatus {
            ssh_configured,
            trust_state: self.tracker.current(ssh_configured),
            configuration: self.store.load().await,
        }
    }

    /// Public key text to show the operator
    pub async fn public_key(&self) -> Result<String> {
        Ok(self.keys.public_key().await?)
    }
}
