//! Local SSH identity keypair
//!
//! The identity is either absent or present-and-usable. Generation removes
//! both halves first and cleans up after itself on failure, so a stale half
//! is never left behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::process::{CommandSpec, ProcessRunner};

const KEYGEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors related to the identity keypair
#[derive(Error, Debug)]
pub enum KeyError {
    /// ssh-keygen failed or did not produce both files
    #[error("Failed to generate SSH key: {0}")]
    Generation(String),

    /// The private key mode could not be set to 0600
    #[error("Failed to restrict private key permissions: {0}")]
    Permission(String),

    /// No public key to read
    #[error("Public key not found at {}", .0.display())]
    PublicKeyMissing(PathBuf),

    /// Other filesystem failure on the identity files
    #[error("Identity file error: {0}")]
    Io(String),
}

/// Fixed on-disk locations owned by the identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    /// Private half, mode 0600
    pub private_key: PathBuf,
    /// Public half, one OpenSSH line
    pub public_key: PathBuf,
    /// Host keys recorded during bootstrap
    pub known_hosts: PathBuf,
}

impl IdentityPaths {
    /// Standard layout inside a data directory
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            private_key: dir.join("ssh_key"),
            public_key: dir.join("ssh_key.pub"),
            known_hosts: dir.join("known_hosts"),
        }
    }
}

/// Owns generate / exists / reset for the identity keypair
#[derive(Clone)]
pub struct KeyManager {
    paths: IdentityPaths,
    runner: Arc<dyn ProcessRunner>,
    keygen_timeout: Duration,
}

impl KeyManager {
    /// Manager for the identity at `paths`
    pub fn new(paths: IdentityPaths, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            paths,
            runner,
            keygen_timeout: KEYGEN_TIMEOUT,
        }
    }

    /// Identity file locations
    pub fn paths(&self) -> &IdentityPaths {
        &self.paths
    }

    /// True iff the private key file is present.
    ///
    /// The public half is not checked here; a missing public key surfaces
    /// when it is first read.
    pub fn exists(&self) -> bool {
        self.paths.private_key.exists()
    }

    /// Replace the identity with a fresh Ed25519 keypair (empty passphrase)
    pub async fn generate(&self) -> Result<(), KeyError> {
        self.remove_files().await?;

        if let Some(parent) = self.paths.private_key.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| KeyError::Io(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
        }

        let private_key = self.paths.private_key.to_string_lossy().into_owned();
        let spec = CommandSpec::new("ssh-keygen", self.keygen_timeout)
            .args(["-t", "ed25519", "-f"])
            .arg(private_key)
            .args(["-N", "", "-q"]);

        let result = match self.runner.run(spec).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(KeyError::Generation(output.diagnostic())),
            Err(e) => Err(KeyError::Generation(e.to_string())),
        };
        if let Err(e) = result {
            error!(error = %e, "ssh-keygen failed");
            self.discard_partial().await;
            return Err(e);
        }

        if let Err(e) = restrict_permissions(&self.paths.private_key).await {
            error!(path = %self.paths.private_key.display(), error = %e, "Failed to chmod private key");
            self.discard_partial().await;
            return Err(KeyError::Permission(e.to_string()));
        }

        info!(path = %self.paths.private_key.display(), "Generated new SSH identity");
        Ok(())
    }

    /// Delete both halves; a missing file is not an error
    pub async fn reset(&self) -> Result<(), KeyError> {
        self.remove_files().await?;
        info!("SSH identity reset");
        Ok(())
    }

    /// Public key text, trimmed
    pub async fn public_key(&self) -> Result<String, KeyError> {
        match fs::read_to_string(&self.paths.public_key).await {
            Ok(key) => Ok(key.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(KeyError::PublicKeyMissing(self.paths.public_key.clone()))
            }
            Err(e) => Err(KeyError::Io(format!(
                "Failed to read {}: {}",
                self.paths.public_key.display(),
                e
            ))),
        }
    }

    async fn remove_files(&self) -> Result<(), KeyError> {
        for path in [&self.paths.private_key, &self.paths.public_key] {
            match fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed identity file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(KeyError::Io(format!("Failed to remove {}: {}", path.display(), e)))
                }
            }
        }
        Ok(())
    }

    async fn discard_partial(&self) {
        if let Err(e) = self.remove_files().await {
            warn!(error = %e, "Failed to clean up partial identity");
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    fs::metadata(path).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TokioProcessRunner;

    fn manager(dir: &Path) -> KeyManager {
        KeyManager::new(IdentityPaths::in_dir(dir), Arc::new(TokioProcessRunner::new()))
    }

    #[test]
    fn test_paths_layout() {
        let paths = IdentityPaths::in_dir("/data");
        assert_eq!(paths.private_key, PathBuf::from("/data/ssh_key"));
        assert_eq!(paths.public_key, PathBuf::from("/data/ssh_key.pub"));
        assert_eq!(paths.known_hosts, PathBuf::from("/data/known_hosts"));
    }

    #[tokio::test]
    async fn test_exists_tracks_private_key_only() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(dir.path());
        assert!(!keys.exists());

        std::fs::write(dir.path().join("ssh_key.pub"), "ssh-ed25519 AAAA").unwrap();
        assert!(!keys.exists());

        std::fs::write(dir.path().join("ssh_key"), "private").unwrap();
        assert!(keys.exists());
    }

    #[tokio::test]
    async fn test_reset_is_noop_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(dir.path());
        keys.reset().await.expect("reset of absent identity");
        keys.reset().await.expect("second reset");
    }

    #[tokio::test]
    async fn test_reset_removes_both_halves() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ssh_key"), "private").unwrap();
        std::fs::write(dir.path().join("ssh_key.pub"), "public").unwrap();

        let keys = manager(dir.path());
        keys.reset().await.unwrap();
        assert!(!dir.path().join("ssh_key").exists());
        assert!(!dir.path().join("ssh_key.pub").exists());
    }

    #[tokio::test]
    async fn test_public_key_missing() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(dir.path());
        assert!(matches!(keys.public_key().await, Err(KeyError::PublicKeyMissing(_))));
    }
}
