// Trust bootstrap - one-time password-authenticated key install plus
// independent key-only verification

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{key_auth_options, quote, ssh_options, validate_target, HostKeyPolicy, TrustState, TrustTracker};
use crate::config::ConfigStore;
use crate::identity::{KeyError, KeyManager};
use crate::process::{CommandSpec, Password, ProcessError, ProcessRunner};

/// Printed by the remote install command when every step ran
pub const INSTALL_SENTINEL: &str = "Key added successfully";

/// Errors that abort a bootstrap
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Host, user, port or password rejected before anything ran
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Identity could not be generated or read
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Password-authenticated install failed
    #[error("Failed to copy SSH key: {0}")]
    KeyInstall(String),

    /// Key-only verification failed after install
    #[error("Key was copied but test connection failed: {0}")]
    TrustVerification(String),
}

/// Step timeouts and the settling pause
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// Limit on ssh-keyscan
    pub keyscan_timeout: Duration,
    /// Limit on the sshpass install
    pub install_timeout: Duration,
    /// Pause between install and verification
    pub settle_delay: Duration,
    /// ssh `ConnectTimeout` for the verification connection
    pub verify_connect_timeout: Duration,
    /// Hard limit on the verification ssh process
    pub verify_timeout: Duration,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            keyscan_timeout: Duration::from_secs(10),
            install_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(2),
            verify_connect_timeout: Duration::from_secs(10),
            verify_timeout: Duration::from_secs(15),
        }
    }
}

/// Operator input for one bootstrap
#[derive(Debug)]
pub struct BootstrapRequest {
    /// Remote hostname or address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Remote account
    pub user: String,
    /// Used once, for the install step
    pub password: Password,
}

/// Outcome details of a successful bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    /// A new keypair was created for this run
    pub generated_identity: bool,
    /// known_hosts now pins the remote host key
    pub host_key_recorded: bool,
    /// The install command printed its success line
    pub sentinel_seen: bool,
    /// Trust reached
    pub state: TrustState,
}

/// Drives the identity from absent (or stale) to verified trust
#[derive(Clone)]
pub struct TrustBootstrap {
    keys: KeyManager,
    runner: Arc<dyn ProcessRunner>,
    tracker: Arc<TrustTracker>,
    store: Arc<dyn ConfigStore>,
    settings: BootstrapSettings,
}

impl TrustBootstrap {
    /// Wire the pipeline to its collaborators
    pub fn new(
        keys: KeyManager,
        runner: Arc<dyn ProcessRunner>,
        tracker: Arc<TrustTracker>,
        store: Arc<dyn ConfigStore>,
        settings: BootstrapSettings,
    ) -> Self {
        Self {
            keys,
            runner,
            tracker,
            store,
            settings,
        }
    }

    /// Run the whole pipeline.
    ///
    /// The attempted host, port and user are persisted whatever the outcome,
    /// once the input has been validated.
    pub async fn run(&self, request: BootstrapRequest) -> Result<BootstrapReport, BootstrapError> {
        let BootstrapRequest {
            host,
            port,
            user,
            password,
        } = request;

        if port == 0 {
            return Err(BootstrapError::InvalidTarget("port must be between 1 and 65535".into()));
        }
        if password.is_empty() {
            return Err(BootstrapError::InvalidTarget("password must not be empty".into()));
        }
        validate_target(&host, &user).map_err(BootstrapError::InvalidTarget)?;

        info!(user = %user, host = %host, port, "Setting up SSH trust");
        let result = self.run_steps(&host, port, &user, password).await;

        if let Err(e) = &result {
            if self.keys.exists() {
                self.tracker.transition(TrustState::Failed(e.to_string()));
            } else {
                self.tracker.clear();
            }
        }
        self.persist_target(&host, port, &user).await;

        result
    }

    async fn run_steps(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: Password,
    ) -> Result<BootstrapReport, BootstrapError> {
        let destination = format!("{user}@{host}");

        // 1. Pre-provisioning
        let generated_identity = if self.keys.exists() {
            debug!("Reusing existing SSH identity");
            false
        } else {
            self.keys.generate().await?;
            true
        };
        self.tracker.transition(TrustState::IdentityGenerated);
        let public_key = self.keys.public_key().await?;

        // 2. Host key discovery (advisory)
        let policy = self.discover_host_key(host, port).await;
        let host_key_recorded = matches!(policy, HostKeyPolicy::Pinned(_));

        // 3. Key installation with the one-time password
        let install = format!(
            "umask 077 && mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
             (grep -qxF {key} ~/.ssh/authorized_keys 2>/dev/null || echo {key} >> ~/.ssh/authorized_keys) && \
             chmod 600 ~/.ssh/authorized_keys && echo {sentinel}",
            key = quote(&public_key),
            sentinel = quote(INSTALL_SENTINEL),
        );
        let spec = CommandSpec::new("sshpass", self.settings.install_timeout)
            .arg("-e")
            .arg("ssh")
            .args(ssh_options(port, &policy))
            .args([
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
                "-o".to_string(),
                format!("ConnectTimeout={}", self.settings.verify_connect_timeout.as_secs().max(1)),
            ])
            .arg(&destination)
            .arg(install)
            .with_password(password);

        let output = match self.runner.run(spec).await {
            Ok(output) => output,
            Err(ProcessError::Timeout { .. }) => {
                error!(destination = %destination, "Key installation timed out");
                return Err(BootstrapError::KeyInstall("Connection timeout".into()));
            }
            Err(e) => {
                error!(destination = %destination, error = %e, "Key installation could not run");
                return Err(BootstrapError::KeyInstall(e.to_string()));
            }
        };
        debug!(code = ?output.exit_code, stdout = %output.stdout, stderr = %output.stderr, "sshpass finished");
        if !output.success() {
            error!(destination = %destination, code = ?output.exit_code, "Key installation failed");
            return Err(BootstrapError::KeyInstall(output.diagnostic()));
        }
        self.tracker.transition(TrustState::KeyInstalled);

        // 4. Installation confirmation; verification below is authoritative
        let sentinel_seen = output.stdout.contains(INSTALL_SENTINEL);
        if !sentinel_seen {
            warn!("Key installation completed but success message not found");
        }

        // 5. Settling delay
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        // 6. Independent key-only verification
        self.verify(&destination, port, &policy).await?;
        self.tracker.transition(TrustState::Verified);
        info!(destination = %destination, port, "SSH configured successfully");

        Ok(BootstrapReport {
            generated_identity,
            host_key_recorded,
            sentinel_seen,
            state: TrustState::Verified,
        })
    }

    async fn discover_host_key(&self, host: &str, port: u16) -> HostKeyPolicy {
        let spec = CommandSpec::new("ssh-keyscan", self.settings.keyscan_timeout)
            .args(["-p".to_string(), port.to_string(), "-H".to_string(), host.to_string()]);

        let scanned = match self.runner.run(spec).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => output.stdout,
            Ok(output) => {
                warn!(diagnostic = %output.diagnostic(), "SSH keyscan failed (non-fatal)");
                return HostKeyPolicy::Unchecked;
            }
            Err(e) => {
                warn!(error = %e, "SSH keyscan failed (non-fatal)");
                return HostKeyPolicy::Unchecked;
            }
        };

        // Replaces whatever an earlier target left behind
        let known_hosts = self.keys.paths().known_hosts.clone();
        match fs::write(&known_hosts, scanned).await {
            Ok(()) => {
                info!(path = %known_hosts.display(), "Recorded remote host key");
                HostKeyPolicy::Pinned(known_hosts)
            }
            Err(e) => {
                warn!(path = %known_hosts.display(), error = %e, "Could not record host key (non-fatal)");
                HostKeyPolicy::Unchecked
            }
        }
    }

    async fn verify(&self, destination: &str, port: u16, policy: &HostKeyPolicy) -> Result<(), BootstrapError> {
        let token = Uuid::new_v4().simple().to_string();
        let spec = CommandSpec::new("ssh", self.settings.verify_timeout)
            .args(ssh_options(port, policy))
            .args(key_auth_options(&self.keys.paths().private_key, self.settings.verify_connect_timeout))
            .arg(destination)
            .arg(format!("echo {token}"));

        info!("Testing SSH connection");
        let output = match self.runner.run(spec).await {
            Ok(output) => output,
            Err(ProcessError::Timeout { .. }) => {
                error!("SSH test connection timed out");
                return Err(BootstrapError::TrustVerification("Connection timeout".into()));
            }
            Err(e) => return Err(BootstrapError::TrustVerification(e.to_string())),
        };
        debug!(code = ?output.exit_code, stdout = %output.stdout, stderr = %output.stderr, "SSH test finished");

        if !output.success() {
            error!(diagnostic = %output.diagnostic(), "SSH test connection failed");
            return Err(BootstrapError::TrustVerification(output.diagnostic()));
        }
        if !output.stdout.lines().any(|line| line.trim() == token) {
            error!("SSH test connection did not echo the verification token");
            return Err(BootstrapError::TrustVerification(format!(
                "unexpected response: {}",
                output.stdout.trim()
            )));
        }
        Ok(())
    }

    async fn persist_target(&self, host: &str, port: u16, user: &str) {
        let mut config = self.store.load().await;
        config.set_remote(host, port, user);
        if !self.store.save(&config).await {
            error!("Failed to persist remote target");
        }
    }
}
