// Read-only remote probes

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{key_auth_options, quote, ssh_options, validate_target, HostKeyPolicy};
use crate::config::RemoteTarget;
use crate::identity::IdentityPaths;
use crate::process::{CommandSpec, ProcessError, ProcessOutput, ProcessRunner};

/// Exit status ssh reserves for its own (connection-level) failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Number of archives reported by a path probe
const RECENT_ARCHIVES: usize = 5;

/// Errors raised by remote probes
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The named configuration values are empty
    #[error("Missing server configuration: {0}")]
    MissingConfiguration(String),

    /// No local identity
    #[error("SSH key not configured")]
    IdentityMissing,

    /// ssh could not connect or authenticate
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Connected, but no archives at the path
    #[error("No backups found or path does not exist: {0}")]
    NotFound(String),
}

/// Probe timeouts
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// ssh `ConnectTimeout`
    pub connect_timeout: Duration,
    /// Hard limit on the whole ssh process
    pub command_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Key-only connectivity and inventory checks against the remote host
#[derive(Clone)]
pub struct RemoteProbe {
    runner: Arc<dyn ProcessRunner>,
    paths: IdentityPaths,
    settings: ProbeSettings,
}

impl RemoteProbe {
    /// Probe authenticating with the identity at `paths`
    pub fn new(runner: Arc<dyn ProcessRunner>, paths: IdentityPaths, settings: ProbeSettings) -> Self {
        Self {
            runner,
            paths,
            settings,
        }
    }

    /// Run a trivial remote command; succeeds iff it exits zero
    pub async fn test_connection(&self, target: &RemoteTarget) -> Result<(), ProbeError> {
        let output = self.ssh(target, "true".to_string()).await?;
        if output.success() {
            info!(destination = %target.destination(), port = target.port, "Connection test succeeded");
            Ok(())
        } else {
            warn!(destination = %target.destination(), diagnostic = %output.diagnostic(), "Connection test failed");
            Err(ProbeError::Connection(output.diagnostic()))
        }
    }

    /// List up to five recent archives under `remote_path`, in the remote
    /// listing's own order
    pub async fn test_backup_path(
        &self,
        target: &RemoteTarget,
        remote_path: &str,
    ) -> Result<Vec<String>, ProbeError> {
        let remote_path = remote_path.trim_end_matches('/');
        if remote_path.is_empty() {
            return Err(ProbeError::MissingConfiguration("remote backup path".into()));
        }

        let command = format!(
            "ls -lh {}/*.tar.gz 2>/dev/null | tail -n {}",
            quote(remote_path),
            RECENT_ARCHIVES
        );
        let output = self.ssh(target, command).await?;

        match output.exit_code {
            Some(SSH_CONNECTION_FAILURE) | None => {
                return Err(ProbeError::Connection(output.diagnostic()));
            }
            Some(0) => {}
            Some(code) => {
                debug!(code, "Remote listing exited non-zero");
                return Err(ProbeError::NotFound(remote_path.to_string()));
            }
        }

        let archives: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if archives.is_empty() {
            return Err(ProbeError::NotFound(remote_path.to_string()));
        }

        info!(path = %remote_path, count = archives.len(), "Found recent remote backups");
        Ok(archives)
    }

    async fn ssh(&self, target: &RemoteTarget, remote_command: String) -> Result<ProcessOutput, ProbeError> {
        if !target.is_complete() {
            return Err(ProbeError::MissingConfiguration("remote host and user".into()));
        }
        validate_target(&target.host, &target.user).map_err(ProbeError::MissingConfiguration)?;
        if !self.paths.private_key.exists() {
            return Err(ProbeError::IdentityMissing);
        }

        let spec = CommandSpec::new("ssh", self.settings.command_timeout)
            .args(ssh_options(target.port, &HostKeyPolicy::Unchecked))
            .args(key_auth_options(&self.paths.private_key, self.settings.connect_timeout))
            .arg(target.destination())
            .arg(remote_command);

        self.runner.run(spec).await.map_err(|e| match e {
            ProcessError::Timeout { .. } => ProbeError::Connection("Connection timeout".into()),
            other => ProbeError::Connection(other.to_string()),
        })
    }
}
