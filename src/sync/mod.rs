//! Manual invocation of the backup-execution script
//!
//! The script owns the transfer protocol and retention enforcement; its
//! output is passed through untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::process::{CommandSpec, ProcessError, ProcessRunner};

/// Default entry point of the backup-execution script
pub const DEFAULT_SYNC_PROGRAM: &str = "/backup.sh";

/// Default hard limit on one sync run
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors related to a manual sync
#[derive(Error, Debug)]
pub enum SyncError {
    /// No local identity to sync with
    #[error("SSH not configured")]
    IdentityMissing,

    /// The script exited non-zero
    #[error("Backup sync failed: {stderr}")]
    Failed {
        /// Exit code, `None` if killed by a signal
        exit_code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// The script ran past its limit and was killed
    #[error("Backup sync timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The script could not be started
    #[error("Backup sync could not start: {0}")]
    Launch(String),
}

/// Captured output of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutput {
    /// Script standard output, passed through untouched
    pub stdout: String,
}

/// Runs the backup-execution script under a hard timeout
#[derive(Clone)]
pub struct SyncTrigger {
    runner: Arc<dyn ProcessRunner>,
    program: PathBuf,
    timeout: Duration,
    private_key: PathBuf,
}

impl SyncTrigger {
    /// Trigger for `program`, gated on `private_key` existing
    pub fn new(runner: Arc<dyn ProcessRunner>, program: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout: DEFAULT_SYNC_TIMEOUT,
            private_key: private_key.into(),
        }
    }

    /// Override the default limit
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Script being run
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the script once, passing its stdout through
    pub async fn run(&self) -> Result<SyncOutput, SyncError> {
        if !self.private_key.exists() {
            return Err(SyncError::IdentityMissing);
        }

        info!(program = %self.program.display(), "Starting manual backup sync");
        let spec = CommandSpec::new(self.program.to_string_lossy(), self.timeout);

        match self.runner.run(spec).await {
            Ok(output) if output.success() => {
                info!("Backup sync completed successfully");
                Ok(SyncOutput { stdout: output.stdout })
            }
            Ok(output) => {
                error!(code = ?output.exit_code, "Backup sync failed");
                Err(SyncError::Failed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                })
            }
            Err(ProcessError::Timeout { timeout, .. }) => {
                error!(timeout_secs = timeout.as_secs(), "Backup sync timed out");
                Err(SyncError::Timeout(timeout))
            }
            Err(e) => {
                error!(error = %e, "Backup sync could not start");
                Err(SyncError::Launch(e.to_string()))
            }
        }
    }
}
