//! External program execution.
//!
//! Every ssh, ssh-keygen, ssh-keyscan and backup-script invocation goes
//! through [`ProcessRunner`]. Calls are blocking from the caller's point of
//! view and always bounded by an explicit timeout.

mod runner;

pub use runner::TokioProcessRunner;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Environment variable `sshpass -e` reads the password from.
pub const PASSWORD_ENV: &str = "SSHPASS";

/// Errors raised while running an external program
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program name or path
        program: String,
        /// Spawn failure
        #[source]
        source: std::io::Error,
    },

    /// The deadline elapsed; the process group was killed
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout {
        /// Program name or path
        program: String,
        /// Limit that elapsed
        timeout: Duration,
    },

    /// Waiting on the child failed
    #[error("IO error while waiting for {program}: {source}")]
    Io {
        /// Program name or path
        program: String,
        /// Wait failure
        #[source]
        source: std::io::Error,
    },
}

/// One-time password for the key installation step.
///
/// Zeroised on drop. Moved into the [`CommandSpec`] that needs it, so it
/// cannot outlive that single call.
pub struct Password(SecretString);

impl Password {
    /// Wrap an operator-supplied password
    pub fn new(password: impl Into<String>) -> Self {
        Self(SecretString::from(password.into()))
    }

    /// True if the operator supplied an empty string
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// A single external program invocation
#[derive(Debug)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,

    /// Arguments, passed verbatim (no shell)
    pub args: Vec<String>,

    /// Hard upper bound on the run time; the child is killed when it elapses
    pub timeout: Duration,

    /// Delivered to the child through [`PASSWORD_ENV`] only
    pub password: Option<Password>,
}

impl CommandSpec {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            password: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Attach the one-time password
    pub fn with_password(mut self, password: Password) -> Self {
        self.password = Some(password);
        self
    }

    /// Human-readable command line for logs
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` if terminated by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ProcessOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// True iff the process exited with code zero
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Best diagnostic text: stderr if present, otherwise stdout
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Capability to run external programs
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `spec` to completion or until its timeout elapses
    async fn run(&self, spec: CommandSpec) -> Result<ProcessOutput, ProcessError>;
}
