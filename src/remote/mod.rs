//! SSH trust bootstrap and read-only remote probes
//!
//! All remote work shells out to the system OpenSSH client through the
//! [`ProcessRunner`](crate::process::ProcessRunner). This module owns the
//! argument conventions shared by the bootstrap and the probes.

mod bootstrap;
mod probe;
mod trust;

pub use bootstrap::{BootstrapError, BootstrapReport, BootstrapRequest, BootstrapSettings, TrustBootstrap};
pub use probe::{ProbeError, ProbeSettings, RemoteProbe};
pub use trust::{TrustState, TrustTracker};

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HOST_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_\[][A-Za-z0-9._:\-\[\]]*$").expect("static regex");
    static ref USER_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_.][A-Za-z0-9_.\-]*$").expect("static regex");
}

/// How the remote host key is checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Strict checking against a recorded known_hosts file
    Pinned(PathBuf),
    /// No checking; nothing recorded
    Unchecked,
}

/// Reject hosts and users that ssh would parse as options or that are malformed
pub fn validate_target(host: &str, user: &str) -> Result<(), String> {
    if !HOST_PATTERN.is_match(host) {
        return Err(format!("invalid host '{host}'"));
    }
    if !USER_PATTERN.is_match(user) {
        return Err(format!("invalid user '{user}'"));
    }
    Ok(())
}

/// Port and host-key options common to every ssh invocation
pub(crate) fn ssh_options(port: u16, policy: &HostKeyPolicy) -> Vec<String> {
    let mut args = vec!["-p".to_string(), port.to_string()];
    match policy {
        HostKeyPolicy::Pinned(known_hosts) => {
            args.push("-o".into());
            args.push("StrictHostKeyChecking=yes".into());
            args.push("-o".into());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        HostKeyPolicy::Unchecked => {
            args.push("-o".into());
            args.push("StrictHostKeyChecking=no".into());
            args.push("-o".into());
            args.push("UserKnownHostsFile=/dev/null".into());
        }
    }
    args
}

/// Key-only, non-interactive authentication
pub(crate) fn key_auth_options(private_key: &Path, connect_timeout: Duration) -> Vec<String> {
    vec![
        "-i".to_string(),
        private_key.to_string_lossy().into_owned(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
    ]
}

/// Quote one word for the remote POSIX shell
pub(crate) fn quote(word: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(word)).into_owned()
}
