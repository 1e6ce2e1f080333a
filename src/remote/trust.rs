// Trust state machine

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Derived trust between the local identity and the remote account.
///
/// `NoIdentity -> IdentityGenerated -> KeyInstalled -> Verified`, with
/// `Failed` reachable from `IdentityGenerated` or `KeyInstalled`. Once a key
/// has been installed, later key-only probes re-evaluate the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TrustState {
    /// No local keypair
    NoIdentity,
    /// Keypair present, not yet installed remotely
    IdentityGenerated,
    /// Install step reported success, verification pending
    KeyInstalled,
    /// A key-only login succeeded
    Verified,
    /// Last attempt failed, with its diagnostic
    Failed(String),
}

impl TrustState {
    /// Reconstruct the state from identity presence and the last recorded outcome
    pub fn derive(identity_exists: bool, recorded: Option<&TrustState>) -> TrustState {
        if !identity_exists {
            return TrustState::NoIdentity;
        }
        match recorded {
            None | Some(TrustState::NoIdentity) => TrustState::IdentityGenerated,
            Some(state) => state.clone(),
        }
    }

    /// Verified or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrustState::Verified | TrustState::Failed(_))
    }

    /// Only verified trust allows password-less unattended work
    pub fn permits_unattended(&self) -> bool {
        matches!(self, TrustState::Verified)
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: &TrustState) -> bool {
        use TrustState::*;
        match (self, next) {
            // A new bootstrap may start from any state once an identity exists
            (_, IdentityGenerated) => true,
            (_, NoIdentity) => true,
            (IdentityGenerated, KeyInstalled) => true,
            (KeyInstalled, Verified) => true,
            (IdentityGenerated | KeyInstalled, Failed(_)) => true,
            // Probe outcomes after an install
            (Verified | Failed(_), Verified | Failed(_)) => true,
            _ => false,
        }
    }
}

/// Last recorded trust outcome, shared across requests.
///
/// A persistent tracker mirrors the outcome into a small JSON record next to
/// the identity, so a later process derives the same state. The record is
/// re-read on every access since another process may have written it.
#[derive(Debug, Default)]
pub struct TrustTracker {
    recorded: RwLock<Option<TrustState>>,
    record_path: Option<PathBuf>,
}

impl TrustTracker {
    /// In-memory tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker backed by the record at `path`
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            recorded: RwLock::new(read_record(&path)),
            record_path: Some(path),
        }
    }

    /// Current state given whether the identity exists on disk
    pub fn current(&self, identity_exists: bool) -> TrustState {
        let mut recorded = self.recorded.write();
        self.refresh(&mut recorded);
        TrustState::derive(identity_exists, recorded.as_ref())
    }

    /// Record a transition. Invalid edges are logged and recorded anyway,
    /// since the filesystem is the source of truth for identity presence.
    pub fn transition(&self, next: TrustState) {
        let mut recorded = self.recorded.write();
        self.refresh(&mut recorded);
        let from = recorded.clone().unwrap_or(TrustState::NoIdentity);
        if !from.can_transition_to(&next) {
            warn!(from = ?from, to = ?next, "Unexpected trust transition");
        } else {
            debug!(from = ?from, to = ?next, "Trust transition");
        }
        if let Some(path) = &self.record_path {
            write_record(path, &next);
        }
        *recorded = Some(next);
    }

    /// Forget the recorded outcome (identity reset)
    pub fn clear(&self) {
        let mut recorded = self.recorded.write();
        if let Some(path) = &self.record_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove trust record"),
            }
        }
        *recorded = None;
    }

    fn refresh(&self, recorded: &mut Option<TrustState>) {
        if let Some(path) = &self.record_path {
            *recorded = read_record(path);
        }
    }
}

fn read_record(path: &Path) -> Option<TrustState> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read trust record");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable trust record");
            None
        }
    }
}

fn write_record(path: &Path, state: &TrustState) {
    let result = serde_json::to_vec(state)
        .map_err(std::io::Error::from)
        .and_then(|bytes| {
            let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, path)
        });
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to persist trust record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_without_identity() {
        assert_eq!(TrustState::derive(false, Some(&TrustState::Verified)), TrustState::NoIdentity);
        assert_eq!(TrustState::derive(false, None), TrustState::NoIdentity);
    }

    #[test]
    fn test_derive_with_identity() {
        assert_eq!(TrustState::derive(true, None), TrustState::IdentityGenerated);
        assert_eq!(
            TrustState::derive(true, Some(&TrustState::Failed("denied".into()))),
            TrustState::Failed("denied".into())
        );
        assert_eq!(TrustState::derive(true, Some(&TrustState::Verified)), TrustState::Verified);
    }

    #[test]
    fn test_transition_edges() {
        use TrustState::*;
        assert!(IdentityGenerated.can_transition_to(&KeyInstalled));
        assert!(KeyInstalled.can_transition_to(&Verified));
        assert!(KeyInstalled.can_transition_to(&Failed("x".into())));
        assert!(Verified.can_transition_to(&IdentityGenerated));

        assert!(!NoIdentity.can_transition_to(&Verified));
        assert!(!IdentityGenerated.can_transition_to(&Verified));
        assert!(!NoIdentity.can_transition_to(&Failed("x".into())));

        assert!(Verified.can_transition_to(&Failed("refused".into())));
        assert!(Failed("refused".into()).can_transition_to(&Verified));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TrustState::Verified.is_terminal());
        assert!(TrustState::Failed("x".into()).is_terminal());
        assert!(!TrustState::KeyInstalled.is_terminal());
        assert!(TrustState::Verified.permits_unattended());
        assert!(!TrustState::Failed("x".into()).permits_unattended());
    }

    #[test]
    fn test_tracker_clear() {
        let tracker = TrustTracker::new();
        tracker.transition(TrustState::IdentityGenerated);
        tracker.transition(TrustState::KeyInstalled);
        tracker.transition(TrustState::Verified);
        assert_eq!(tracker.current(true), TrustState::Verified);

        tracker.clear();
        assert_eq!(tracker.current(true), TrustState::IdentityGenerated);
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(TrustState::Failed("timeout".into())).unwrap();
        assert_eq!(value, serde_json::json!({"state": "failed", "reason": "timeout"}));
        let value = serde_json::to_value(TrustState::Verified).unwrap();
        assert_eq!(value, serde_json::json!({"state": "verified"}));
    }

    #[test]
    fn test_persistent_tracker_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");

        let first = TrustTracker::persistent(&path);
        first.transition(TrustState::IdentityGenerated);
        first.transition(TrustState::KeyInstalled);
        first.transition(TrustState::Verified);

        let second = TrustTracker::persistent(&path);
        assert_eq!(second.current(true), TrustState::Verified);
        assert_eq!(second.current(false), TrustState::NoIdentity);
    }

    #[test]
    fn test_persistent_tracker_sees_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let reader = TrustTracker::persistent(&path);
        let writer = TrustTracker::persistent(&path);

        writer.transition(TrustState::Failed("Connection refused".into()));
        assert_eq!(reader.current(true), TrustState::Failed("Connection refused".into()));

        writer.clear();
        assert!(!path.exists());
        assert_eq!(reader.current(true), TrustState::IdentityGenerated);
    }

    #[test]
    fn test_corrupt_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        std::fs::write(&path, "{not json").unwrap();

        let tracker = TrustTracker::persistent(&path);
        assert_eq!(tracker.current(true), TrustState::IdentityGenerated);
        tracker.transition(TrustState::IdentityGenerated);
        assert_eq!(tracker.current(true), TrustState::IdentityGenerated);
    }
}
