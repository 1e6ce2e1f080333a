// Guarded deletion - the only path from a caller-supplied string to unlink()

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

/// Errors raised by [`BackupInventory::delete`](super::BackupInventory::delete)
#[derive(Error, Debug)]
pub enum DeleteError {
    /// Outside the storage root
    #[error("Invalid path: {} is outside the backup directory", .0.display())]
    PathEscape(PathBuf),

    /// Already gone
    #[error("Backup file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Refers to a directory
    #[error("Not a backup file: {}", .0.display())]
    NotAFile(PathBuf),

    /// Removal failed
    #[error("Failed to delete {}: {source}", path.display())]
    Io {
        /// Path being checked or removed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Collapse `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// True iff `path` lies strictly below `root` (component-wise)
fn contained(root: &Path, path: &Path) -> bool {
    path != root && path.starts_with(root)
}

/// Resolve a directory on the way to `target`. One removed since the
/// metadata check means the file is gone too.
async fn canonical(dir: &Path, target: &Path) -> Result<PathBuf, DeleteError> {
    fs::canonicalize(dir).await.map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            DeleteError::NotFound(target.to_path_buf())
        } else {
            DeleteError::Io {
                path: dir.to_path_buf(),
                source,
            }
        }
    })
}

pub(super) async fn delete_within(root: &Path, path: &Path) -> Result<(), DeleteError> {
    if !path.is_absolute() || !root.is_absolute() {
        warn!(path = %path.display(), "Rejected relative delete path");
        return Err(DeleteError::PathEscape(path.to_path_buf()));
    }

    let root = normalize(root);
    let target = normalize(path);
    if !contained(&root, &target) {
        warn!(path = %path.display(), root = %root.display(), "Rejected delete outside backup root");
        return Err(DeleteError::PathEscape(path.to_path_buf()));
    }

    let metadata = match fs::symlink_metadata(&target).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(DeleteError::NotFound(target)),
        Err(source) => return Err(DeleteError::Io { path: target, source }),
    };

    // Symlinks and symlinked parents must still land inside the real root
    let real_root = canonical(&root, &target).await?;
    let real_parent = match target.parent() {
        Some(parent) => canonical(parent, &target).await?,
        None => return Err(DeleteError::PathEscape(target)),
    };
    if !real_parent.starts_with(&real_root) {
        warn!(path = %target.display(), "Rejected delete through a link leaving the backup root");
        return Err(DeleteError::PathEscape(target));
    }

    if metadata.is_dir() {
        return Err(DeleteError::NotAFile(target));
    }

    match fs::remove_file(&target).await {
        Ok(()) => {
            info!(path = %target.display(), "Deleted backup");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Err(DeleteError::NotFound(target)),
        Err(source) => Err(DeleteError::Io { path: target, source }),
    }
}
