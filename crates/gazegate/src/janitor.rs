//! Temp artifact lifecycle: naming and deletion.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JanitorError {
    #[error("failed to delete temp artifact {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What [`delete_temp_artifact`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    /// Nothing at that path; not an error.
    Missing,
    /// Empty path, nothing to do.
    Skipped,
}

/// Delete a temp artifact.
///
/// A missing file is logged and reported as [`Removal::Missing`]. Failing to
/// delete a file that exists is the one error surfaced to the caller.
pub async fn delete_temp_artifact(path: &Path) -> Result<Removal, JanitorError> {
    if path.as_os_str().is_empty() {
        return Ok(Removal::Skipped);
    }

    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "temp artifact deleted");
            Ok(Removal::Deleted)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "temp artifact not found");
            Ok(Removal::Missing)
        }
        Err(source) => Err(JanitorError::Delete {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Delete a temp artifact where a failure must not stop the caller.
///
/// Returns false when the file could not be deleted; the error is logged.
pub async fn discard(path: &Path) -> bool {
    match delete_temp_artifact(path).await {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(error = %e, "temp artifact leaked");
            false
        }
    }
}

/// A fresh, unique path for a temp artifact in `dir`.
pub fn temp_artifact_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}-{}.jpg", uuid::Uuid::new_v4()))
}
