// src/error.rs

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Transport-level cause of a failed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The transfer did not finish within the configured timeout
    Timeout,
    /// Connection could not be established or broke mid-transfer
    Connection(String),
    /// Server answered with a non-success status
    Http(u16),
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "timed out"),
            FetchFailure::Connection(cause) => write!(f, "connection error: {}", cause),
            FetchFailure::Http(status) => write!(f, "HTTP {}", status),
        }
    }
}

/// Core error types for isomgr
#[derive(Error, Debug)]
pub enum Error {
    /// A catalog entry or inline image reference failed validation
    #[error("Invalid catalog entry '{name}': {field} {reason}")]
    InvalidCatalogEntry {
        name: String,
        field: &'static str,
        reason: String,
    },

    /// Selected name is not in the catalog and no inline URL was given
    #[error("Unknown image: {0}")]
    UnknownImage(String),

    /// Ownership or mode of a managed path could not be enforced
    #[error("Permission denied on {path}: {reason}")]
    PermissionDenied { path: PathBuf, reason: String },

    /// Download failed at the transport level
    #[error("Failed to fetch {url}: {cause}")]
    FetchFailed { url: String, cause: FetchFailure },

    /// Downloaded or existing artifact is truncated or does not match its checksum
    #[error("Integrity check failed for {path}: {reason}")]
    IntegrityCheckFailed { path: PathBuf, reason: String },

    /// mount(8) or the follow-up verification failed
    #[error("Failed to mount {path}: {cause}")]
    MountFailed { path: PathBuf, cause: String },

    /// Something is already mounted at the path, but not the way we require
    #[error("Unexpected mount at {path}: {fs_type} ({options})")]
    UnexpectedMountState {
        path: PathBuf,
        fs_type: String,
        options: String,
    },

    /// Post-run sweep found world-writable or set-id entries
    #[error("Unsafe permissions detected on {} path(s): {}", .0.len(), display_paths(.0))]
    UnsafePermissionsDetected(Vec<PathBuf>),

    /// At least one image did not converge
    #[error("{failed} of {total} image(s) failed to converge")]
    ImagesFailed { failed: usize, total: usize },

    /// Manifest could not be read or parsed
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Run setup error (thread pool, HTTP client)
    #[error("Initialization failed: {0}")]
    InitError(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors with context
    #[error("I/O error: {0}")]
    IoError(String),
}

/// Classification of a per-image failure, as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCatalogEntry,
    UnknownImage,
    PermissionDenied,
    FetchTimeout,
    FetchConnection,
    FetchHttp,
    IntegrityCheckFailed,
    MountFailed,
    UnexpectedMountState,
    UnsafePermissionsDetected,
    ImagesFailed,
    Manifest,
    Init,
    Io,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidCatalogEntry { .. } => ErrorKind::InvalidCatalogEntry,
            Error::UnknownImage(_) => ErrorKind::UnknownImage,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::FetchFailed { cause, .. } => match cause {
                FetchFailure::Timeout => ErrorKind::FetchTimeout,
                FetchFailure::Connection(_) => ErrorKind::FetchConnection,
                FetchFailure::Http(_) => ErrorKind::FetchHttp,
            },
            Error::IntegrityCheckFailed { .. } => ErrorKind::IntegrityCheckFailed,
            Error::MountFailed { .. } => ErrorKind::MountFailed,
            Error::UnexpectedMountState { .. } => ErrorKind::UnexpectedMountState,
            Error::UnsafePermissionsDetected(_) => ErrorKind::UnsafePermissionsDetected,
            Error::ImagesFailed { .. } => ErrorKind::ImagesFailed,
            Error::ManifestError(_) => ErrorKind::Manifest,
            Error::InitError(_) => ErrorKind::Init,
            Error::Io(_) | Error::IoError(_) => ErrorKind::Io,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using isomgr's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_failure_kinds() {
        let err = Error::FetchFailed {
            url: "https://example.com/a-1.iso".to_string(),
            cause: FetchFailure::Timeout,
        };
        assert_eq!(err.kind(), ErrorKind::FetchTimeout);

        let err = Error::FetchFailed {
            url: "https://example.com/a-1.iso".to_string(),
            cause: FetchFailure::Http(404),
        };
        assert_eq!(err.kind(), ErrorKind::FetchHttp);
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[test]
    fn test_unsafe_permissions_message_lists_paths() {
        let err = Error::UnsafePermissionsDetected(vec![
            PathBuf::from("/var/lib/isos/a"),
            PathBuf::from("/var/lib/isos/b"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 path(s)"));
        assert!(msg.contains("/var/lib/isos/a, /var/lib/isos/b"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::UnexpectedMountState).unwrap();
        assert_eq!(json, "\"unexpected_mount_state\"");
    }
}
