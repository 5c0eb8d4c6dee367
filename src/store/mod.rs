// src/store/mod.rs

//! Artifact store: the storage root and the image files inside it
//!
//! This module provides functionality for:
//! - Keeping the storage root at 0755, owned by the configured principal
//! - Observing whether an image file is present and plausible
//! - Idempotent downloads placed atomically under the final name
//! - Verifying size and, when the catalog carries one, the SHA-256 digest

pub mod fetch;

pub use fetch::{DEFAULT_FETCH_TIMEOUT, Fetcher, HttpFetcher};

use crate::catalog::CatalogEntry;
use crate::error::{Error, Result};
use crate::filesystem::{self, FILE_MODE, Ownership};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Smallest file size we accept as a real image (1 MiB)
pub const DEFAULT_MIN_IMAGE_BYTES: u64 = 1024 * 1024;

/// Prefix and suffix of in-flight download files
const PARTIAL_PREFIX: &str = ".partial-";
const PARTIAL_SUFFIX: &str = ".part";

/// Observed state of one artifact file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ArtifactState {
    pub exists: bool,
    pub size_bytes: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl ArtifactState {
    pub fn absent() -> Self {
        Self::default()
    }

    /// Present, non-empty and at least `min_bytes` long
    pub fn is_plausible(&self, min_bytes: u64) -> bool {
        self.exists && self.size_bytes > 0 && self.size_bytes >= min_bytes
    }

    /// Exactly the required file mode and owner
    pub fn has_policy(&self, owner: Ownership) -> bool {
        self.mode == FILE_MODE && self.uid == owner.uid && self.gid == owner.gid
    }
}

/// Result of [`ArtifactStore::ensure_fetched`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub state: ArtifactState,
    /// A download happened during this call
    pub fetched: bool,
}

/// Stateless service over the storage root directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    owner: Ownership,
    min_image_bytes: u64,
    partial_grace: Duration,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, owner: Ownership) -> Self {
        Self {
            root: root.into(),
            owner,
            min_image_bytes: DEFAULT_MIN_IMAGE_BYTES,
            partial_grace: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Override the corruption/truncation threshold
    pub fn with_min_image_bytes(mut self, min_image_bytes: u64) -> Self {
        self.min_image_bytes = min_image_bytes.max(1);
        self
    }

    /// Partial downloads younger than this may belong to another run
    pub fn with_partial_grace(mut self, grace: Duration) -> Self {
        self.partial_grace = grace;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn min_image_bytes(&self) -> u64 {
        self.min_image_bytes
    }

    /// Final location of an entry's image file
    pub fn artifact_path(&self, entry: &CatalogEntry) -> PathBuf {
        self.root.join(entry.file_name())
    }

    /// Create the storage root if absent and force 0755 plus ownership
    pub fn ensure_storage_root(&self) -> Result<()> {
        debug!("Ensuring storage root {}", self.root.display());
        filesystem::ensure_directory(&self.root, self.owner)
    }

    /// Remove download leftovers from interrupted runs
    ///
    /// Files modified within the partial grace period are kept: an
    /// overlapping run may still be writing them.
    pub fn purge_partials(&self) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX) {
                let age = dirent
                    .metadata()?
                    .modified()
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .unwrap_or_default();
                if age < self.partial_grace {
                    debug!("Keeping recent partial download {}", dirent.path().display());
                    continue;
                }
                warn!("Removing stale partial download {}", dirent.path().display());
                fs::remove_file(dirent.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stat the artifact file; absence is a valid observation
    pub fn observe(&self, entry: &CatalogEntry) -> Result<ArtifactState> {
        observe_path(&self.artifact_path(entry))
    }

    /// Make sure a plausible, correctly permissioned image file is in place
    ///
    /// A plausible existing file is never downloaded again; only its mode and
    /// owner are corrected. Anything else (missing, empty, truncated) is
    /// replaced by a fresh download that becomes visible under the final
    /// name only after it has been fully written and verified.
    pub fn ensure_fetched(&self, entry: &CatalogEntry, fetcher: &dyn Fetcher) -> Result<FetchOutcome> {
        let path = self.artifact_path(entry);
        let state = observe_path(&path)?;

        if state.is_plausible(self.min_image_bytes) {
            if !state.has_policy(self.owner) {
                info!("Correcting permissions on {}", path.display());
                filesystem::enforce_file_policy(&path, self.owner)?;
                return Ok(FetchOutcome {
                    state: observe_path(&path)?,
                    fetched: false,
                });
            }
            debug!("{} already present ({} bytes)", path.display(), state.size_bytes);
            return Ok(FetchOutcome {
                state,
                fetched: false,
            });
        }

        if state.exists {
            warn!(
                "{} is implausibly small ({} bytes), fetching again",
                path.display(),
                state.size_bytes
            );
        }

        self.download(entry, &path, fetcher)?;
        let state = observe_path(&path)?;
        if !state.is_plausible(self.min_image_bytes) {
            return Err(Error::IntegrityCheckFailed {
                path,
                reason: format!("{} bytes after placement", state.size_bytes),
            });
        }

        info!("Placed {} ({} bytes)", path.display(), state.size_bytes);
        Ok(FetchOutcome {
            state,
            fetched: true,
        })
    }

    fn download(&self, entry: &CatalogEntry, dest: &Path, fetcher: &dyn Fetcher) -> Result<()> {
        let mut temp = tempfile::Builder::new()
            .prefix(&format!("{}{}.", PARTIAL_PREFIX, entry.name))
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&self.root)
            .map_err(|e| {
                Error::IoError(format!(
                    "Failed to create temporary file in {}: {}",
                    self.root.display(),
                    e
                ))
            })?;

        let written = {
            let file = temp.as_file_mut();
            let written = fetcher.fetch(&entry.url, file)?;
            file.flush()?;
            file.sync_all()?;
            written
        };

        // Dropping `temp` on any error below removes the partial file
        if written < self.min_image_bytes {
            return Err(Error::IntegrityCheckFailed {
                path: dest.to_path_buf(),
                reason: format!(
                    "downloaded {} bytes, expected at least {}",
                    written, self.min_image_bytes
                ),
            });
        }

        if let Some(expected) = &entry.sha256 {
            verify_checksum(temp.path(), expected).map_err(|e| match e {
                Error::IntegrityCheckFailed { reason, .. } => Error::IntegrityCheckFailed {
                    path: dest.to_path_buf(),
                    reason,
                },
                other => other,
            })?;
        }

        filesystem::enforce_file_policy(temp.path(), self.owner)?;

        temp.persist(dest).map_err(|e| {
            Error::IoError(format!("Failed to move download to {}: {}", dest.display(), e.error))
        })?;

        Ok(())
    }
}

fn observe_path(path: &Path) -> Result<ArtifactState> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => Ok(ArtifactState {
            exists: true,
            size_bytes: meta.len(),
            mode: meta.permissions().mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        }),
        Ok(_) => Err(Error::IoError(format!(
            "{} exists but is not a regular file",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ArtifactState::absent()),
        Err(e) => Err(e.into()),
    }
}

/// Verify file checksum matches expected value
fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    use sha2::{Digest, Sha256};

    debug!("Verifying checksum for {}", path.display());

    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open file for checksum: {}", e)))?;

    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::IoError(format!("Failed to read file for checksum: {}", e)))?;

    let actual = format!("{:x}", hasher.finalize());

    if actual != expected {
        return Err(Error::IntegrityCheckFailed {
            path: path.to_path_buf(),
            reason: format!("checksum mismatch: expected {}, got {}", expected, actual),
        });
    }

    debug!("Checksum verified: {}", expected);
    Ok(())
}
