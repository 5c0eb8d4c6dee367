// src/filesystem.rs

//! Mode and ownership enforcement for managed paths
//!
//! Directories are forced to 0755 and files to 0644, both owned by the
//! configured principal (root:root in production). Changes are only issued
//! when the observed value differs, so a converged host sees no writes.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::unistd::{Gid, Uid, chown};
use serde::Serialize;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Required mode for managed directories
pub const DIR_MODE: u32 = 0o755;

/// Required mode for artifact files
pub const FILE_MODE: u32 = 0o644;

const WORLD_WRITABLE: u32 = 0o002;
const SET_ID_BITS: u32 = 0o6000;

/// Owner and group every managed path must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// root:root
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    /// The invoking user's uid/gid, for unprivileged runs
    pub fn current() -> Self {
        Self {
            uid: Uid::current().as_raw(),
            gid: Gid::current().as_raw(),
        }
    }
}

impl Default for Ownership {
    fn default() -> Self {
        Self::root()
    }
}

/// True when the mode grants world-write or carries set-uid/set-gid
pub fn is_unsafe_mode(mode: u32) -> bool {
    mode & (WORLD_WRITABLE | SET_ID_BITS) != 0
}

/// Create a directory if needed and force its mode and ownership
///
/// Safe to call concurrently for the same path: a racing creation is not an
/// error. A symlink to a directory is followed and the target is enforced.
pub fn ensure_directory(path: &Path, owner: Ownership) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
        Err(e) => {
            return Err(Error::IoError(format!(
                "Failed to create directory {}: {}",
                path.display(),
                e
            )));
        }
    }

    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Err(Error::IoError(format!(
            "{} exists but is not a directory",
            path.display()
        )));
    }

    enforce_policy(path, &meta, DIR_MODE, owner)
}

/// Force mode and ownership on an existing file
pub fn enforce_file_policy(path: &Path, owner: Ownership) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    enforce_policy(path, &meta, FILE_MODE, owner)
}

fn enforce_policy(path: &Path, meta: &fs::Metadata, mode: u32, owner: Ownership) -> Result<()> {
    if meta.uid() != owner.uid || meta.gid() != owner.gid {
        debug!(
            "Changing owner of {} from {}:{} to {}:{}",
            path.display(),
            meta.uid(),
            meta.gid(),
            owner.uid,
            owner.gid
        );
        chown(
            path,
            Some(Uid::from_raw(owner.uid)),
            Some(Gid::from_raw(owner.gid)),
        )
        .map_err(|e| match e {
            Errno::EPERM | Errno::EACCES | Errno::EROFS => Error::PermissionDenied {
                path: path.to_path_buf(),
                reason: format!("cannot change owner to {}:{}: {}", owner.uid, owner.gid, e),
            },
            other => Error::IoError(format!("chown {} failed: {}", path.display(), other)),
        })?;
    }

    let current = meta.permissions().mode() & 0o7777;
    if current != mode {
        debug!(
            "Changing mode of {} from {:o} to {:o}",
            path.display(),
            current,
            mode
        );
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                Error::PermissionDenied {
                    path: path.to_path_buf(),
                    reason: format!("cannot set mode {:o}: {}", mode, e),
                }
            } else {
                Error::IoError(format!("chmod {} failed: {}", path.display(), e))
            }
        })?;
    }

    Ok(())
}

/// Find world-writable or set-id entries under the given roots
///
/// Symlinks are skipped and the walk never crosses into another filesystem,
/// so the contents of mounted images are not inspected. Missing roots are
/// ignored.
pub fn find_unsafe_paths(roots: &[&Path]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();

    for root in roots {
        if !root.exists() {
            continue;
        }

        for entry in WalkDir::new(root).same_file_system(true).follow_links(false) {
            let entry = entry.map_err(|e| {
                Error::IoError(format!("Failed to scan {}: {}", root.display(), e))
            })?;
            if entry.file_type().is_symlink() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                Error::IoError(format!("Failed to stat {}: {}", entry.path().display(), e))
            })?;
            let mode = meta.permissions().mode();
            if is_unsafe_mode(mode) {
                warn!("Unsafe mode {:o} on {}", mode & 0o7777, entry.path().display());
                found.push(entry.into_path());
            }
        }
    }

    if found.is_empty() {
        info!("Permission sweep clean");
    }
    Ok(found)
}
