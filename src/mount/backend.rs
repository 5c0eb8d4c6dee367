// src/mount/backend.rs

//! Host mount subsystem access

use super::table::{MountEntry, MountTable};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Narrow interface to the host's mount table and loop-mount command
pub trait MountBackend: Send + Sync {
    /// Topmost mount at `target`, or `None` when nothing is mounted there
    fn lookup(&self, target: &Path) -> Result<Option<MountEntry>>;

    /// Attach `source` at `target` as a read-only loop mount of `fs_type`
    fn attach_read_only(&self, source: &Path, target: &Path, fs_type: &str) -> Result<()>;
}

/// Reads `/proc/self/mounts` and shells out to mount(8)
#[derive(Debug, Clone)]
pub struct SystemMounter {
    table_path: PathBuf,
    mount_program: PathBuf,
}

impl SystemMounter {
    pub fn new() -> Self {
        Self {
            table_path: PathBuf::from("/proc/self/mounts"),
            mount_program: PathBuf::from("mount"),
        }
    }

    /// Read the mount table from another file (for containers and tests)
    pub fn with_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.table_path = path.into();
        self
    }

    pub fn with_mount_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.mount_program = program.into();
        self
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl MountBackend for SystemMounter {
    fn lookup(&self, target: &Path) -> Result<Option<MountEntry>> {
        let content = fs::read_to_string(&self.table_path).map_err(|e| {
            Error::IoError(format!(
                "Failed to read mount table {}: {}",
                self.table_path.display(),
                e
            ))
        })?;
        let table = MountTable::parse(&content);

        // The kernel reports canonical paths
        let canonical = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        Ok(table.find(&canonical).cloned())
    }

    fn attach_read_only(&self, source: &Path, target: &Path, fs_type: &str) -> Result<()> {
        debug!(
            "Running {} -t {} -o loop,ro {} {}",
            self.mount_program.display(),
            fs_type,
            source.display(),
            target.display()
        );

        let output = Command::new(&self.mount_program)
            .args(["-t", fs_type, "-o", "loop,ro"])
            .arg(source)
            .arg(target)
            .output()
            .map_err(|e| Error::MountFailed {
                path: target.to_path_buf(),
                cause: format!("failed to run {}: {}", self.mount_program.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::MountFailed {
                path: target.to_path_buf(),
                cause: if stderr.is_empty() {
                    format!("mount exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }

        info!("Mounted {} at {}", source.display(), target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lookup_reads_table_file() {
        let temp = tempdir().unwrap();
        let table = temp.path().join("mounts");
        fs::write(
            &table,
            "/dev/loop3 /srv/isos/debian-12 iso9660 ro,relatime 0 0\n",
        )
        .unwrap();

        let mounter = SystemMounter::new().with_table_path(&table);
        let entry = mounter
            .lookup(Path::new("/srv/isos/debian-12"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.fs_type, "iso9660");
        assert!(mounter.lookup(Path::new("/srv/isos/other-1")).unwrap().is_none());
    }

    #[test]
    fn test_missing_table_is_error() {
        let mounter = SystemMounter::new().with_table_path("/nonexistent/mounts");
        assert!(mounter.lookup(Path::new("/")).is_err());
    }

    #[test]
    fn test_attach_failure_is_mount_failed() {
        let mounter = SystemMounter::new().with_mount_program("false");
        let err = mounter
            .attach_read_only(Path::new("/tmp/a-1.iso"), Path::new("/tmp/a-1"), "iso9660")
            .unwrap_err();
        match err {
            Error::MountFailed { path, cause } => {
                assert_eq!(path, PathBuf::from("/tmp/a-1"));
                assert!(cause.contains("exited with"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_attach_missing_program() {
        let mounter = SystemMounter::new().with_mount_program("/nonexistent/mount");
        let err = mounter
            .attach_read_only(Path::new("/tmp/a-1.iso"), Path::new("/tmp/a-1"), "iso9660")
            .unwrap_err();
        assert!(matches!(err, Error::MountFailed { .. }));
    }

    #[test]
    fn test_attach_success() {
        let mounter = SystemMounter::new().with_mount_program("true");
        assert!(
            mounter
                .attach_read_only(Path::new("/tmp/a-1.iso"), Path::new("/tmp/a-1"), "iso9660")
                .is_ok()
        );
    }
}
