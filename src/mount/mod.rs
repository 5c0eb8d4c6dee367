// src/mount/mod.rs

//! Mount manager: mount-point directories and read-only loop mounts
//!
//! Only the unmounted -> mounted transition is managed. An existing mount
//! that is not a read-only mount of the expected filesystem type is reported
//! as [`Error::UnexpectedMountState`] and left untouched.

pub mod backend;
pub mod table;

pub use backend::{MountBackend, SystemMounter};
pub use table::{MountEntry, MountTable};

use crate::catalog::{CatalogEntry, ImageFormat};
use crate::error::{Error, Result};
use crate::filesystem::{self, Ownership};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Observed mount state of one mount point
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MountState {
    pub mounted: bool,
    pub filesystem_type: Option<String>,
    pub options: BTreeSet<String>,
}

impl MountState {
    pub fn not_mounted() -> Self {
        Self::default()
    }

    /// Mounted read-only with the given filesystem type
    pub fn is_read_only(&self, fs_type: &str) -> bool {
        self.mounted
            && self.filesystem_type.as_deref() == Some(fs_type)
            && self.options.contains("ro")
    }

    fn options_string(&self) -> String {
        self.options.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

impl From<Option<MountEntry>> for MountState {
    fn from(entry: Option<MountEntry>) -> Self {
        match entry {
            Some(entry) => Self {
                mounted: true,
                filesystem_type: Some(entry.fs_type),
                options: entry.options,
            },
            None => Self::not_mounted(),
        }
    }
}

/// Result of [`MountManager::ensure_mounted`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOutcome {
    pub state: MountState,
    /// A new mount was attached during this call
    pub attached: bool,
}

/// Stateless service over the mount root and the host mount table
#[derive(Clone)]
pub struct MountManager {
    root: PathBuf,
    owner: Ownership,
    backend: Arc<dyn MountBackend>,
}

impl MountManager {
    pub fn new(root: impl Into<PathBuf>, owner: Ownership, backend: Arc<dyn MountBackend>) -> Self {
        Self {
            root: root.into(),
            owner,
            backend,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount point of an entry, `<root>/<name>`
    pub fn mount_point(&self, entry: &CatalogEntry) -> PathBuf {
        self.root.join(entry.mount_dir_name())
    }

    /// Create the mount root if absent and force 0755 plus ownership
    pub fn ensure_mount_root(&self) -> Result<()> {
        debug!("Ensuring mount root {}", self.root.display());
        filesystem::ensure_directory(&self.root, self.owner)
    }

    /// Create `<root>/<name>` with 0755 plus ownership
    ///
    /// While an image is mounted there the directory is shadowed by the
    /// read-only filesystem root, so it is left as is.
    pub fn ensure_mount_point_dir(&self, entry: &CatalogEntry) -> Result<PathBuf> {
        let path = self.mount_point(entry);
        if path.is_dir() && self.observe_mount(&path)?.mounted {
            debug!("{} is mounted, skipping directory policy", path.display());
            return Ok(path);
        }
        filesystem::ensure_directory(&path, self.owner)?;
        Ok(path)
    }

    /// Query the mount table; not mounted is a valid observation
    pub fn observe_mount(&self, path: &Path) -> Result<MountState> {
        Ok(self.backend.lookup(path)?.into())
    }

    /// Make sure `artifact` is loop-mounted read-only at `mount_path`
    pub fn ensure_mounted(
        &self,
        artifact: &Path,
        mount_path: &Path,
        format: ImageFormat,
    ) -> Result<MountOutcome> {
        let fs_type = format.filesystem_type();
        let state = self.observe_mount(mount_path)?;

        if state.mounted {
            if state.is_read_only(fs_type) {
                debug!("{} already mounted read-only", mount_path.display());
                return Ok(MountOutcome {
                    state,
                    attached: false,
                });
            }
            return Err(Error::UnexpectedMountState {
                path: mount_path.to_path_buf(),
                fs_type: state.filesystem_type.clone().unwrap_or_default(),
                options: state.options_string(),
            });
        }

        self.backend.attach_read_only(artifact, mount_path, fs_type)?;

        let state = self.observe_mount(mount_path)?;
        if !state.is_read_only(fs_type) {
            return Err(Error::MountFailed {
                path: mount_path.to_path_buf(),
                cause: if state.mounted {
                    format!(
                        "mounted as {} ({}), expected read-only {}",
                        state.filesystem_type.as_deref().unwrap_or("unknown"),
                        state.options_string(),
                        fs_type
                    )
                } else {
                    "mount reported success but nothing is mounted".to_string()
                },
            });
        }

        info!("{} mounted read-only at {}", artifact.display(), mount_path.display());
        Ok(MountOutcome {
            state,
            attached: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// In-memory mount table; `mounts_as` controls what an attach produces
    struct FakeBackend {
        table: Mutex<BTreeMap<PathBuf, MountEntry>>,
        mounts_as: Option<(&'static str, &'static str)>,
        attaches: Mutex<usize>,
    }

    impl FakeBackend {
        fn new(mounts_as: Option<(&'static str, &'static str)>) -> Self {
            Self {
                table: Mutex::new(BTreeMap::new()),
                mounts_as,
                attaches: Mutex::new(0),
            }
        }

        fn preload(&self, target: &Path, fs_type: &str, options: &str) {
            self.table.lock().unwrap().insert(
                target.to_path_buf(),
                MountEntry {
                    source: "/dev/loop9".to_string(),
                    target: target.to_path_buf(),
                    fs_type: fs_type.to_string(),
                    options: options.split(',').map(str::to_string).collect(),
                },
            );
        }
    }

    impl MountBackend for FakeBackend {
        fn lookup(&self, target: &Path) -> Result<Option<MountEntry>> {
            Ok(self.table.lock().unwrap().get(target).cloned())
        }

        fn attach_read_only(&self, source: &Path, target: &Path, _fs_type: &str) -> Result<()> {
            *self.attaches.lock().unwrap() += 1;
            match self.mounts_as {
                Some((fs_type, options)) => {
                    self.preload(target, fs_type, options);
                    Ok(())
                }
                None => Err(Error::MountFailed {
                    path: target.to_path_buf(),
                    cause: format!("{}: wrong fs type, bad superblock", source.display()),
                }),
            }
        }
    }

    fn entry() -> CatalogEntry {
        CatalogEntry::new("alpine-3.23", "https://example.com/alpine-3.23.iso", None).unwrap()
    }

    fn manager(root: &Path, backend: Arc<FakeBackend>) -> MountManager {
        MountManager::new(root, Ownership::current(), backend)
    }

    #[test]
    fn test_mount_point_naming() {
        let backend = Arc::new(FakeBackend::new(None));
        let manager = manager(Path::new("/var/lib/iso_mounts"), backend);
        assert_eq!(
            manager.mount_point(&entry()),
            PathBuf::from("/var/lib/iso_mounts/alpine-3.23")
        );
    }

    #[test]
    fn test_ensure_mounted_attaches_once() {
        let temp = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(Some(("iso9660", "ro,relatime"))));
        let manager = manager(temp.path(), backend.clone());
        manager.ensure_mount_root().unwrap();
        let path = manager.ensure_mount_point_dir(&entry()).unwrap();

        let first = manager
            .ensure_mounted(Path::new("/isos/alpine-3.23.iso"), &path, ImageFormat::Iso)
            .unwrap();
        assert!(first.attached);
        assert!(first.state.is_read_only("iso9660"));

        let second = manager
            .ensure_mounted(Path::new("/isos/alpine-3.23.iso"), &path, ImageFormat::Iso)
            .unwrap();
        assert!(!second.attached);
        assert_eq!(*backend.attaches.lock().unwrap(), 1);
    }

    #[test]
    fn test_unexpected_rw_mount_is_surfaced() {
        let temp = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(Some(("iso9660", "ro"))));
        let manager = manager(temp.path(), backend.clone());
        let path = manager.mount_point(&entry());
        backend.preload(&path, "ext4", "rw,relatime");

        let err = manager
            .ensure_mounted(Path::new("/isos/alpine-3.23.iso"), &path, ImageFormat::Iso)
            .unwrap_err();
        match err {
            Error::UnexpectedMountState { fs_type, options, .. } => {
                assert_eq!(fs_type, "ext4");
                assert_eq!(options, "relatime,rw");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*backend.attaches.lock().unwrap(), 0);
    }

    #[test]
    fn test_mount_failure() {
        let temp = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(None));
        let manager = manager(temp.path(), backend);
        let path = manager.mount_point(&entry());

        let err = manager
            .ensure_mounted(Path::new("/isos/alpine-3.23.iso"), &path, ImageFormat::Iso)
            .unwrap_err();
        assert!(matches!(err, Error::MountFailed { .. }));
    }

    #[test]
    fn test_writable_result_after_attach_is_failure() {
        let temp = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(Some(("iso9660", "rw"))));
        let manager = manager(temp.path(), backend);
        let path = manager.mount_point(&entry());

        let err = manager
            .ensure_mounted(Path::new("/isos/alpine-3.23.iso"), &path, ImageFormat::Iso)
            .unwrap_err();
        match err {
            Error::MountFailed { cause, .. } => assert!(cause.contains("expected read-only iso9660")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_observe_not_mounted() {
        let backend = Arc::new(FakeBackend::new(None));
        let manager = manager(Path::new("/var/lib/iso_mounts"), backend);
        let state = manager
            .observe_mount(Path::new("/var/lib/iso_mounts/alpine-3.23"))
            .unwrap();
        assert_eq!(state, MountState::not_mounted());
    }
}
