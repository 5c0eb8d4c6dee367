// src/config.rs

//! Desired-state manifest
//!
//! A manifest is a JSON document holding the catalog, the selection of
//! images to provision on this host and the run flags. Everything except the
//! catalog and selection has a default.

use crate::catalog::{Catalog, CatalogSource, DesiredImageRef};
use crate::error::{Error, Result};
use crate::store::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MIN_IMAGE_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default storage root for image files
pub const DEFAULT_STORAGE_ROOT: &str = "/var/lib/isos";

/// Default root for per-image mount points
pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/iso_mounts";

/// Default number of images reconciled concurrently
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Image name -> source
    #[serde(default)]
    pub catalog: BTreeMap<String, CatalogSource>,

    /// Images to provision, by catalog name or inline
    #[serde(default)]
    pub provision: Vec<DesiredImageRef>,

    #[serde(default = "default_mount_enabled")]
    pub mount_enabled: bool,

    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_min_image_bytes")]
    pub min_image_bytes: u64,
}

fn default_mount_enabled() -> bool {
    true
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_ROOT)
}

fn default_mount_root() -> PathBuf {
    PathBuf::from(DEFAULT_MOUNT_ROOT)
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT.as_secs()
}

fn default_min_image_bytes() -> u64 {
    DEFAULT_MIN_IMAGE_BYTES
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            catalog: BTreeMap::new(),
            provision: Vec::new(),
            mount_enabled: default_mount_enabled(),
            storage_root: default_storage_root(),
            mount_root: default_mount_root(),
            workers: default_workers(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            min_image_bytes: default_min_image_bytes(),
        }
    }
}

impl Manifest {
    /// Load a manifest from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading manifest from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ManifestError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| Error::ManifestError(format!("Invalid JSON in {}: {}", path.display(), e)))?;
        manifest.check_settings()?;
        Ok(manifest)
    }

    /// Parse a manifest from JSON text
    pub fn from_json(content: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(content)
            .map_err(|e| Error::ManifestError(format!("Invalid manifest JSON: {}", e)))?;
        manifest.check_settings()?;
        Ok(manifest)
    }

    /// Reject settings no run can work with
    pub fn check_settings(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ManifestError("workers must be at least 1".to_string()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(Error::ManifestError(
                "fetch_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.storage_root == self.mount_root {
            return Err(Error::ManifestError(
                "storage_root and mount_root must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// The injected, immutable catalog for a run
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.catalog.clone())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
