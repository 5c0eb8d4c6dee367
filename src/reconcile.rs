// src/reconcile.rs

//! Reconciliation of desired images against host state
//!
//! Each image moves through `Pending -> Fetched -> Mounted`, or ends in
//! `Failed` at whichever step went wrong. Images are independent: they run
//! on a bounded worker pool and one failure never stops the others. After
//! all images finish, the storage and mount roots are swept for unsafe
//! permissions.
//!
//! Nothing is cached between runs. Every run observes the host again, which
//! is what makes a repeat run on a converged host a no-op.

use crate::catalog::{Catalog, CatalogEntry, DesiredImageRef};
use crate::config::DEFAULT_WORKERS;
use crate::error::{Error, ErrorKind, Result};
use crate::filesystem;
use crate::mount::{MountManager, MountState};
use crate::store::{ArtifactState, ArtifactStore, Fetcher};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Where an image ended up in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePhase {
    Pending,
    Fetched,
    Mounted,
    Failed,
}

/// Error recorded against one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ImageFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Per-image outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub name: String,
    pub phase: ImagePhase,
    /// A download happened in this run
    pub fetched: bool,
    /// A new mount was attached in this run
    pub mounted: bool,
    pub artifact_path: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub error: Option<ImageFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ReconciliationResult {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: ImagePhase::Pending,
            fetched: false,
            mounted: false,
            artifact_path: None,
            mount_point: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.phase == ImagePhase::Failed
    }

    /// True when the image reached its terminal success phase
    pub fn is_converged(&self, mount_enabled: bool) -> bool {
        match self.phase {
            ImagePhase::Mounted => true,
            ImagePhase::Fetched => !mount_enabled,
            ImagePhase::Pending | ImagePhase::Failed => false,
        }
    }
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mount_enabled: bool,
    pub results: Vec<ReconciliationResult>,
    /// Paths the post-run sweep flagged as world-writable or set-id
    pub unsafe_paths: Vec<PathBuf>,
    pub started_at: String,
    pub finished_at: String,
}

impl RunReport {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_failed()).count()
    }

    pub fn fetch_count(&self) -> usize {
        self.results.iter().filter(|r| r.fetched).count()
    }

    pub fn mount_count(&self) -> usize {
        self.results.iter().filter(|r| r.mounted).count()
    }

    /// Ok when every image converged and the sweep was clean
    ///
    /// Unsafe permissions take precedence over per-image failures.
    pub fn status(&self) -> Result<()> {
        if !self.unsafe_paths.is_empty() {
            return Err(Error::UnsafePermissionsDetected(self.unsafe_paths.clone()));
        }
        let failed = self.failed_count();
        if failed > 0 {
            return Err(Error::ImagesFailed {
                failed,
                total: self.results.len(),
            });
        }
        Ok(())
    }

    /// 0 = converged, 1 = at least one image failed, 2 = unsafe permissions
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            Ok(()) => 0,
            Err(Error::UnsafePermissionsDetected(_)) => 2,
            Err(_) => 1,
        }
    }
}

/// Read-only view of one desired image, as reported by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageStatus {
    pub name: String,
    pub artifact: Option<ArtifactState>,
    pub plausible: bool,
    pub mount: Option<MountState>,
    pub error: Option<ImageFailure>,
}

/// Run-wide switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub mount_enabled: bool,
    pub workers: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            mount_enabled: true,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Drives the artifact store and mount manager toward the desired set
pub struct Reconciler {
    catalog: Catalog,
    store: ArtifactStore,
    mounts: MountManager,
    fetcher: Arc<dyn Fetcher>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        catalog: Catalog,
        store: ArtifactStore,
        mounts: MountManager,
        fetcher: Arc<dyn Fetcher>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            catalog,
            store,
            mounts,
            fetcher,
            options,
        }
    }

    pub fn options(&self) -> ReconcileOptions {
        self.options
    }

    /// Reconcile every desired image and sweep for unsafe permissions
    ///
    /// Per-image problems are recorded in the report. Only failures to
    /// prepare the storage or mount root, or to run the sweep, abort the run.
    pub fn run(&self, desired: &[DesiredImageRef]) -> Result<RunReport> {
        let started_at = chrono::Utc::now().to_rfc3339();
        info!(
            "Reconciling {} image(s), mounting {}",
            desired.len(),
            if self.options.mount_enabled { "enabled" } else { "disabled" }
        );

        self.store.ensure_storage_root()?;
        let purged = self.store.purge_partials()?;
        if purged > 0 {
            info!("Removed {} stale partial download(s)", purged);
        }
        if self.options.mount_enabled {
            self.mounts.ensure_mount_root()?;
        }

        let selection = dedupe(desired);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create worker pool: {}", e)))?;

        let results: Vec<ReconciliationResult> =
            pool.install(|| selection.par_iter().map(|d| self.reconcile_one(d)).collect());

        let unsafe_paths =
            filesystem::find_unsafe_paths(&[self.store.root(), self.mounts.root()])?;

        let report = RunReport {
            mount_enabled: self.options.mount_enabled,
            results,
            unsafe_paths,
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
        };

        info!(
            "Run finished: {} image(s), {} failed, {} fetched, {} mounted",
            report.results.len(),
            report.failed_count(),
            report.fetch_count(),
            report.mount_count()
        );
        Ok(report)
    }

    /// Observe every desired image without changing anything
    pub fn observe(&self, desired: &[DesiredImageRef]) -> Vec<ImageStatus> {
        dedupe(desired)
            .into_iter()
            .map(|d| {
                let mut status = ImageStatus {
                    name: d.name().to_string(),
                    artifact: None,
                    plausible: false,
                    mount: None,
                    error: None,
                };
                if let Err(e) = self.observe_into(d, &mut status) {
                    status.error = Some(ImageFailure::from(&e));
                }
                status
            })
            .collect()
    }

    fn observe_into(&self, desired: &DesiredImageRef, status: &mut ImageStatus) -> Result<()> {
        let entry = self.catalog.resolve_one(desired)?;
        let artifact = self.store.observe(&entry)?;
        status.plausible = artifact.is_plausible(self.store.min_image_bytes());
        status.artifact = Some(artifact);
        if self.options.mount_enabled {
            status.mount = Some(self.mounts.observe_mount(&self.mounts.mount_point(&entry))?);
        }
        Ok(())
    }

    /// Reconcile one image; never fails, errors end up in the result
    pub fn reconcile_one(&self, desired: &DesiredImageRef) -> ReconciliationResult {
        let mut result = ReconciliationResult::pending(desired.name());

        if let Err(e) = self.drive(desired, &mut result) {
            error!("{}: {}", result.name, e);
            result.error = Some(ImageFailure::from(&e));
            result.phase = ImagePhase::Failed;
        }
        result
    }

    fn drive(&self, desired: &DesiredImageRef, result: &mut ReconciliationResult) -> Result<()> {
        let entry: CatalogEntry = self.catalog.resolve_one(desired)?;

        let artifact = self.store.artifact_path(&entry);
        result.artifact_path = Some(artifact.clone());

        let fetched = self.store.ensure_fetched(&entry, self.fetcher.as_ref())?;
        result.fetched = fetched.fetched;
        result.phase = ImagePhase::Fetched;

        if !self.options.mount_enabled {
            info!("{}: fetched, mounting disabled", entry.name);
            return Ok(());
        }

        let mount_point = self.mounts.ensure_mount_point_dir(&entry)?;
        result.mount_point = Some(mount_point.clone());

        let mounted = self
            .mounts
            .ensure_mounted(&artifact, &mount_point, entry.format)?;
        result.mounted = mounted.attached;
        result.phase = ImagePhase::Mounted;

        // An existing loop mount still holds the inode the new file replaced
        if result.fetched && !mounted.attached {
            let warning = format!(
                "{} was re-fetched while already mounted; the mount still serves the old file until it is remounted",
                artifact.display()
            );
            warn!("{}: {}", entry.name, warning);
            result.warnings.push(warning);
        }

        info!("{}: converged", entry.name);
        Ok(())
    }
}

/// Keep the first reference for each name so no two workers share a file
fn dedupe(desired: &[DesiredImageRef]) -> Vec<&DesiredImageRef> {
    let mut seen = HashSet::new();
    desired
        .iter()
        .filter(|d| {
            let first = seen.insert(d.name());
            if !first {
                warn!("Ignoring duplicate selection of {}", d.name());
            }
            first
        })
        .collect()
}
