// src/lib.rs

//! isomgr: read-only disk image provisioning
//!
//! Reconciles a declared catalog of disk images against the host: every
//! selected image is downloaded into the storage root, sanity-checked, and
//! optionally loop-mounted read-only under the mount root.
//!
//! # Architecture
//!
//! - Observe-then-act: host state is re-read on every run, nothing is cached
//! - Idempotent: a converged host performs no downloads and no mounts
//! - Isolated: one image failing never blocks the others
//! - Narrow seams: network behind `Fetcher`, mount subsystem behind `MountBackend`

pub mod catalog;
pub mod config;
mod error;
pub mod filesystem;
pub mod mount;
pub mod reconcile;
pub mod store;

pub use catalog::{Catalog, CatalogEntry, CatalogSource, DesiredImageRef, ImageFormat};
pub use config::Manifest;
pub use error::{Error, ErrorKind, FetchFailure, Result};
pub use filesystem::Ownership;
pub use mount::{MountBackend, MountManager, MountState, SystemMounter};
pub use reconcile::{
    ImagePhase, ImageStatus, ReconcileOptions, ReconciliationResult, Reconciler, RunReport,
};
pub use store::{ArtifactState, ArtifactStore, Fetcher, HttpFetcher};
