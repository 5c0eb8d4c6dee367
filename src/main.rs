// src/main.rs

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use isomgr::{
    ArtifactStore, HttpFetcher, ImagePhase, ImageStatus, Manifest, MountManager, Ownership,
    ReconcileOptions, Reconciler, RunReport, SystemMounter,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const DEFAULT_MANIFEST: &str = "/etc/isomgr/manifest.json";

#[derive(Parser)]
#[command(name = "isomgr")]
#[command(author, version, about = "Idempotent provisioning of read-only disk images: fetch, verify and loop-mount", long_about = None)]
struct Cli {
    /// Own managed paths as the invoking user instead of root
    #[arg(long, global = true)]
    unprivileged: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct ManifestArgs {
    /// Desired-state manifest (JSON)
    #[arg(short, long, default_value = DEFAULT_MANIFEST)]
    manifest: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, verify and mount every selected image
    Apply {
        #[command(flatten)]
        manifest: ManifestArgs,
        /// Stop after fetching, do not mount
        #[arg(long)]
        no_mount: bool,
        /// Directory holding image files
        #[arg(long, value_name = "DIR")]
        storage_root: Option<PathBuf>,
        /// Directory holding per-image mount points
        #[arg(long, value_name = "DIR")]
        mount_root: Option<PathBuf>,
        /// Images reconciled concurrently
        #[arg(short = 'j', long, value_name = "N")]
        workers: Option<usize>,
        /// Per-image download timeout
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show observed state of every selected image without changing anything
    Status {
        #[command(flatten)]
        manifest: ManifestArgs,
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the manifest without touching the host
    Check {
        #[command(flatten)]
        manifest: ManifestArgs,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Wire the library services together from a manifest
fn build_reconciler(manifest: &Manifest, owner: Ownership) -> Result<Reconciler> {
    let store = ArtifactStore::new(&manifest.storage_root, owner)
        .with_min_image_bytes(manifest.min_image_bytes)
        .with_partial_grace(manifest.fetch_timeout());
    let mounts = MountManager::new(&manifest.mount_root, owner, Arc::new(SystemMounter::new()));
    let fetcher = HttpFetcher::new(manifest.fetch_timeout())?;

    Ok(Reconciler::new(
        manifest.catalog(),
        store,
        mounts,
        Arc::new(fetcher),
        ReconcileOptions {
            mount_enabled: manifest.mount_enabled,
            workers: manifest.workers,
        },
    ))
}

fn print_report(report: &RunReport) {
    println!("Reconciled {} image(s):", report.results.len());
    for result in &report.results {
        let mut actions = Vec::new();
        if result.fetched {
            actions.push("fetched");
        }
        if result.mounted {
            actions.push("mounted");
        }
        let actions = if actions.is_empty() {
            "no changes".to_string()
        } else {
            actions.join(", ")
        };

        match (&result.phase, &result.error) {
            (ImagePhase::Failed, Some(failure)) => {
                println!("  {} FAILED [{:?}] {}", result.name, failure.kind, failure.message);
            }
            (phase, _) => println!("  {} {:?} ({})", result.name, phase, actions),
        }
        for warning in &result.warnings {
            println!("    warning: {}", warning);
        }
    }

    if !report.unsafe_paths.is_empty() {
        println!("\nUnsafe permissions detected:");
        for path in &report.unsafe_paths {
            println!("  {}", path.display());
        }
    }

    println!(
        "\nTotal: {} fetched, {} mounted, {} failed",
        report.fetch_count(),
        report.mount_count(),
        report.failed_count()
    );
}

fn print_status(statuses: &[ImageStatus]) {
    if statuses.is_empty() {
        println!("No images selected.");
        return;
    }
    for status in statuses {
        print!("  {}", status.name);
        if let Some(failure) = &status.error {
            println!(" ERROR [{:?}] {}", failure.kind, failure.message);
            continue;
        }
        match &status.artifact {
            Some(artifact) if artifact.exists => print!(
                " file: {} bytes, mode {:o}, owner {}:{}{}",
                artifact.size_bytes,
                artifact.mode,
                artifact.uid,
                artifact.gid,
                if status.plausible { "" } else { " (implausible)" }
            ),
            _ => print!(" file: missing"),
        }
        match &status.mount {
            Some(mount) if mount.mounted => print!(
                ", mounted {} ({})",
                mount.filesystem_type.as_deref().unwrap_or("unknown"),
                mount.options.iter().cloned().collect::<Vec<_>>().join(",")
            ),
            Some(_) => print!(", not mounted"),
            None => {}
        }
        println!();
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let owner = if cli.unprivileged {
        Ownership::current()
    } else {
        Ownership::root()
    };

    match cli.command {
        Some(Commands::Apply {
            manifest,
            no_mount,
            storage_root,
            mount_root,
            workers,
            timeout,
            json,
        }) => {
            let mut manifest = Manifest::load(&manifest.manifest)?;
            if no_mount {
                manifest.mount_enabled = false;
            }
            if let Some(storage_root) = storage_root {
                manifest.storage_root = storage_root;
            }
            if let Some(mount_root) = mount_root {
                manifest.mount_root = mount_root;
            }
            if let Some(workers) = workers {
                manifest.workers = workers;
            }
            if let Some(timeout) = timeout {
                manifest.fetch_timeout_secs = timeout;
            }
            manifest.check_settings()?;

            info!(
                "Applying {} selected image(s) into {}",
                manifest.provision.len(),
                manifest.storage_root.display()
            );
            let reconciler = build_reconciler(&manifest, owner)?;
            let report = reconciler.run(&manifest.provision)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if let Err(e) = report.status() {
                eprintln!("Error: {}", e);
                std::process::exit(report.exit_code());
            }
            Ok(())
        }
        Some(Commands::Status { manifest, json }) => {
            let manifest = Manifest::load(&manifest.manifest)?;
            let reconciler = build_reconciler(&manifest, owner)?;
            let statuses = reconciler.observe(&manifest.provision);

            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print_status(&statuses);
            }
            Ok(())
        }
        Some(Commands::Check { manifest }) => {
            let manifest = Manifest::load(&manifest.manifest)?;
            let catalog = manifest.catalog();
            let entries = catalog.validate()?;
            let selected = catalog.resolve(&manifest.provision)?;

            println!("Catalog: {} image(s) valid", entries.len());
            for entry in &selected {
                println!(
                    "  {} -> {} (mount point {})",
                    entry.name,
                    manifest.storage_root.join(entry.file_name()).display(),
                    manifest.mount_root.join(entry.mount_dir_name()).display()
                );
            }
            println!("\nTotal: {} image(s) selected", selected.len());
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "isomgr", &mut io::stdout());
            Ok(())
        }
        None => {
            // No command provided, show help
            println!("isomgr v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'isomgr --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags_parse() {
        let cli = Cli::try_parse_from([
            "isomgr",
            "apply",
            "--manifest",
            "/tmp/m.json",
            "--no-mount",
            "-j",
            "2",
            "--unprivileged",
        ])
        .unwrap();
        assert!(cli.unprivileged);
        match cli.command {
            Some(Commands::Apply {
                manifest,
                no_mount,
                workers,
                ..
            }) => {
                assert_eq!(manifest.manifest, PathBuf::from("/tmp/m.json"));
                assert!(no_mount);
                assert_eq!(workers, Some(2));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_completions_accept_every_shell() {
        for shell in ["bash", "elvish", "fish", "powershell", "zsh"] {
            let cli = Cli::try_parse_from(["isomgr", "completions", shell]).unwrap();
            assert!(matches!(cli.command, Some(Commands::Completions { .. })));
        }
    }

    #[test]
    fn test_manifest_default_path() {
        let cli = Cli::try_parse_from(["isomgr", "check"]).unwrap();
        match cli.command {
            Some(Commands::Check { manifest }) => {
                assert_eq!(manifest.manifest, PathBuf::from(DEFAULT_MANIFEST));
            }
            _ => panic!("expected check"),
        }
    }
}
