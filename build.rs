// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn manifest_arg() -> Arg {
    Arg::new("manifest")
        .short('m')
        .long("manifest")
        .value_name("PATH")
        .default_value("/etc/isomgr/manifest.json")
        .help("Desired-state manifest (JSON)")
}

fn build_cli() -> Command {
    Command::new("isomgr")
        .version(env!("CARGO_PKG_VERSION"))
        .author("isomgr Contributors")
        .about("Idempotent provisioning of read-only disk images: fetch, verify and loop-mount")
        .subcommand_required(false)
        .arg(
            Arg::new("unprivileged")
                .long("unprivileged")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Own managed paths as the invoking user instead of root"),
        )
        .subcommand(
            Command::new("apply")
                .about("Fetch, verify and mount every selected image")
                .arg(manifest_arg())
                .arg(
                    Arg::new("no_mount")
                        .long("no-mount")
                        .action(ArgAction::SetTrue)
                        .help("Stop after fetching, do not mount"),
                )
                .arg(
                    Arg::new("storage_root")
                        .long("storage-root")
                        .value_name("DIR")
                        .help("Directory holding image files"),
                )
                .arg(
                    Arg::new("mount_root")
                        .long("mount-root")
                        .value_name("DIR")
                        .help("Directory holding per-image mount points"),
                )
                .arg(
                    Arg::new("workers")
                        .short('j')
                        .long("workers")
                        .value_name("N")
                        .help("Images reconciled concurrently"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("SECS")
                        .help("Per-image download timeout"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the run report as JSON"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show observed state of every selected image without changing anything")
                .arg(manifest_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print status as JSON"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Validate the manifest without touching the host")
                .arg(manifest_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell to generate completions for"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("isomgr.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
