// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! walsnap - inspect, restore and stress-test live SQLite WAL snapshots.

mod list;
mod restore;
mod torture;

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use tracing::error;

use walsnap_config::WalsnapConfig;
use walsnap_core::WalsnapError;

/// walsnap - incremental, checksum-verified SQLite snapshots.
#[derive(Parser, Debug)]
#[command(name = "walsnap", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the standard locations.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the snapshots in a .dbsnap file or a directory of them.
    List {
        /// Repeat for more detail: versions, frames, frame digests.
        #[arg(short, long, action = ArgAction::Count)]
        verbose: u8,

        /// A .dbsnap file or a directory containing them.
        path: PathBuf,
    },
    /// Restore the databases recorded in a .dbsnap file or directory.
    Restore {
        /// Restore under this directory instead of the original paths.
        #[arg(short = 'O', long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Only report what would be restored.
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Overwrite existing files. Required to restore to original paths.
        #[arg(short, long)]
        force: bool,

        /// Restore the state as of this Unix time in seconds, or `latest`.
        #[arg(long, value_name = "UNIX_SECS|latest", value_parser = restore::parse_point_in_time)]
        at: Option<restore::PointInTime>,

        path: PathBuf,
    },
    /// Hammer a database with concurrent writers, readers and checkpoints,
    /// then verify that the latest snapshot restores to the same row count.
    Torture {
        /// Snapshot directory [default: <database>.snapshots].
        #[arg(short = 'S', long, value_name = "DIR")]
        snapshot_dir: Option<PathBuf>,

        /// How long to run, in seconds.
        #[arg(short, long, default_value_t = 10)]
        duration: u64,

        /// Maximum age of a full copy, in seconds [default: snapshot.full_delay_secs].
        #[arg(long, value_name = "SECS")]
        full_delay: Option<u64>,

        /// Worker threads (writers and readers, half each).
        #[arg(long, default_value_t = 4)]
        threads: usize,

        database: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => walsnap_config::load_and_validate_path(path),
        None => walsnap_config::load_and_validate(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(errors) => {
            walsnap_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    init_tracing(&config.log.level);

    if let Err(e) = run(cli.command, &config) {
        error!(error = %e, "command failed");
        eprintln!("walsnap: {e}");
        std::process::exit(1);
    }
}

fn run(command: Commands, config: &WalsnapConfig) -> Result<(), WalsnapError> {
    match command {
        Commands::List { verbose, path } => list::run_list(&path, verbose),
        Commands::Restore {
            output_dir,
            dry_run,
            force,
            at,
            path,
        } => restore::run_restore(
            &path,
            &restore::RestoreOptions {
                output_dir,
                dry_run,
                force,
                at,
            },
        ),
        Commands::Torture {
            snapshot_dir,
            duration,
            full_delay,
            threads,
            database,
        } => {
            let options = torture::TortureOptions {
                snapshot_dir,
                duration: Duration::from_secs(duration),
                full_delay: full_delay
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| config.snapshot.full_delay()),
                checkpoint_interval: config.snapshot.checkpoint_interval(),
                threads,
            };
            let report = torture::run_torture(&database, &options, &config.database)?;
            eprintln!("{report}");
            Ok(())
        }
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "walsnap={log_level},walsnap_storage={log_level},warn"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
