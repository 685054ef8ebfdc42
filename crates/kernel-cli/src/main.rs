// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! `kernelctl`: a thin wrapper over the durability and coordination kernel
//! (spec.md §0) — boots the orchestrator, prints its health report, and
//! exposes the maintenance sub-commands an operator needs between a crash
//! and the next autonomous run. Not a full agent-framework CLI; everything
//! the kernel itself does is in `kernel-runtime`/`kernel-storage`.

mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "kernelctl", version, about = "Operate the durability and coordination kernel")]
struct Cli {
    /// Output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the boot sequence and print the resulting health report.
    Boot {
        #[arg(long, default_value = "./kernel-data")]
        data_dir: PathBuf,
        /// Continue booting even if a P0 subsystem fails.
        #[arg(long)]
        allow_dev: bool,
    },
    /// Alias for `boot`: the kernel keeps no running daemon to query, so
    /// "status" just re-runs the boot sequence and reports the outcome.
    Status {
        #[arg(long, default_value = "./kernel-data")]
        data_dir: PathBuf,
        #[arg(long)]
        allow_dev: bool,
    },
    /// Re-run boot-time reconciliation over dedup entries left pending by
    /// a prior crash.
    Reconcile {
        #[arg(long, default_value = "./kernel-data")]
        data_dir: PathBuf,
        #[arg(long)]
        allow_dev: bool,
    },
    /// Lock-manager maintenance.
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
    /// Run one pass of the integrity check / restore cascade.
    Recover {
        /// Content root the manifest describes.
        #[arg(long)]
        root: PathBuf,
        /// Where the recovery engine's ed25519 signing key is persisted.
        #[arg(long, default_value = "./kernel-data/recovery.key")]
        key: PathBuf,
        /// A mounted durable-volume source, tried first.
        #[arg(long)]
        mount: Option<PathBuf>,
        /// A VCS remote to clone from, tried second (requires --vcs-ref).
        #[arg(long)]
        vcs_remote: Option<String>,
        #[arg(long)]
        vcs_ref: Option<String>,
        /// A packaged template tree, tried last.
        #[arg(long)]
        template: Option<PathBuf>,
    },
    /// Write-ahead log maintenance for the external issue tracker.
    Wal {
        #[command(subcommand)]
        command: WalCommand,
    },
}

#[derive(Subcommand)]
enum LocksCommand {
    /// Recover locks left behind by a process that died holding them.
    Recover {
        #[arg(long, default_value = "./kernel-data")]
        data_dir: PathBuf,
        #[arg(long)]
        allow_dev: bool,
    },
}

#[derive(Subcommand)]
enum WalCommand {
    /// Replay unapplied WAL entries against the real tracker binary.
    Replay {
        #[arg(long, default_value = "./kernel-data/wal")]
        wal_dir: PathBuf,
        /// Path to the external issue-tracker CLI binary.
        #[arg(long)]
        tracker_bin: String,
    },
}

impl Cli {
    fn format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    let cli = Cli::parse();
    let format = cli.format();

    match cli.command {
        Command::Boot { data_dir, allow_dev } => commands::boot::boot(data_dir, allow_dev, format),
        Command::Status { data_dir, allow_dev } => commands::boot::boot(data_dir, allow_dev, format),
        Command::Reconcile { data_dir, allow_dev } => commands::boot::reconcile(data_dir, allow_dev, format),
        Command::Locks { command: LocksCommand::Recover { data_dir, allow_dev } } => {
            commands::boot::locks_recover(data_dir, allow_dev, format)
        }
        Command::Recover { root, key, mount, vcs_remote, vcs_ref, template } => {
            commands::recover::recover(root, key, mount, vcs_remote, vcs_ref, template, format).await
        }
        Command::Wal { command: WalCommand::Replay { wal_dir, tracker_bin } } => commands::wal::replay(wal_dir, tracker_bin, format).await,
    }
}
