// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `aicm` - operator CLI for the AICM tracking SDK.
//!
//! The `queue` subcommands open the durable delivery queue in the same WAL
//! mode as a running worker, so inspection and repair are safe next to a
//! live process.
//!
//! Exit codes: 0 success, 1 usage error, 2 I/O error, 3 lock contention.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod queue;

/// AICM usage tracking toolkit.
#[derive(Parser, Debug)]
#[command(name = "aicm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and repair the durable delivery queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Show entry counts by status.
    Stats {
        /// Queue database path (defaults to the configured DB_PATH).
        #[arg(long)]
        db: Option<PathBuf>,
        /// Emit JSON for scripting.
        #[arg(long)]
        json: bool,
    },
    /// List failed entries.
    ListFailed {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        /// Maximum entries to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Put failed entries back in line with a fresh attempt budget.
    RequeueFailed {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Entry ids (comma separated). Omit to requeue all failed entries.
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,
    },
    /// Permanently delete failed entries.
    PurgeFailed {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Entry ids (comma separated). Omit to purge all failed entries.
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version requests are not usage errors.
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    let result = match cli.command {
        Commands::Queue { command } => queue::run(command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("aicm: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
