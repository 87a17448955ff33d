// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `aicm queue` command implementations.

use std::io::IsTerminal;
use std::path::PathBuf;

use aicm_config::{ConfigStore, Settings, SettingsOverrides};
use aicm_core::AicmError;
use aicm_delivery::queue_store::{QueueEntry, QueueStore};

use crate::QueueCommand;

/// A command failure with its process exit code.
#[derive(Debug)]
pub struct CommandError {
    message: String,
    exit_code: u8,
}

impl CommandError {
    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<AicmError> for CommandError {
    fn from(err: AicmError) -> Self {
        let text = err.to_string();
        // SQLite reports contention as "database is locked" / "database is
        // busy"; everything else storage-shaped is an I/O failure.
        let exit_code = if text.contains("locked") || text.contains("busy") {
            3
        } else {
            2
        };
        Self {
            message: text,
            exit_code,
        }
    }
}

pub async fn run(command: QueueCommand) -> Result<(), CommandError> {
    match command {
        QueueCommand::Stats { db, json } => stats(db, json).await,
        QueueCommand::ListFailed { db, json, limit } => list_failed(db, json, limit).await,
        QueueCommand::RequeueFailed { db, ids } => requeue_failed(db, ids).await,
        QueueCommand::PurgeFailed { db, ids } => purge_failed(db, ids).await,
    }
}

/// Resolve the queue path the same way a tracker would: explicit flag,
/// then `AICM_DB_PATH`, then the `[tracker]` section, then the default.
fn resolve_db_path(db: Option<PathBuf>) -> Result<PathBuf, CommandError> {
    if let Some(path) = db {
        return Ok(path);
    }
    let store = ConfigStore::open(ConfigStore::default_path());
    let settings = Settings::resolve(&SettingsOverrides::default(), Some(&store))
        .map_err(CommandError::from)?;
    Ok(settings.effective_db_path())
}

async fn open_store(db: Option<PathBuf>) -> Result<QueueStore, CommandError> {
    let path = resolve_db_path(db)?;
    if !path.exists() {
        return Err(CommandError {
            message: format!("queue database not found: {}", path.display()),
            exit_code: 2,
        });
    }
    Ok(QueueStore::open(&path).await?)
}

async fn stats(db: Option<PathBuf>, json: bool) -> Result<(), CommandError> {
    let store = open_store(db).await?;
    let stats = store.stats().await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).unwrap_or_else(|_| "{}".to_string())
        );
        return Ok(());
    }

    let use_color = std::io::stdout().is_terminal();
    println!();
    println!("  queue stats");
    println!("  {}", "-".repeat(28));
    print_count("queued", stats.queued, use_color, false);
    print_count("inflight", stats.inflight, use_color, false);
    print_count("failed", stats.failed, use_color, stats.failed > 0);
    print_count("done", stats.done, use_color, false);
    println!("  {}", "-".repeat(28));
    println!("    total:    {}", stats.total());
    if stats.failed > 0 {
        println!();
        println!("  Inspect with: aicm queue list-failed");
    }
    println!();
    Ok(())
}

fn print_count(label: &str, count: i64, use_color: bool, highlight: bool) {
    if use_color && highlight {
        use colored::Colorize;
        println!("    {label:<9} {}", count.to_string().red());
    } else {
        println!("    {label:<9} {count}");
    }
}

async fn list_failed(db: Option<PathBuf>, json: bool, limit: usize) -> Result<(), CommandError> {
    let store = open_store(db).await?;
    let entries = store.list_failed(limit).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
        );
        return Ok(());
    }

    if entries.is_empty() {
        println!("no failed entries");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "#{}  attempts={}  error={}  payload={}",
            entry.id,
            entry.attempt_count,
            entry.last_error.as_deref().unwrap_or("-"),
            summarize_payload(entry),
        );
    }
    Ok(())
}

/// One line of payload, enough to identify the record.
fn summarize_payload(entry: &QueueEntry) -> String {
    serde_json::from_str::<serde_json::Value>(&entry.payload)
        .ok()
        .and_then(|v| {
            let obj = v.as_object()?;
            let service = obj.get("service_key")?.as_str()?.to_string();
            let response_id = obj.get("response_id")?.as_str()?.to_string();
            Some(format!("{service} ({response_id})"))
        })
        .unwrap_or_else(|| "<unparseable>".to_string())
}

async fn requeue_failed(db: Option<PathBuf>, ids: Option<Vec<i64>>) -> Result<(), CommandError> {
    let store = open_store(db).await?;
    let count = store.requeue_failed(ids).await?;
    println!("requeued {count} entries");
    Ok(())
}

async fn purge_failed(db: Option<PathBuf>, ids: Option<Vec<i64>>) -> Result<(), CommandError> {
    let store = open_store(db).await?;
    let count = store.purge_failed(ids).await?;
    println!("purged {count} entries");
    Ok(())
}
