// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite store behind the durable delivery queue.
//!
//! WAL journal with `synchronous=FULL`: an enqueue that returns has been
//! fsynced. All access goes through tokio-rusqlite's single background
//! thread; multi-process sharing is safe because claims run inside
//! immediate transactions with a busy timeout.
//!
//! `next_attempt_at` doubles as the status-transition timestamp for
//! INFLIGHT and DONE rows, which is what the reclaim scan and the DONE
//! vacuum key on.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use aicm_core::AicmError;
use chrono::Utc;
use rusqlite::{TransactionBehavior, params, params_from_iter};
use serde::Serialize;
use strum::{Display, EnumString};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Lifecycle state of a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Queued,
    Inflight,
    Failed,
    Done,
}

/// A durable queue row.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub created_at: i64,
    pub next_attempt_at: i64,
    pub attempt_count: i64,
    pub status: EntryStatus,
    pub payload: String,
    pub last_error: Option<String>,
}

/// Row counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub inflight: i64,
    pub failed: i64,
    pub done: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.queued + self.inflight + self.failed + self.done
    }
}

fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> AicmError {
    AicmError::Storage {
        source: Box::new(e),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Handle to the queue database.
pub struct QueueStore {
    conn: Connection,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore").finish_non_exhaustive()
    }
}

impl QueueStore {
    /// Open (creating if needed) the queue database at `path`.
    ///
    /// Creates parent directories, applies PRAGMAs, and runs embedded
    /// migrations.
    pub async fn open(path: &Path) -> Result<Self, AicmError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| AicmError::Storage {
                source: Box::new(e),
            })?;
        }
        let conn = Connection::open(path).await.map_err(|e| AicmError::Storage {
            source: Box::new(e),
        })?;
        conn.call(
            |conn| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "FULL")?;
                conn.pragma_update(None, "busy_timeout", 5000)?;
                embedded::migrations::runner().run(conn)?;
                Ok(())
            },
        )
        .await
        .map_err(|e| AicmError::Storage {
            source: Box::new(std::io::Error::other(e.to_string())),
        })?;
        debug!(path = %path.display(), "queue store opened");
        Ok(Self { conn })
    }

    /// Append a payload. The row is fsynced before this returns.
    pub async fn enqueue(&self, payload: String) -> Result<i64, AicmError> {
        let now = now_ms();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue (created_at, next_attempt_at, attempt_count, status, payload)
                     VALUES (?1, ?2, 0, 'QUEUED', ?3)",
                    params![now, now, payload],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Atomically claim up to `limit` eligible rows, marking them INFLIGHT.
    ///
    /// The immediate transaction prevents two workers (including workers in
    /// other processes) from claiming the same rows.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>, AicmError> {
        let now = now_ms();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut entries = {
                    let mut stmt = tx.prepare(
                        "SELECT id, created_at, next_attempt_at, attempt_count, status, payload, last_error
                         FROM queue
                         WHERE status = 'QUEUED' AND next_attempt_at <= ?1
                         ORDER BY id
                         LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![now, limit as i64], row_to_entry)?;
                    rows.collect::<Result<Vec<QueueEntry>, rusqlite::Error>>()?
                };
                for entry in &entries {
                    tx.execute(
                        "UPDATE queue SET status = 'INFLIGHT', next_attempt_at = ?1 WHERE id = ?2",
                        params![now, entry.id],
                    )?;
                }
                tx.commit()?;
                for entry in &mut entries {
                    entry.status = EntryStatus::Inflight;
                    entry.next_attempt_at = now;
                }
                Ok(entries)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Settle delivered rows.
    pub async fn mark_done(&self, ids: Vec<i64>) -> Result<(), AicmError> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        self.conn
            .call(move |conn| {
                let placeholders = placeholders(ids.len());
                let sql = format!(
                    "UPDATE queue SET status = 'DONE', next_attempt_at = {now}, last_error = NULL
                     WHERE id IN ({placeholders})"
                );
                conn.execute(&sql, params_from_iter(ids.iter()))?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Put a row back in line after a retryable failure.
    pub async fn reschedule(
        &self,
        id: i64,
        attempt_count: i64,
        delay: Duration,
        last_error: String,
    ) -> Result<(), AicmError> {
        let next = now_ms() + delay.as_millis() as i64;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE queue
                     SET status = 'QUEUED', attempt_count = ?1, next_attempt_at = ?2, last_error = ?3
                     WHERE id = ?4",
                    params![attempt_count, next, last_error, id],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Quarantine a row after a permanent failure or exhausted retries.
    pub async fn mark_failed(&self, id: i64, last_error: String) -> Result<(), AicmError> {
        let now = now_ms();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE queue
                     SET status = 'FAILED', next_attempt_at = ?1, last_error = ?2,
                         attempt_count = attempt_count + 1
                     WHERE id = ?3",
                    params![now, last_error, id],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Revert INFLIGHT rows whose claim is older than `window` to QUEUED.
    ///
    /// Run at startup and periodically; recovers rows abandoned by a
    /// crashed or aborted worker.
    pub async fn reclaim_inflight(&self, window: Duration) -> Result<usize, AicmError> {
        let cutoff = now_ms() - window.as_millis() as i64;
        let reclaimed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE queue SET status = 'QUEUED'
                     WHERE status = 'INFLIGHT' AND next_attempt_at <= ?1",
                    params![cutoff],
                )?;
                Ok(changed)
            })
            .await
            .map_err(map_tr_err)?;
        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed stale in-flight queue entries");
        }
        Ok(reclaimed)
    }

    /// Delete DONE rows older than `retention`. Records the sweep time in
    /// the `meta` table.
    pub async fn vacuum_done(&self, retention: Duration) -> Result<usize, AicmError> {
        let now = now_ms();
        let cutoff = now - retention.as_millis() as i64;
        self.conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM queue WHERE status = 'DONE' AND next_attempt_at <= ?1",
                    params![cutoff],
                )?;
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('last_vacuum_at', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![now.to_string()],
                )?;
                Ok(deleted)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Row counts by status.
    pub async fn stats(&self) -> Result<QueueStats, AicmError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM queue GROUP BY status")?;
                let counts = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<BTreeMap<String, i64>, rusqlite::Error>>()?;
                let get = |status: &str| counts.get(status).copied().unwrap_or(0);
                Ok(QueueStats {
                    queued: get("QUEUED"),
                    inflight: get("INFLIGHT"),
                    failed: get("FAILED"),
                    done: get("DONE"),
                })
            })
            .await
            .map_err(map_tr_err)
    }

    /// QUEUED plus INFLIGHT: the rows a flush is waiting on.
    pub async fn pending_count(&self) -> Result<i64, AicmError> {
        let stats = self.stats().await?;
        Ok(stats.queued + stats.inflight)
    }

    /// Projection of FAILED rows for operators.
    pub async fn list_failed(&self, limit: usize) -> Result<Vec<QueueEntry>, AicmError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, created_at, next_attempt_at, attempt_count, status, payload, last_error
                     FROM queue WHERE status = 'FAILED' ORDER BY id LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_entry)?;
                rows.collect::<Result<Vec<QueueEntry>, rusqlite::Error>>()
            })
            .await
            .map_err(map_tr_err)
    }

    /// Reset FAILED rows (all, or just `ids`) to QUEUED with a fresh
    /// attempt budget.
    pub async fn requeue_failed(&self, ids: Option<Vec<i64>>) -> Result<usize, AicmError> {
        let now = now_ms();
        self.conn
            .call(move |conn| {
                let changed = match ids {
                    Some(ids) if ids.is_empty() => 0,
                    Some(ids) => {
                        let sql = format!(
                            "UPDATE queue
                             SET status = 'QUEUED', attempt_count = 0, next_attempt_at = {now},
                                 last_error = NULL
                             WHERE status = 'FAILED' AND id IN ({})",
                            placeholders(ids.len())
                        );
                        conn.execute(&sql, params_from_iter(ids.iter()))?
                    }
                    None => conn.execute(
                        "UPDATE queue
                         SET status = 'QUEUED', attempt_count = 0, next_attempt_at = ?1,
                             last_error = NULL
                         WHERE status = 'FAILED'",
                        params![now],
                    )?,
                };
                Ok(changed)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Hard-delete FAILED rows (all, or just `ids`).
    pub async fn purge_failed(&self, ids: Option<Vec<i64>>) -> Result<usize, AicmError> {
        self.conn
            .call(move |conn| {
                let deleted = match ids {
                    Some(ids) if ids.is_empty() => 0,
                    Some(ids) => {
                        let sql = format!(
                            "DELETE FROM queue WHERE status = 'FAILED' AND id IN ({})",
                            placeholders(ids.len())
                        );
                        conn.execute(&sql, params_from_iter(ids.iter()))?
                    }
                    None => conn.execute("DELETE FROM queue WHERE status = 'FAILED'", [])?,
                };
                Ok(deleted)
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn close(self) -> Result<(), AicmError> {
        self.conn.close().await.map_err(|e| AicmError::Storage {
            source: Box::new(e),
        })
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<QueueEntry, rusqlite::Error> {
    let status_text: String = row.get(4)?;
    let status = status_text.parse::<EntryStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(QueueEntry {
        id: row.get(0)?,
        created_at: row.get(1)?,
        next_attempt_at: row.get(2)?,
        attempt_count: row.get(3)?,
        status,
        payload: row.get(5)?,
        last_error: row.get(6)?,
    })
}
