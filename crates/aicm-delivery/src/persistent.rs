// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable on-disk queued delivery.
//!
//! Enqueue writes the record to the SQLite queue (fsynced) and returns; a
//! background worker claims batches, posts them, and settles each row from
//! the server's per-record results. Rows survive crashes: INFLIGHT rows
//! abandoned by a dead worker are reclaimed after the inflight window, and
//! FAILED rows wait for the `aicm queue` maintenance tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use aicm_config::Settings;
use aicm_core::{AicmError, UsageRecord};
use aicm_transport::backoff::queue_backoff;
use aicm_transport::{RecordStatus, TrackClient};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::queue_store::{QueueEntry, QueueStore};
use crate::{Delivery, DeliveryHealth, DeliveryResult};

/// Cadence of the reclaim + vacuum sweep inside the worker.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// DONE rows older than this are garbage-collected.
const DONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

pub struct PersistentDelivery {
    shared: Arc<Shared>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    store: Arc<QueueStore>,
    client: Arc<TrackClient>,
    cancel: CancellationToken,
    closed: AtomicBool,
    work_ready: Notify,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
    poll_interval: Duration,
    batch_interval: Duration,
    max_batch_size: usize,
    max_retries: i64,
    inflight_reclaim: Duration,
}

impl PersistentDelivery {
    /// Open the queue at the settings' `DB_PATH`, recover crashed state,
    /// and start the worker.
    pub async fn new(settings: &Settings, client: Arc<TrackClient>) -> Result<Self, AicmError> {
        let delivery = Self::new_paused(settings, client).await?;
        delivery.start_worker();
        Ok(delivery)
    }

    /// Open without a worker. Lets tests (and the maintenance tool's dry
    /// runs) stage entries with dispatch stalled.
    pub(crate) async fn new_paused(
        settings: &Settings,
        client: Arc<TrackClient>,
    ) -> Result<Self, AicmError> {
        let store = Arc::new(QueueStore::open(&settings.effective_db_path()).await?);

        // Startup scan: recover rows a previous worker abandoned, and point
        // operators at anything quarantined.
        store.reclaim_inflight(settings.inflight_reclaim()).await?;
        let stats = store.stats().await?;
        if stats.failed > 0 {
            warn!(
                count = stats.failed,
                "queue contains failed entries; inspect with `aicm queue list-failed`"
            );
        }

        let shared = Arc::new(Shared {
            store,
            client,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            work_ready: Notify::new(),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: std::sync::Mutex::new(None),
            poll_interval: settings.poll_interval_duration(),
            batch_interval: settings.batch_interval_duration(),
            max_batch_size: settings.max_batch_size.max(1),
            max_retries: i64::from(settings.max_retries.max(1)),
            inflight_reclaim: settings.inflight_reclaim(),
        });
        Ok(Self {
            shared,
            worker: std::sync::Mutex::new(None),
        })
    }

    pub(crate) fn start_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { run_worker(shared).await });
        *self.worker.lock().expect("worker lock") = Some(handle);
    }

    /// The underlying queue store (shared with the maintenance tool in
    /// tests).
    pub fn store(&self) -> &Arc<QueueStore> {
        &self.shared.store
    }

    async fn enqueue_one(&self, record: &UsageRecord) -> Result<(), AicmError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(AicmError::Closed);
        }
        let payload = serde_json::to_string(&record.to_wire())
            .map_err(|e| AicmError::Internal(format!("cannot serialize record: {e}")))?;
        let id = self.shared.store.enqueue(payload).await?;
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.work_ready.notify_one();
        debug!(id, response_id = record.response_id(), "record enqueued");
        Ok(())
    }
}

#[async_trait]
impl Delivery for PersistentDelivery {
    async fn enqueue(&self, record: UsageRecord) -> Result<DeliveryResult, AicmError> {
        self.enqueue_one(&record).await?;
        Ok(DeliveryResult::Enqueued)
    }

    /// Each record is enqueued in its own transaction, so a crash mid-batch
    /// loses at most the records not yet fsynced.
    async fn enqueue_many(&self, records: Vec<UsageRecord>) -> Result<DeliveryResult, AicmError> {
        for record in &records {
            self.enqueue_one(record).await?;
        }
        Ok(DeliveryResult::Enqueued)
    }

    async fn flush(&self, deadline: Duration) -> Result<(), AicmError> {
        let start = Instant::now();
        loop {
            if self.shared.store.pending_count().await? == 0 {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(AicmError::Timeout { duration: deadline });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), AicmError> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.cancel();
        self.shared.work_ready.notify_waiters();
        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            match tokio::time::timeout(deadline, handle).await {
                Ok(_) => debug!("persistent queue worker stopped"),
                Err(_) => warn!(
                    deadline_secs = deadline.as_secs_f64(),
                    "persistent queue worker did not stop in time; \
                     in-flight rows will be reclaimed on next startup"
                ),
            }
        }
        Ok(())
    }

    async fn health(&self) -> DeliveryHealth {
        let pending = self.shared.store.pending_count().await.unwrap_or(0);
        DeliveryHealth {
            worker_alive: self
                .worker
                .lock()
                .expect("worker lock")
                .as_ref()
                .is_some_and(|h| !h.is_finished()),
            queued: pending.max(0) as u64,
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            discarded: 0,
            last_error: self
                .shared
                .last_error
                .lock()
                .expect("last_error lock")
                .clone(),
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    debug!("persistent queue worker started");
    let mut last_maintenance = Instant::now();
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        if last_maintenance.elapsed() >= MAINTENANCE_INTERVAL {
            if let Err(err) = shared.store.reclaim_inflight(shared.inflight_reclaim).await {
                warn!(error = %err, "inflight reclaim failed");
            }
            if let Err(err) = shared.store.vacuum_done(DONE_RETENTION).await {
                warn!(error = %err, "done-row vacuum failed");
            }
            last_maintenance = Instant::now();
        }

        let work = shared.work_ready.notified();
        let mut batch = match shared.store.claim_batch(shared.max_batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "queue claim failed");
                tokio::time::sleep(shared.poll_interval).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = work => {}
                _ = tokio::time::sleep(shared.poll_interval) => {}
                _ = shared.cancel.cancelled() => {}
            }
            continue;
        }

        // Give a partial batch one chance to fill before dispatch.
        if batch.len() < shared.max_batch_size && !shared.batch_interval.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(shared.batch_interval) => {}
                _ = shared.cancel.cancelled() => {}
            }
            if let Ok(more) = shared
                .store
                .claim_batch(shared.max_batch_size - batch.len())
                .await
            {
                batch.extend(more);
            }
        }

        dispatch(&shared, batch).await;
    }
    debug!("persistent queue worker stopped");
}

async fn dispatch(shared: &Shared, batch: Vec<QueueEntry>) {
    // Rows whose payload no longer parses can never be delivered.
    let mut sendable: Vec<(QueueEntry, UsageRecord)> = Vec::with_capacity(batch.len());
    for entry in batch {
        let parsed = serde_json::from_str::<serde_json::Value>(&entry.payload)
            .map_err(|e| AicmError::Internal(e.to_string()))
            .and_then(|v| UsageRecord::from_wire(&v));
        match parsed {
            Ok(record) => sendable.push((entry, record)),
            Err(err) => {
                error!(id = entry.id, error = %err, "unparseable queue payload");
                settle_failed(shared, entry.id, format!("unparseable payload: {err}")).await;
            }
        }
    }
    if sendable.is_empty() {
        return;
    }

    let records: Vec<UsageRecord> = sendable.iter().map(|(_, r)| r.clone()).collect();
    match shared.client.send_batch(&records).await {
        Ok(response) => {
            let mut done_ids = Vec::with_capacity(sendable.len());
            for (entry, record) in &sendable {
                match response.result_for(record.response_id()) {
                    Some(result) if result.status == RecordStatus::Rejected => {
                        settle_failed(shared, entry.id, "rejected by server".to_string()).await;
                    }
                    // Queued, service_key_unknown, or no per-record entry:
                    // the server has accepted the batch; retrying cannot
                    // improve the outcome.
                    _ => {
                        done_ids.push(entry.id);
                    }
                }
            }
            let count = done_ids.len() as u64;
            if let Err(err) = shared.store.mark_done(done_ids).await {
                warn!(error = %err, "failed to settle delivered rows");
            } else {
                shared.delivered.fetch_add(count, Ordering::Relaxed);
            }
        }
        Err(err) => {
            let message = err.to_string();
            *shared.last_error.lock().expect("last_error lock") = Some(message.clone());
            let retryable = err.is_retryable();
            for (entry, _) in &sendable {
                let attempts = entry.attempt_count + 1;
                if !retryable || attempts >= shared.max_retries {
                    settle_failed(shared, entry.id, message.clone()).await;
                } else {
                    let delay = queue_backoff(attempts as u32);
                    if let Err(store_err) = shared
                        .store
                        .reschedule(entry.id, attempts, delay, message.clone())
                        .await
                    {
                        warn!(id = entry.id, error = %store_err, "failed to reschedule row");
                    }
                }
            }
            warn!(
                records = sendable.len(),
                retryable,
                error = %message,
                "batch dispatch failed"
            );
        }
    }
}

async fn settle_failed(shared: &Shared, id: i64, message: String) {
    if let Err(err) = shared.store.mark_failed(id, message).await {
        warn!(id, error = %err, "failed to quarantine row");
    } else {
        shared.failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_store::EntryStatus;
    use aicm_limits::TriggeredLimitCache;
    use serde_json::json;
    use std::path::Path;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer, db_path: &Path) -> Settings {
        Settings {
            api_key: Some("sk-test".to_string()),
            api_base: server.uri(),
            db_path: Some(db_path.to_path_buf()),
            max_attempts: 1,
            max_retries: 2,
            poll_interval: 0.02,
            batch_interval: 0.02,
            ..Settings::default()
        }
    }

    fn client(settings: &Settings) -> Arc<TrackClient> {
        Arc::new(
            TrackClient::new(settings, Arc::new(TriggeredLimitCache::new(None))).unwrap(),
        )
    }

    fn record(id: &str) -> UsageRecord {
        UsageRecord::builder("openai::gpt-4o-mini", json!({"input_tokens": 1}))
            .response_id(id)
            .build()
    }

    async fn wait_until(mut predicate: impl AsyncFnMut() -> bool) {
        for _ in 0..300 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn records_survive_restart_and_deliver_once() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("queue.db");
        let settings = settings(&server, &db_path);

        // First incarnation: enqueue, then "crash" before any dispatch.
        {
            let delivery = PersistentDelivery::new_paused(&settings, client(&settings))
                .await
                .unwrap();
            delivery.enqueue(record("r3")).await.unwrap();
        }

        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"response_id": "r3", "status": "queued"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        // Second incarnation points at the same file and delivers.
        let delivery = PersistentDelivery::new(&settings, client(&settings))
            .await
            .unwrap();
        wait_until(async || delivery.store().stats().await.unwrap().done == 1).await;
        delivery.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_records_are_quarantined() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&server, &dir.path().join("queue.db"));

        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"response_id": "ok", "status": "queued"},
                    {"response_id": "bad", "status": "rejected"}
                ]
            })))
            .mount(&server)
            .await;

        let delivery = PersistentDelivery::new(&settings, client(&settings))
            .await
            .unwrap();
        delivery.enqueue(record("ok")).await.unwrap();
        delivery.enqueue(record("bad")).await.unwrap();

        wait_until(async || {
            let stats = delivery.store().stats().await.unwrap();
            stats.done == 1 && stats.failed == 1
        })
        .await;

        let failed = delivery.store().list_failed(10).await.unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("rejected by server"));
        delivery.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn service_key_unknown_is_not_retried() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&server, &dir.path().join("queue.db"));

        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"response_id": "r1", "status": "service_key_unknown"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let delivery = PersistentDelivery::new(&settings, client(&settings))
            .await
            .unwrap();
        delivery.enqueue(record("r1")).await.unwrap();
        wait_until(async || delivery.store().stats().await.unwrap().done == 1).await;
        delivery.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn permanent_rejection_fails_whole_batch() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&server, &dir.path().join("queue.db"));

        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "detail": "bad payload", "code": "invalid"
            })))
            .mount(&server)
            .await;

        let delivery = PersistentDelivery::new(&settings, client(&settings))
            .await
            .unwrap();
        delivery.enqueue(record("r1")).await.unwrap();
        wait_until(async || delivery.store().stats().await.unwrap().failed == 1).await;

        let failed = delivery.store().list_failed(10).await.unwrap();
        assert!(failed[0].last_error.as_deref().unwrap().contains("bad payload"));
        delivery.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_reschedule_then_quarantine() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&server, &dir.path().join("queue.db"));

        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let delivery = PersistentDelivery::new(&settings, client(&settings))
            .await
            .unwrap();
        delivery.enqueue(record("r1")).await.unwrap();

        // max_retries = 2: one reschedule, then FAILED.
        wait_until(async || delivery.store().stats().await.unwrap().failed == 1).await;
        let failed = delivery.store().list_failed(10).await.unwrap();
        assert_eq!(failed[0].attempt_count, 2);
        delivery.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&server, &dir.path().join("queue.db"));
        let delivery = PersistentDelivery::new(&settings, client(&settings))
            .await
            .unwrap();
        delivery.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            delivery.enqueue(record("r1")).await.unwrap_err(),
            AicmError::Closed
        ));
    }

    #[tokio::test]
    async fn flush_waits_for_pending_rows() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&server, &dir.path().join("queue.db"));

        Mock::given(method("POST"))
            .and(path("/api/v1/track"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"response_id": "r1", "status": "queued"}]
            })))
            .mount(&server)
            .await;

        let delivery = PersistentDelivery::new(&settings, client(&settings))
            .await
            .unwrap();
        delivery.enqueue(record("r1")).await.unwrap();
        delivery.flush(Duration::from_secs(10)).await.unwrap();
        let stats = delivery.store().stats().await.unwrap();
        assert_eq!(stats.queued + stats.inflight, 0);
        assert_eq!(stats.done, 1);
        delivery.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn paused_queue_accumulates_without_dispatch() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&server, &dir.path().join("queue.db"));

        let delivery = PersistentDelivery::new_paused(&settings, client(&settings))
            .await
            .unwrap();
        delivery.enqueue(record("r1")).await.unwrap();
        delivery.enqueue(record("r2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = delivery.store().stats().await.unwrap();
        assert_eq!(stats.queued, 2);
        assert!(server.received_requests().await.unwrap().is_empty());
        let claimed = delivery.store().claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|e| e.status == EntryStatus::Inflight));
    }
}
