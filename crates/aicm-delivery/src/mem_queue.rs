// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded in-memory queue with a background worker.
//!
//! Producers append to a `VecDeque` guarded by an async mutex; one worker
//! task drains it in batches, flushing when `MAX_BATCH_SIZE` records have
//! accumulated or `BATCH_INTERVAL` has elapsed since the first record of the
//! window. There is no durability: a failed batch is retried in-process up
//! to `MAX_RETRIES` and then dropped with an error log.
//!
//! Overflow behavior is selectable per [`OverflowPolicy`]; the default
//! drops the oldest record and counts it as discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use aicm_config::Settings;
use aicm_core::{AicmError, UsageRecord};
use aicm_transport::backoff::queue_backoff;
use aicm_transport::{RecordStatus, TrackClient};
use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{Delivery, DeliveryHealth, DeliveryResult};

/// What a producer does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait until the worker frees space.
    Block,
    /// Discard the oldest queued record to make room.
    #[default]
    Backpressure,
    /// Fail the enqueue with [`AicmError::QueueFull`].
    Raise,
}

/// Hook invoked with each record discarded under
/// [`OverflowPolicy::Backpressure`].
pub type DiscardHook = Arc<dyn Fn(&UsageRecord) + Send + Sync>;

pub struct MemQueueDelivery {
    shared: Arc<Shared>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    queue: AsyncMutex<VecDeque<UsageRecord>>,
    capacity: usize,
    policy: OverflowPolicy,
    on_discard: Option<DiscardHook>,
    work_ready: Notify,
    space_freed: Notify,
    cancel: CancellationToken,
    closed: AtomicBool,
    in_flight: AtomicBool,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
    client: Arc<TrackClient>,
    max_batch_size: usize,
    batch_interval: Duration,
    max_retries: u32,
}

impl MemQueueDelivery {
    /// Build the queue and start its worker task.
    pub fn new(
        settings: &Settings,
        client: Arc<TrackClient>,
        policy: OverflowPolicy,
        on_discard: Option<DiscardHook>,
    ) -> Self {
        let delivery = Self::new_paused(settings, client, policy, on_discard);
        delivery.start_worker();
        delivery
    }

    /// Build the queue without a worker. Used by tests that need to observe
    /// producer-side behavior with the consumer stalled.
    pub(crate) fn new_paused(
        settings: &Settings,
        client: Arc<TrackClient>,
        policy: OverflowPolicy,
        on_discard: Option<DiscardHook>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: AsyncMutex::new(VecDeque::new()),
            capacity: settings.queue_size.max(1),
            policy,
            on_discard,
            work_ready: Notify::new(),
            space_freed: Notify::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            last_error: std::sync::Mutex::new(None),
            client,
            max_batch_size: settings.max_batch_size.max(1),
            batch_interval: settings.batch_interval_duration(),
            max_retries: settings.max_retries.max(1),
        });
        Self {
            shared,
            worker: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn start_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { run_worker(shared).await });
        *self.worker.lock().expect("worker lock") = Some(handle);
    }

    async fn enqueue_one(&self, record: UsageRecord) -> Result<(), AicmError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(AicmError::Closed);
        }
        let shared = &self.shared;
        let mut record = Some(record);
        loop {
            let space = shared.space_freed.notified();
            {
                let mut queue = shared.queue.lock().await;
                if queue.len() < shared.capacity {
                    queue.push_back(record.take().expect("record still pending"));
                    shared.enqueued.fetch_add(1, Ordering::Relaxed);
                    shared.work_ready.notify_one();
                    return Ok(());
                }
                match shared.policy {
                    OverflowPolicy::Raise => {
                        return Err(AicmError::QueueFull {
                            capacity: shared.capacity,
                        });
                    }
                    OverflowPolicy::Backpressure => {
                        let oldest = queue.pop_front().expect("queue at capacity");
                        shared.discarded.fetch_add(1, Ordering::Relaxed);
                        drop(queue);
                        warn!(
                            response_id = oldest.response_id(),
                            "queue full, discarding oldest record"
                        );
                        if let Some(hook) = &shared.on_discard {
                            hook(&oldest);
                        }
                        continue;
                    }
                    OverflowPolicy::Block => {}
                }
            }
            tokio::select! {
                _ = space => {}
                _ = shared.cancel.cancelled() => return Err(AicmError::Closed),
            }
        }
    }
}

#[async_trait]
impl Delivery for MemQueueDelivery {
    async fn enqueue(&self, record: UsageRecord) -> Result<DeliveryResult, AicmError> {
        self.enqueue_one(record).await?;
        Ok(DeliveryResult::Enqueued)
    }

    async fn enqueue_many(&self, records: Vec<UsageRecord>) -> Result<DeliveryResult, AicmError> {
        for record in records {
            self.enqueue_one(record).await?;
        }
        Ok(DeliveryResult::Enqueued)
    }

    async fn flush(&self, deadline: Duration) -> Result<(), AicmError> {
        let start = Instant::now();
        loop {
            let empty = self.shared.queue.lock().await.is_empty();
            if empty && !self.shared.in_flight.load(Ordering::Acquire) {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(AicmError::Timeout { duration: deadline });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), AicmError> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.cancel();
        self.shared.work_ready.notify_waiters();
        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            match tokio::time::timeout(deadline, handle).await {
                Ok(_) => debug!("memory queue worker drained"),
                Err(_) => {
                    warn!(
                        deadline_secs = deadline.as_secs_f64(),
                        "memory queue drain deadline exceeded, abandoning worker"
                    );
                }
            }
        }
        Ok(())
    }

    async fn health(&self) -> DeliveryHealth {
        let shared = &self.shared;
        let worker_alive = self
            .worker
            .lock()
            .expect("worker lock")
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        DeliveryHealth {
            worker_alive,
            queued: shared.queue.lock().await.len() as u64,
            enqueued: shared.enqueued.load(Ordering::Relaxed),
            delivered: shared.delivered.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            discarded: shared.discarded.load(Ordering::Relaxed),
            last_error: shared.last_error.lock().expect("last_error lock").clone(),
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    debug!("memory queue worker started");
    loop {
        let work = shared.work_ready.notified();
        let mut batch = take_batch(&shared).await;
        if batch.is_empty() {
            if shared.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = work => {}
                _ = shared.cancel.cancelled() => {}
            }
            continue;
        }

        // Batching window: top up until the batch fills or the interval ends.
        let window_end = Instant::now() + shared.batch_interval;
        while batch.len() < shared.max_batch_size
            && !shared.cancel.is_cancelled()
            && Instant::now() < window_end
        {
            let more = shared.work_ready.notified();
            top_up(&shared, &mut batch).await;
            if batch.len() >= shared.max_batch_size {
                break;
            }
            tokio::select! {
                _ = more => {}
                _ = tokio::time::sleep_until(window_end) => break,
                _ = shared.cancel.cancelled() => break,
            }
        }

        send_with_retry(&shared, batch, false).await;
    }

    // Drain whatever is left, one try per batch.
    loop {
        let batch = take_batch(&shared).await;
        if batch.is_empty() {
            break;
        }
        send_with_retry(&shared, batch, true).await;
    }
    debug!("memory queue worker stopped");
}

async fn take_batch(shared: &Shared) -> Vec<UsageRecord> {
    let mut queue = shared.queue.lock().await;
    let take = queue.len().min(shared.max_batch_size);
    let batch: Vec<UsageRecord> = queue.drain(..take).collect();
    if !batch.is_empty() {
        // Claimed under the queue lock so a flush never observes "empty
        // and idle" while a batch sits in the worker's hands.
        shared.in_flight.store(true, Ordering::Release);
        shared.space_freed.notify_waiters();
    }
    batch
}

async fn top_up(shared: &Shared, batch: &mut Vec<UsageRecord>) {
    let mut queue = shared.queue.lock().await;
    let room = shared.max_batch_size - batch.len();
    let take = queue.len().min(room);
    if take > 0 {
        batch.extend(queue.drain(..take));
        shared.space_freed.notify_waiters();
    }
}

async fn send_with_retry(shared: &Shared, batch: Vec<UsageRecord>, draining: bool) {
    shared.in_flight.store(true, Ordering::Release);
    let count = batch.len() as u64;
    let tries = if draining { 1 } else { shared.max_retries };

    for attempt in 1..=tries {
        match shared.client.send_batch(&batch).await {
            Ok(response) => {
                let rejected = response
                    .results
                    .iter()
                    .filter(|r| r.status == RecordStatus::Rejected)
                    .count() as u64;
                shared
                    .delivered
                    .fetch_add(count - rejected, Ordering::Relaxed);
                shared.failed.fetch_add(rejected, Ordering::Relaxed);
                shared.in_flight.store(false, Ordering::Release);
                return;
            }
            Err(err) if err.is_retryable() && attempt < tries => {
                *shared.last_error.lock().expect("last_error lock") = Some(err.to_string());
                let delay = queue_backoff(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "batch delivery failed, will retry"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.cancel.cancelled() => {
                        // Give the batch one last chance on the next loop
                        // iteration rather than sleeping through shutdown.
                    }
                }
            }
            Err(err) => {
                *shared.last_error.lock().expect("last_error lock") = Some(err.to_string());
                shared.failed.fetch_add(count, Ordering::Relaxed);
                error!(records = count, error = %err, "dropping undeliverable batch");
                break;
            }
        }
    }
    shared.in_flight.store(false, Ordering::Release);
}
