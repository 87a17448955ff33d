// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivery strategies for the AICM SDK.
//!
//! Three interchangeable strategies implement [`Delivery`]:
//!
//! - [`ImmediateDelivery`]: synchronous send on the caller's task.
//! - [`MemQueueDelivery`]: bounded in-memory queue, one background worker.
//! - [`PersistentDelivery`]: durable SQLite-backed queue that survives
//!   crashes and restarts.
//!
//! All three dispatch through one [`aicm_transport::TrackClient`], so retry
//! classification and triggered-limit refresh behave identically.

pub mod immediate;
pub mod mem_queue;
pub mod persistent;
pub mod queue_store;

use std::time::Duration;

use aicm_core::{AicmError, UsageRecord};
use aicm_transport::TrackResponse;
use async_trait::async_trait;
use serde::Serialize;

pub use immediate::ImmediateDelivery;
pub use mem_queue::{MemQueueDelivery, OverflowPolicy};
pub use persistent::PersistentDelivery;
pub use queue_store::{EntryStatus, QueueEntry, QueueStore};

/// Default bound on shutdown drain time.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// What happened to records handed to a strategy.
#[derive(Debug)]
pub enum DeliveryResult {
    /// Records were accepted for background delivery.
    Enqueued,
    /// Records were delivered synchronously; per-record results attached.
    Delivered(TrackResponse),
    /// Synchronous delivery failed terminally and `RAISE_ON_ERROR` is off.
    Failed { error: String },
}

/// Queue metrics for monitoring and tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryHealth {
    pub worker_alive: bool,
    /// Records currently waiting (and, for the durable queue, in flight).
    pub queued: u64,
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub discarded: u64,
    pub last_error: Option<String>,
}

/// A delivery strategy: the write side of the pipeline.
///
/// Records handed to a strategy are owned by it. Strategies are safe for
/// concurrent use from any number of producer tasks.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Accept one record.
    async fn enqueue(&self, record: UsageRecord) -> Result<DeliveryResult, AicmError>;

    /// Accept a batch. Queued strategies persist records individually;
    /// the immediate strategy sends the whole batch in one request.
    async fn enqueue_many(&self, records: Vec<UsageRecord>) -> Result<DeliveryResult, AicmError>;

    /// Wait until all accepted records have been dispatched, up to `deadline`.
    async fn flush(&self, deadline: Duration) -> Result<(), AicmError>;

    /// Stop accepting records and drain within `deadline`.
    async fn shutdown(&self, deadline: Duration) -> Result<(), AicmError>;

    /// Current queue metrics.
    async fn health(&self) -> DeliveryHealth;
}
