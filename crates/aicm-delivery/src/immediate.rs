// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous delivery on the caller's task.
//!
//! No background state: each call is one `/track` POST (with the
//! transport's in-call retries). Final failures either raise or are logged
//! and reported as a structured result, per `RAISE_ON_ERROR`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aicm_core::{AicmError, UsageRecord};
use aicm_transport::TrackClient;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

use crate::{Delivery, DeliveryHealth, DeliveryResult};

pub struct ImmediateDelivery {
    client: Arc<TrackClient>,
    raise_on_error: bool,
    delivered: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ImmediateDelivery {
    pub fn new(client: Arc<TrackClient>, raise_on_error: bool) -> Self {
        Self {
            client,
            raise_on_error,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Delivery for ImmediateDelivery {
    async fn enqueue(&self, record: UsageRecord) -> Result<DeliveryResult, AicmError> {
        self.enqueue_many(vec![record]).await
    }

    async fn enqueue_many(&self, records: Vec<UsageRecord>) -> Result<DeliveryResult, AicmError> {
        let count = records.len() as u64;
        match self.client.send_batch(&records).await {
            Ok(response) => {
                self.delivered.fetch_add(count, Ordering::Relaxed);
                Ok(DeliveryResult::Delivered(response))
            }
            Err(err) => {
                self.failed.fetch_add(count, Ordering::Relaxed);
                let message = err.to_string();
                *self.last_error.lock().expect("last_error lock") = Some(message.clone());
                if self.raise_on_error {
                    Err(err)
                } else {
                    error!(error = %err, records = count, "immediate delivery failed");
                    Ok(DeliveryResult::Failed { error: message })
                }
            }
        }
    }

    async fn flush(&self, _deadline: Duration) -> Result<(), AicmError> {
        // Nothing buffered; every enqueue completed synchronously.
        Ok(())
    }

    async fn shutdown(&self, _deadline: Duration) -> Result<(), AicmError> {
        Ok(())
    }

    async fn health(&self) -> DeliveryHealth {
        DeliveryHealth {
            worker_alive: true,
            queued: 0,
            enqueued: self.delivered.load(Ordering::Relaxed)
                + self.failed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: 0,
            last_error: self.last_error.lock().expect("last_error lock").clone(),
        }
    }
}
