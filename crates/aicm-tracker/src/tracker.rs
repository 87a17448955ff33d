// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The public tracker facade.
//!
//! A [`Tracker`] owns one delivery strategy, one HTTP transport, and one
//! triggered-limit cache for its lifetime. `track` builds a record,
//! validates it, hands it to the strategy, and only then consults the
//! limit cache: observed usage is never dropped because of local
//! enforcement, so [`AicmError::LimitExceeded`] means "the record was
//! accepted AND a limit is tripped".

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use aicm_config::{ConfigStore, DeliveryType, Settings, SettingsOverrides};
use aicm_core::{AicmError, SchemaSet, UsageRecord};
use aicm_delivery::mem_queue::DiscardHook;
use aicm_delivery::{
    DEFAULT_SHUTDOWN_DEADLINE, Delivery, DeliveryHealth, DeliveryResult, ImmediateDelivery,
    MemQueueDelivery, OverflowPolicy, PersistentDelivery,
};
use aicm_limits::{LoadOutcome, TriggeredLimitCache};
use aicm_transport::{RecordStatus, TrackClient};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Disposition of one tracked record as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackStatus {
    /// Accepted by a queued strategy; delivery happens in the background.
    Accepted,
    /// Delivered synchronously and accepted by the server.
    Delivered,
    /// The server does not know this service key; the record will not be
    /// retried.
    ServiceKeyUnknown,
    /// The server permanently rejected the record.
    Rejected,
    /// Synchronous delivery failed terminally (`RAISE_ON_ERROR` off).
    Failed(String),
}

/// Per-record result returned by `track` and `track_batch`.
#[derive(Debug, Clone)]
pub struct TrackResult {
    pub response_id: String,
    pub status: TrackStatus,
    /// Server-side cost event identifier, when delivery was synchronous.
    pub cost_event_id: Option<String>,
}

/// Optional per-call fields for `track`.
#[derive(Debug, Default)]
pub struct TrackOptions {
    pub response_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub customer_key: Option<String>,
    pub context: Option<Map<String, Value>>,
    pub api_id: Option<String>,
}

/// One entry of a `track_batch` call.
#[derive(Debug)]
pub struct TrackRequest {
    pub service_key: String,
    pub usage: Value,
    pub options: TrackOptions,
}

impl TrackRequest {
    pub fn new(service_key: impl Into<String>, usage: Value) -> Self {
        Self {
            service_key: service_key.into(),
            usage,
            options: TrackOptions::default(),
        }
    }
}

/// Builder for [`Tracker`].
pub struct TrackerBuilder {
    overrides: SettingsOverrides,
    store_path: Option<PathBuf>,
    use_store: bool,
    schemas: SchemaSet,
    delivery: Option<Arc<dyn Delivery>>,
    overflow_policy: OverflowPolicy,
    on_discard: Option<DiscardHook>,
    customer_key: Option<String>,
    context: Option<Map<String, Value>>,
}

impl TrackerBuilder {
    fn new() -> Self {
        Self {
            overrides: SettingsOverrides::default(),
            store_path: None,
            use_store: true,
            schemas: SchemaSet::new(),
            delivery: None,
            overflow_policy: OverflowPolicy::default(),
            on_discard: None,
            customer_key: None,
            context: None,
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.overrides.api_key = Some(key.into());
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.overrides.api_base = Some(base.into());
        self
    }

    pub fn delivery_type(mut self, delivery_type: DeliveryType) -> Self {
        self.overrides.delivery_type = Some(delivery_type);
        self
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides.db_path = Some(path.into());
        self
    }

    /// Replace the whole override set (for callers that assemble one).
    pub fn settings(mut self, overrides: SettingsOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Use a configuration store at `path` instead of the default location.
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self.use_store = true;
        self
    }

    /// Run without a configuration store: no cached limits, no INI layer.
    pub fn without_store(mut self) -> Self {
        self.use_store = false;
        self
    }

    /// Per-service usage schemas. Absence of a schema means no validation.
    pub fn schemas(mut self, schemas: SchemaSet) -> Self {
        self.schemas = schemas;
        self
    }

    /// Use a prebuilt delivery strategy instead of constructing one from
    /// `DELIVERY_TYPE`. This is also the explicit way to share a strategy
    /// between trackers.
    pub fn delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Overflow behavior of the in-memory queued strategy.
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Hook invoked for each record discarded under backpressure.
    pub fn on_discard(mut self, hook: DiscardHook) -> Self {
        self.on_discard = Some(hook);
        self
    }

    /// Tracker-wide default customer key.
    pub fn customer_key(mut self, key: impl Into<String>) -> Self {
        self.customer_key = Some(key.into());
        self
    }

    /// Tracker-wide default context.
    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    pub async fn build(self) -> Result<Tracker, AicmError> {
        let store = if self.use_store {
            Some(ConfigStore::open(
                self.store_path.unwrap_or_else(ConfigStore::default_path),
            ))
        } else {
            None
        };
        let settings = Settings::resolve(&self.overrides, store.as_ref())?;
        let cache = Arc::new(TriggeredLimitCache::new(store));
        let load = cache.load_from_store_if_empty();
        let client = Arc::new(TrackClient::new(&settings, Arc::clone(&cache))?);

        if load == LoadOutcome::ChecksumMismatch {
            // The local mirror is unusable; ask the server for the
            // authoritative set off the construction path.
            let refresh_client = Arc::clone(&client);
            tokio::spawn(async move {
                if let Err(err) = refresh_client.fetch_limits().await {
                    warn!(error = %err, "background triggered-limits refresh failed");
                }
            });
        }

        let delivery: Arc<dyn Delivery> = match self.delivery {
            Some(delivery) => delivery,
            None => match settings.effective_delivery_type() {
                DeliveryType::Immediate => Arc::new(ImmediateDelivery::new(
                    Arc::clone(&client),
                    settings.raise_on_error,
                )),
                DeliveryType::MemQueue => Arc::new(MemQueueDelivery::new(
                    &settings,
                    Arc::clone(&client),
                    self.overflow_policy,
                    self.on_discard,
                )),
                DeliveryType::PersistentQueue => Arc::new(
                    PersistentDelivery::new(&settings, Arc::clone(&client)).await?,
                ),
            },
        };

        Ok(Tracker {
            settings,
            schemas: self.schemas,
            delivery,
            cache,
            client,
            api_key_id: RwLock::new(None),
            default_customer_key: RwLock::new(self.customer_key),
            default_context: RwLock::new(self.context),
            closed: AtomicBool::new(false),
        })
    }
}

/// Usage tracker: the single entry point of the SDK.
///
/// Safe for concurrent use from any number of tasks; wrap it in an `Arc`
/// to share. Call [`Tracker::close`] before dropping to drain queued
/// strategies.
pub struct Tracker {
    settings: Settings,
    schemas: SchemaSet,
    delivery: Arc<dyn Delivery>,
    cache: Arc<TriggeredLimitCache>,
    client: Arc<TrackClient>,
    api_key_id: RwLock<Option<String>>,
    default_customer_key: RwLock<Option<String>>,
    default_context: RwLock<Option<Map<String, Value>>>,
    closed: AtomicBool,
}

impl Tracker {
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Set the tracker-wide default customer key.
    pub fn set_customer_key(&self, key: impl Into<String>) {
        *self.default_customer_key.write().expect("defaults lock") = Some(key.into());
    }

    /// Set the tracker-wide default context. Per-call contexts replace this
    /// wholesale; they are never merged.
    pub fn set_context(&self, context: Map<String, Value>) {
        *self.default_context.write().expect("defaults lock") = Some(context);
    }

    /// Tell the tracker its server-side API key id, narrowing limit checks
    /// to that scope. Without it, all cached limits are considered.
    pub fn set_api_key_id(&self, api_key_id: impl Into<String>) {
        *self.api_key_id.write().expect("api_key_id lock") = Some(api_key_id.into());
    }

    /// Track one usage measurement.
    pub async fn track(&self, service_key: &str, usage: Value) -> Result<TrackResult, AicmError> {
        self.track_with(service_key, usage, TrackOptions::default())
            .await
    }

    /// Track one usage measurement with per-call options.
    pub async fn track_with(
        &self,
        service_key: &str,
        usage: Value,
        options: TrackOptions,
    ) -> Result<TrackResult, AicmError> {
        self.ensure_open()?;
        let record = self.build_record(service_key, usage, options)?;
        let response_id = record.response_id().to_string();
        let customer_key = record.customer_key().map(str::to_owned);

        let outcome = self.delivery.enqueue(record).await?;
        let result = self.to_track_result(response_id, outcome);
        self.enforce_limits(service_key, customer_key.as_deref(), &result)?;
        Ok(result)
    }

    /// Track a batch.
    ///
    /// Queued strategies persist records individually (a crash loses at
    /// most the un-fsynced tail); the immediate strategy sends the whole
    /// batch in one atomic request. Limit enforcement runs per record after
    /// the batch has been accepted.
    pub async fn track_batch(
        &self,
        requests: Vec<TrackRequest>,
    ) -> Result<Vec<TrackResult>, AicmError> {
        self.ensure_open()?;
        let mut records = Vec::with_capacity(requests.len());
        for request in requests {
            records.push(self.build_record(
                &request.service_key,
                request.usage,
                request.options,
            )?);
        }
        let scope: Vec<(String, String, Option<String>)> = records
            .iter()
            .map(|r| {
                (
                    r.response_id().to_string(),
                    r.service_key().to_string(),
                    r.customer_key().map(str::to_owned),
                )
            })
            .collect();

        let outcome = self.delivery.enqueue_many(records).await?;
        let results: Vec<TrackResult> = match outcome {
            DeliveryResult::Enqueued => scope
                .iter()
                .map(|(response_id, _, _)| TrackResult {
                    response_id: response_id.clone(),
                    status: TrackStatus::Accepted,
                    cost_event_id: None,
                })
                .collect(),
            DeliveryResult::Delivered(response) => scope
                .iter()
                .map(|(response_id, _, _)| {
                    self.to_track_result(
                        response_id.clone(),
                        DeliveryResult::Delivered(response.clone()),
                    )
                })
                .collect(),
            DeliveryResult::Failed { error } => scope
                .iter()
                .map(|(response_id, _, _)| TrackResult {
                    response_id: response_id.clone(),
                    status: TrackStatus::Failed(error.clone()),
                    cost_event_id: None,
                })
                .collect(),
        };

        for ((_, service_key, customer_key), result) in scope.iter().zip(&results) {
            self.enforce_limits(service_key, customer_key.as_deref(), result)?;
        }
        Ok(results)
    }

    /// Blocking wrapper around [`Tracker::track`].
    ///
    /// Must be called from outside the async runtime (a plain thread).
    pub fn track_blocking(
        &self,
        handle: &tokio::runtime::Handle,
        service_key: &str,
        usage: Value,
    ) -> Result<TrackResult, AicmError> {
        handle.block_on(self.track(service_key, usage))
    }

    /// Blocking wrapper around [`Tracker::track_batch`].
    pub fn track_batch_blocking(
        &self,
        handle: &tokio::runtime::Handle,
        requests: Vec<TrackRequest>,
    ) -> Result<Vec<TrackResult>, AicmError> {
        handle.block_on(self.track_batch(requests))
    }

    /// Force a refresh of the triggered-limit cache from the server.
    pub async fn refresh_triggered_limits(&self) -> Result<(), AicmError> {
        self.ensure_open()?;
        self.client.fetch_limits().await.map(|_| ())
    }

    /// Wait until the delivery strategy has dispatched everything accepted
    /// so far.
    pub async fn flush(&self, deadline: Duration) -> Result<(), AicmError> {
        self.ensure_open()?;
        self.delivery.flush(deadline).await
    }

    /// Current delivery metrics.
    pub async fn health(&self) -> DeliveryHealth {
        self.delivery.health().await
    }

    /// Close with the default 30 s drain deadline.
    pub async fn close(&self) -> Result<(), AicmError> {
        self.close_within(DEFAULT_SHUTDOWN_DEADLINE).await
    }

    /// Signal shutdown and block until the strategy drained or `deadline`
    /// passed. Idempotent; all tracking calls fail with
    /// [`AicmError::Closed`] afterwards.
    pub async fn close_within(&self, deadline: Duration) -> Result<(), AicmError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("tracker closing");
        self.delivery.shutdown(deadline).await
    }

    fn ensure_open(&self) -> Result<(), AicmError> {
        if self.closed.load(Ordering::Acquire) {
            Err(AicmError::Closed)
        } else {
            Ok(())
        }
    }

    fn build_record(
        &self,
        service_key: &str,
        usage: Value,
        options: TrackOptions,
    ) -> Result<UsageRecord, AicmError> {
        let mut builder = UsageRecord::builder(service_key, usage);
        if let Some(response_id) = options.response_id {
            builder = builder.response_id(response_id);
        }
        if let Some(timestamp) = options.timestamp {
            builder = builder.timestamp(timestamp);
        }
        if let Some(customer_key) = options.customer_key {
            builder = builder.customer_key(customer_key);
        }
        if let Some(context) = options.context {
            builder = builder.context(context);
        }
        if let Some(api_id) = options.api_id {
            builder = builder.api_id(api_id);
        }
        let mut record = builder.build();
        // Validation sees the sanitized payload the server would see.
        self.schemas.validate(service_key, record.usage())?;
        record.apply_defaults(
            self.default_customer_key
                .read()
                .expect("defaults lock")
                .as_deref(),
            self.default_context
                .read()
                .expect("defaults lock")
                .as_ref(),
        );
        Ok(record)
    }

    fn to_track_result(&self, response_id: String, outcome: DeliveryResult) -> TrackResult {
        match outcome {
            DeliveryResult::Enqueued => TrackResult {
                response_id,
                status: TrackStatus::Accepted,
                cost_event_id: None,
            },
            DeliveryResult::Delivered(response) => match response.result_for(&response_id) {
                Some(result) => TrackResult {
                    response_id,
                    status: match result.status {
                        RecordStatus::Queued => TrackStatus::Delivered,
                        RecordStatus::ServiceKeyUnknown => TrackStatus::ServiceKeyUnknown,
                        RecordStatus::Rejected => TrackStatus::Rejected,
                    },
                    cost_event_id: result.cost_event_id.clone(),
                },
                None => TrackResult {
                    response_id,
                    status: TrackStatus::Delivered,
                    cost_event_id: None,
                },
            },
            DeliveryResult::Failed { error } => TrackResult {
                response_id,
                status: TrackStatus::Failed(error),
                cost_event_id: None,
            },
        }
    }

    /// Post-acceptance limit enforcement.
    ///
    /// Skipped for records the server reported as `service_key_unknown`:
    /// no limit can be scoped to a key the server does not know.
    fn enforce_limits(
        &self,
        service_key: &str,
        customer_key: Option<&str>,
        result: &TrackResult,
    ) -> Result<(), AicmError> {
        if !self.settings.limits_enabled || result.status == TrackStatus::ServiceKeyUnknown {
            return Ok(());
        }
        let api_key_id = self.api_key_id.read().expect("api_key_id lock").clone();
        if let Some(limit) = self
            .cache
            .check(api_key_id.as_deref(), service_key, customer_key)
        {
            return Err(AicmError::LimitExceeded {
                limit_id: limit.limit_id,
                service_key: limit.service_key,
                customer_key: limit.customer_key,
            });
        }
        Ok(())
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            debug!("tracker dropped without close(); queued records may still be draining");
        }
    }
}
