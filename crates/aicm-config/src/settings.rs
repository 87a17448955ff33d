// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layered settings resolution.
//!
//! Values merge from four sources, highest precedence first: explicit
//! constructor overrides, `AICM_`-prefixed environment variables, the
//! `[tracker]` section of the configuration store, and built-in defaults.
//! Figment does the merging; INI values go through the same string
//! inference as environment variables so `TIMEOUT=5` extracts as a float.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use aicm_core::AicmError;
use figment::providers::{Env, Serialized};
use figment::value::Value as FigmentValue;
use figment::Figment;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::store::ConfigStore;

/// Which delivery strategy a tracker constructs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryType {
    /// Synchronous send on the caller's task.
    Immediate,
    /// Bounded in-memory queue with a background worker.
    MemQueue,
    /// Durable on-disk queue with a background worker.
    PersistentQueue,
}

/// Immutable resolved settings for one tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Bearer credential for the tracking API. Required before any HTTP call.
    pub api_key: Option<String>,
    /// Scheme and host of the server.
    pub api_base: String,
    /// Path prefix under `api_base`.
    pub api_url: String,
    /// Explicit strategy selection; `None` derives from `db_path`.
    pub delivery_type: Option<DeliveryType>,
    /// Durable queue location; `None` falls back to `~/.cache/aicm/queue.db`.
    pub db_path: Option<PathBuf>,
    /// Per-HTTP-request timeout, seconds.
    pub timeout: f64,
    /// Durable queue poll cadence, seconds.
    pub poll_interval: f64,
    /// Max wait before flushing a partial batch, seconds.
    pub batch_interval: f64,
    /// HTTP-level attempts within one delivery try.
    pub max_attempts: u32,
    /// Reschedule attempts for queued entries.
    pub max_retries: u32,
    /// Capacity of the in-memory bounded queue.
    pub queue_size: usize,
    /// Records per outbound POST.
    pub max_batch_size: usize,
    /// Immediate strategy raises on final failure instead of logging.
    pub raise_on_error: bool,
    /// Whether triggered limits are enforced at track time.
    pub limits_enabled: bool,
    /// Log verbosity for the SDK's tracing targets.
    pub log_level: String,
    /// Log request/response bodies (after redaction).
    pub log_bodies: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://aicostmanager.com".to_string(),
            api_url: "/api/v1".to_string(),
            delivery_type: None,
            db_path: None,
            timeout: 10.0,
            poll_interval: 0.1,
            batch_interval: 0.5,
            max_attempts: 3,
            max_retries: 5,
            queue_size: 10_000,
            max_batch_size: 100,
            raise_on_error: false,
            limits_enabled: false,
            log_level: "INFO".to_string(),
            log_bodies: false,
        }
    }
}

impl Settings {
    /// Resolve settings from overrides, environment, store, and defaults.
    pub fn resolve(
        overrides: &SettingsOverrides,
        store: Option<&ConfigStore>,
    ) -> Result<Self, AicmError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(store) = store {
            figment = figment.merge(Serialized::defaults(infer_section(
                store.section("tracker")?,
            )));
        }
        figment
            .merge(Env::prefixed("AICM_"))
            .merge(Serialized::defaults(overrides.clone()))
            .extract()
            .map_err(|e| AicmError::Config(e.to_string()))
    }

    /// The selected strategy: explicit value, else `PersistentQueue` when a
    /// queue path was supplied by any source, else `Immediate`.
    pub fn effective_delivery_type(&self) -> DeliveryType {
        match self.delivery_type {
            Some(t) => t,
            None if self.db_path.is_some() => DeliveryType::PersistentQueue,
            None => DeliveryType::Immediate,
        }
    }

    /// Durable queue location with the conventional default applied.
    pub fn effective_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("aicm")
                .join("queue.db")
        })
    }

    pub fn track_url(&self) -> String {
        format!("{}/track", self.api_root())
    }

    pub fn limits_url(&self) -> String {
        format!("{}/triggered-limits", self.api_root())
    }

    fn api_root(&self) -> String {
        format!(
            "{}{}",
            self.api_base.trim_end_matches('/'),
            self.api_url.trim_end_matches('/')
        )
    }

    pub fn require_api_key(&self) -> Result<&str, AicmError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                AicmError::Config(
                    "api_key is required (set AICM_API_KEY or [tracker] API_KEY)".to_string(),
                )
            })
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    pub fn batch_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.batch_interval)
    }

    /// Window after which an INFLIGHT queue entry is reclaimed.
    pub fn inflight_reclaim(&self) -> Duration {
        self.timeout_duration()
            .saturating_mul(2)
            .max(Duration::from_secs(60))
    }

    /// Tracing filter directive for the SDK's targets, e.g. `aicm=debug`.
    ///
    /// Hosts that install their own subscriber can merge this into an
    /// `EnvFilter` to honor the `LOG_LEVEL` setting.
    pub fn log_directive(&self) -> String {
        format!("aicm={}", self.log_level.to_ascii_lowercase())
    }
}

/// Partial settings supplied by the tracker constructor.
///
/// Only set fields participate in the merge, so an unset field never masks
/// lower-precedence sources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SettingsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_type: Option<DeliveryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raise_on_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_bodies: Option<bool>,
}

/// Convert a `[tracker]` section into figment values with the same string
/// inference the `Env` provider applies, keyed by lowercased setting name.
fn infer_section(section: BTreeMap<String, String>) -> BTreeMap<String, FigmentValue> {
    section
        .into_iter()
        .map(|(key, value)| {
            let inferred = value
                .parse::<FigmentValue>()
                .unwrap_or(FigmentValue::from(value));
            (key.to_ascii_lowercase(), inferred)
        })
        .collect()
}
