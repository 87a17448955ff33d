// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public facade of the AICM usage tracking SDK.
//!
//! ```no_run
//! use aicm_tracker::Tracker;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), aicm_core::AicmError> {
//! let tracker = Tracker::builder()
//!     .api_key("sk-...")
//!     .build()
//!     .await?;
//!
//! tracker
//!     .track(
//!         "openai::gpt-4o-mini",
//!         json!({"input_tokens": 10, "output_tokens": 20}),
//!     )
//!     .await?;
//!
//! tracker.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod tracker;

pub use tracker::{TrackOptions, TrackRequest, TrackResult, TrackStatus, Tracker, TrackerBuilder};

// Re-export the pieces callers commonly need alongside the tracker.
pub use aicm_config::{DeliveryType, Settings, SettingsOverrides};
pub use aicm_core::{AicmError, SchemaSet, UsageRecord, UsageSchema};
pub use aicm_delivery::{Delivery, DeliveryHealth, OverflowPolicy};
pub use aicm_limits::{ThresholdType, TriggeredLimit};
