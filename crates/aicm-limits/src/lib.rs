// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Triggered usage limits: model, matching, and the shared cache.
//!
//! Limits are issued by the server (in `/track` responses and from the
//! `/triggered-limits` endpoint), cached here, and enforced by the tracker
//! after each record has been handed to its delivery strategy.

pub mod cache;
pub mod model;

pub use cache::{LoadOutcome, TriggeredLimitCache};
pub use model::{ThresholdType, TriggeredLimit};
