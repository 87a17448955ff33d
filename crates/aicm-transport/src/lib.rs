// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP transport for the AICM tracking API.
//!
//! One [`TrackClient`] per tracker: it carries the connection pool, the
//! bearer credential, the in-call retry policy, and the hook that feeds
//! server-returned triggered limits back into the shared cache.

pub mod backoff;
pub mod client;
pub mod redact;
pub mod types;

pub use client::TrackClient;
pub use types::{ApiErrorBody, LimitsFetch, RecordResult, RecordStatus, TrackResponse};
