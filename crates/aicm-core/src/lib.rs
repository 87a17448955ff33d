// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core types for the AICM usage tracking SDK.
//!
//! This crate defines the error type, the [`UsageRecord`] model with its
//! deterministic wire serialization, payload normalization, and the optional
//! per-service usage schemas. Everything else in the workspace builds on
//! these types.

pub mod error;
pub mod record;
pub mod sanitize;
pub mod schema;
pub mod usage;

pub use error::AicmError;
pub use record::{UsageRecord, UsageRecordBuilder};
pub use schema::{FieldKind, FieldSpec, SchemaSet, UsageSchema};
pub use usage::UsageSource;
