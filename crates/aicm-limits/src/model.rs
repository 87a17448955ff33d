// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Triggered-limit events as issued by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Severity of a triggered limit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdType {
    /// Informational; tracking continues.
    Warning,
    /// Hard limit; matching records raise after delivery.
    Limit,
}

/// A server-issued assertion that a usage scope passed a threshold.
///
/// Scoping fields (`service_key`, `customer_key`) are wildcards when null:
/// a limit with no `service_key` applies to every service under its
/// `api_key_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredLimit {
    pub limit_id: String,
    pub threshold_type: ThresholdType,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub period: Option<String>,
    pub api_key_id: String,
    #[serde(default)]
    pub service_key: Option<String>,
    #[serde(default)]
    pub customer_key: Option<String>,
    #[serde(default)]
    pub config_id_list: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TriggeredLimit {
    /// Whether this limit applies to a record with the given scope fields.
    ///
    /// Every non-null scoping field on the limit must equal the record's
    /// corresponding field; an expired limit never matches.
    pub fn matches(
        &self,
        api_key_id: &str,
        service_key: &str,
        customer_key: Option<&str>,
    ) -> bool {
        if self.is_expired(Utc::now()) {
            return false;
        }
        if self.api_key_id != api_key_id {
            return false;
        }
        if let Some(limit_service) = &self.service_key
            && limit_service != service_key
        {
            return false;
        }
        if let Some(limit_customer) = &self.customer_key
            && Some(limit_customer.as_str()) != customer_key
        {
            return false;
        }
        true
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_blocking(&self) -> bool {
        self.threshold_type == ThresholdType::Limit
    }
}
