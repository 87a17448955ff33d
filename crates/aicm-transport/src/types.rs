// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire types for the `/track` and `/triggered-limits` endpoints.

use aicm_limits::TriggeredLimit;
use serde::{Deserialize, Serialize};

/// Server-side disposition of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Accepted for cost processing.
    Queued,
    /// The service key is not registered; the record will not be retried.
    ServiceKeyUnknown,
    /// Permanently rejected.
    Rejected,
}

impl RecordStatus {
    /// Whether the record is settled from the queue's point of view.
    ///
    /// `service_key_unknown` counts as delivered: retrying cannot change
    /// the outcome and the server has already recorded the attempt.
    pub fn is_delivered(self) -> bool {
        matches!(self, RecordStatus::Queued | RecordStatus::ServiceKeyUnknown)
    }
}

/// Per-record entry in a `/track` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResult {
    pub response_id: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_event_id: Option<String>,
}

/// Parsed 2xx `/track` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackResponse {
    #[serde(default)]
    pub results: Vec<RecordResult>,
    /// Authoritative limit set. `Some(vec![])` clears the local cache;
    /// an absent field leaves it untouched.
    #[serde(default)]
    pub triggered_limits: Option<Vec<TriggeredLimit>>,
}

impl TrackResponse {
    /// Look up the result for one record by idempotency key.
    pub fn result_for(&self, response_id: &str) -> Option<&RecordResult> {
        self.results.iter().find(|r| r.response_id == response_id)
    }
}

/// Structured 4xx error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// Outcome of a conditional `/triggered-limits` fetch.
#[derive(Debug, Clone)]
pub enum LimitsFetch {
    /// 304: the cached set is still current.
    Unchanged,
    /// Fresh limit list, with the response ETag when the server sent one.
    Fetched {
        limits: Vec<TriggeredLimit>,
        etag: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_status_parses_wire_values() {
        let status: RecordStatus = serde_json::from_str(r#""service_key_unknown""#).unwrap();
        assert_eq!(status, RecordStatus::ServiceKeyUnknown);
        assert!(status.is_delivered());
        let rejected: RecordStatus = serde_json::from_str(r#""rejected""#).unwrap();
        assert!(!rejected.is_delivered());
    }

    #[test]
    fn track_response_distinguishes_empty_and_absent_limits() {
        let with_empty: TrackResponse =
            serde_json::from_str(r#"{"results": [], "triggered_limits": []}"#).unwrap();
        assert_eq!(with_empty.triggered_limits.as_deref(), Some(&[][..]));

        let absent: TrackResponse = serde_json::from_str(r#"{"results": []}"#).unwrap();
        assert!(absent.triggered_limits.is_none());
    }

    #[test]
    fn result_lookup_by_response_id() {
        let response: TrackResponse = serde_json::from_str(
            r#"{"results": [
                {"response_id": "r1", "status": "queued", "cost_event_id": "ce-9"},
                {"response_id": "r2", "status": "rejected"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            response.result_for("r1").unwrap().cost_event_id.as_deref(),
            Some("ce-9")
        );
        assert_eq!(
            response.result_for("r2").unwrap().status,
            RecordStatus::Rejected
        );
        assert!(response.result_for("r3").is_none());
    }
}
