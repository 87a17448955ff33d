// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the AICM tracking SDK.

use thiserror::Error;

/// The primary error type used across all AICM crates.
#[derive(Debug, Error)]
pub enum AicmError {
    /// Configuration errors (missing API key, unparseable setting, bad URL).
    #[error("configuration error: {0}")]
    Config(String),

    /// A write to the configuration store failed. Recoverable; callers may retry.
    #[error("config persist error: {message}")]
    ConfigPersist {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A usage payload failed schema validation. Never retried.
    #[error("usage validation failed for {service_key}: {} missing, {} extra, {} type errors", missing.len(), extra.len(), type_errors.len())]
    Validation {
        service_key: String,
        missing: Vec<String>,
        extra: Vec<String>,
        type_errors: Vec<String>,
    },

    /// Network, TLS, timeout, HTTP 5xx, or 429 failures. Retried per policy.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        retryable: bool,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Structured 4xx rejection from the server. Not retried; the record is dropped.
    #[error("server rejected request ({status}): {detail}")]
    ServerRejected {
        status: u16,
        detail: String,
        code: Option<String>,
    },

    /// A previously triggered usage limit matched this record.
    ///
    /// Raised after the record has been accepted by the delivery strategy,
    /// so no usage data is lost to local enforcement.
    #[error("usage limit {limit_id} exceeded")]
    LimitExceeded {
        limit_id: String,
        service_key: Option<String>,
        customer_key: Option<String>,
    },

    /// In-memory queue overflow in `raise` mode.
    #[error("delivery queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Operation on a tracker that has been closed.
    #[error("tracker is closed")]
    Closed,

    /// Durable queue storage errors (database open, query failure).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AicmError {
    /// Whether a delivery attempt that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            AicmError::Transport { retryable, .. } => *retryable,
            AicmError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Shorthand for a retryable transport error without a source.
    pub fn transport(message: impl Into<String>) -> Self {
        AicmError::Transport {
            message: message.into(),
            retryable: true,
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_message_counts_lists() {
        let err = AicmError::Validation {
            service_key: "openai::gpt-4o-mini".into(),
            missing: vec!["input_tokens".into()],
            extra: vec![],
            type_errors: vec!["output_tokens: expected integer".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("openai::gpt-4o-mini"));
        assert!(msg.contains("1 missing"));
        assert!(msg.contains("1 type errors"));
    }

    #[test]
    fn retryable_classification() {
        assert!(AicmError::transport("connection reset").is_retryable());
        assert!(
            AicmError::Timeout {
                duration: std::time::Duration::from_secs(10)
            }
            .is_retryable()
        );
        assert!(
            !AicmError::Transport {
                message: "bad gateway".into(),
                retryable: false,
                source: None,
            }
            .is_retryable()
        );
        assert!(
            !AicmError::ServerRejected {
                status: 422,
                detail: "unknown field".into(),
                code: None,
            }
            .is_retryable()
        );
    }

    #[test]
    fn limit_exceeded_names_limit() {
        let err = AicmError::LimitExceeded {
            limit_id: "L1".into(),
            service_key: Some("openai::gpt-4o-mini".into()),
            customer_key: None,
        };
        assert!(err.to_string().contains("L1"));
    }
}
