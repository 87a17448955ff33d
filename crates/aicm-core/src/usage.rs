// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversion seam between vendor usage objects and the pipeline.
//!
//! Anything `Serialize` can act as a usage payload. Conversion never fails:
//! a type whose serializer errors (sentinel/mock objects in test harnesses
//! are the usual culprits) degrades to an empty object instead of poisoning
//! the record.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::sanitize::sanitize;

/// A source of usage counts for a [`UsageRecord`](crate::record::UsageRecord).
///
/// Implemented for every `Serialize` type. Vendor wrapper crates register
/// their response types simply by deriving or implementing `Serialize`.
pub trait UsageSource {
    /// Produce the normalized usage object for the wire.
    fn to_usage(&self) -> Value;
}

impl<T: Serialize> UsageSource for T {
    fn to_usage(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => sanitize(&Value::Object(map)),
            Ok(other) => {
                // Scalar or array payloads are wrapped so `usage` is always an object.
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                sanitize(&Value::Object(map))
            }
            Err(err) => {
                debug!(error = %err, "usage source failed to serialize, substituting empty object");
                Value::Object(Map::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct VendorUsage {
        input_tokens: u64,
        output_tokens: u64,
    }

    #[test]
    fn serializable_struct_becomes_object() {
        let usage = VendorUsage {
            input_tokens: 10,
            output_tokens: 20,
        };
        assert_eq!(
            usage.to_usage(),
            json!({"input_tokens": 10, "output_tokens": 20})
        );
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        assert_eq!(42u64.to_usage(), json!({"value": 42}));
    }

    #[test]
    fn json_value_passes_through_sanitized() {
        let raw = json!({"b": 2, "a": 1});
        let text = serde_json::to_string(&raw.to_usage()).unwrap();
        assert_eq!(text, r#"{"a":1,"b":2}"#);
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("dynamic attribute access"))
        }
    }

    #[test]
    fn failing_serializer_degrades_to_empty_object() {
        assert_eq!(Unserializable.to_usage(), json!({}));
    }
}
