// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The in-memory usage record and its deterministic wire form.
//!
//! A record's identity fields (`response_id`, `service_key`, `timestamp`)
//! are fixed at construction. `response_id` doubles as the server-side
//! idempotency key, which is what turns at-least-once delivery into
//! effectively-once accounting.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AicmError;
use crate::sanitize::sanitize;

/// A single usage measurement bound for the `/track` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    service_key: String,
    response_id: String,
    timestamp: DateTime<Utc>,
    usage: Value,
    customer_key: Option<String>,
    context: Option<Map<String, Value>>,
    api_id: Option<String>,
}

impl UsageRecord {
    /// Start building a record for `service_key` with the given usage counts.
    ///
    /// `usage` is normalized (sorted keys, bounded depth, stable floats)
    /// when the record is built.
    pub fn builder(service_key: impl Into<String>, usage: Value) -> UsageRecordBuilder {
        UsageRecordBuilder {
            service_key: service_key.into(),
            usage,
            response_id: None,
            timestamp: None,
            customer_key: None,
            context: None,
            api_id: None,
        }
    }

    pub fn service_key(&self) -> &str {
        &self.service_key
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn usage(&self) -> &Value {
        &self.usage
    }

    pub fn customer_key(&self) -> Option<&str> {
        self.customer_key.as_deref()
    }

    pub fn context(&self) -> Option<&Map<String, Value>> {
        self.context.as_ref()
    }

    pub fn api_id(&self) -> Option<&str> {
        self.api_id.as_deref()
    }

    /// Apply tracker-wide defaults for fields the caller left unset.
    ///
    /// Context is replaced wholesale, never merged.
    pub fn apply_defaults(
        &mut self,
        customer_key: Option<&str>,
        context: Option<&Map<String, Value>>,
    ) {
        if self.customer_key.is_none() {
            self.customer_key = customer_key.map(str::to_owned);
        }
        if self.context.is_none() {
            self.context = context.cloned();
        }
    }

    /// Serialize to the deterministic wire object.
    ///
    /// Keys appear in sorted order at every level; two calls on the same
    /// record produce byte-identical JSON.
    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        if let Some(api_id) = &self.api_id {
            map.insert("api_id".to_string(), Value::String(api_id.clone()));
        }
        if let Some(context) = &self.context {
            map.insert(
                "context".to_string(),
                sanitize(&Value::Object(context.clone())),
            );
        }
        if let Some(customer_key) = &self.customer_key {
            map.insert(
                "customer_key".to_string(),
                Value::String(customer_key.clone()),
            );
        }
        map.insert(
            "response_id".to_string(),
            Value::String(self.response_id.clone()),
        );
        map.insert(
            "service_key".to_string(),
            Value::String(self.service_key.clone()),
        );
        map.insert(
            "timestamp".to_string(),
            Value::String(
                self.timestamp
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        );
        map.insert("usage".to_string(), self.usage.clone());
        Value::Object(map)
    }

    /// Parse a wire object back into a record.
    ///
    /// Used by the durable queue, which stores records in wire form.
    pub fn from_wire(value: &Value) -> Result<Self, AicmError> {
        let obj = value
            .as_object()
            .ok_or_else(|| AicmError::Internal("wire record is not an object".into()))?;
        let field = |name: &str| -> Result<String, AicmError> {
            obj.get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| AicmError::Internal(format!("wire record missing {name}")))
        };
        let timestamp = DateTime::parse_from_rfc3339(&field("timestamp")?)
            .map_err(|e| AicmError::Internal(format!("wire record timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            service_key: field("service_key")?,
            response_id: field("response_id")?,
            timestamp,
            usage: sanitize(obj.get("usage").unwrap_or(&Value::Object(Map::new()))),
            customer_key: obj
                .get("customer_key")
                .and_then(Value::as_str)
                .map(str::to_owned),
            context: obj
                .get("context")
                .and_then(Value::as_object)
                .cloned(),
            api_id: obj.get("api_id").and_then(Value::as_str).map(str::to_owned),
        })
    }
}

/// Builder for [`UsageRecord`]. Unset optional fields fall back to tracker
/// defaults at track time.
#[derive(Debug)]
pub struct UsageRecordBuilder {
    service_key: String,
    usage: Value,
    response_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    customer_key: Option<String>,
    context: Option<Map<String, Value>>,
    api_id: Option<String>,
}

impl UsageRecordBuilder {
    /// Idempotency key. Generated (UUIDv4) when not supplied.
    pub fn response_id(mut self, id: impl Into<String>) -> Self {
        self.response_id = Some(id.into());
        self
    }

    /// Measurement instant. Defaults to now (UTC).
    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn customer_key(mut self, key: impl Into<String>) -> Self {
        self.customer_key = Some(key.into());
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    /// Legacy provider hint, accepted for backward-compatible input.
    pub fn api_id(mut self, api_id: impl Into<String>) -> Self {
        self.api_id = Some(api_id.into());
        self
    }

    pub fn build(self) -> UsageRecord {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        UsageRecord {
            service_key: self.service_key,
            response_id: self
                .response_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            // Truncate to the microsecond precision of the wire form so a
            // record equals its own wire round trip.
            timestamp: Utc
                .timestamp_micros(timestamp.timestamp_micros())
                .single()
                .unwrap_or(timestamp),
            usage: sanitize(&self.usage),
            customer_key: self.customer_key,
            context: self.context,
            api_id: self.api_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> UsageRecord {
        UsageRecord::builder(
            "openai::gpt-4o-mini",
            json!({"output_tokens": 20, "input_tokens": 10}),
        )
        .response_id("r1")
        .customer_key("acme")
        .build()
    }

    #[test]
    fn build_fills_response_id_and_timestamp() {
        let record =
            UsageRecord::builder("openai::gpt-4o-mini", json!({"input_tokens": 1})).build();
        assert_eq!(record.response_id().len(), 36);
        assert!(record.timestamp() <= Utc::now());
    }

    #[test]
    fn explicit_response_id_is_kept() {
        assert_eq!(sample().response_id(), "r1");
    }

    #[test]
    fn wire_form_is_deterministic() {
        let record = sample();
        let a = serde_json::to_string(&record.to_wire()).unwrap();
        let b = serde_json::to_string(&record.to_wire()).unwrap();
        assert_eq!(a, b);
        // Usage keys are sorted regardless of construction order.
        assert!(a.contains(r#""usage":{"input_tokens":10,"output_tokens":20}"#));
    }

    #[test]
    fn wire_round_trip_preserves_record() {
        let record = sample();
        let wire = record.to_wire();
        let parsed = UsageRecord::from_wire(&wire).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.to_wire(), wire);
    }

    #[test]
    fn apply_defaults_only_fills_unset_fields() {
        let mut record = sample();
        let mut ctx = Map::new();
        ctx.insert("env".to_string(), json!("prod"));
        record.apply_defaults(Some("other"), Some(&ctx));
        // customer_key was set explicitly and must survive.
        assert_eq!(record.customer_key(), Some("acme"));
        assert_eq!(record.context().unwrap()["env"], json!("prod"));
    }

    #[test]
    fn context_is_replaced_not_merged() {
        let mut per_call = Map::new();
        per_call.insert("request".to_string(), json!("abc"));
        let mut record = UsageRecord::builder("svc::a", json!({"n": 1}))
            .context(per_call)
            .build();
        let mut defaults = Map::new();
        defaults.insert("env".to_string(), json!("prod"));
        record.apply_defaults(None, Some(&defaults));
        let context = record.context().unwrap();
        assert!(context.contains_key("request"));
        assert!(!context.contains_key("env"));
    }

    #[test]
    fn from_wire_rejects_missing_service_key() {
        let err = UsageRecord::from_wire(&json!({"response_id": "r"})).unwrap_err();
        assert!(err.to_string().contains("service_key"));
    }
}
