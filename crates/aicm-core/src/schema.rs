// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Optional per-service usage schemas.
//!
//! A schema lists the fields a service's usage payload may carry and their
//! expected kinds. Validation collects every problem in one pass (missing,
//! extra, and mistyped fields) instead of failing on the first, so the
//! resulting error is actionable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AicmError;

/// Expected JSON kind of a usage field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Float,
    /// Integer or float.
    Number,
    String,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            FieldKind::Float => value.is_f64(),
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Number => "number",
            FieldKind::String => "string",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }
}

/// One field in a usage schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Schema for one service key (or service-key pattern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSchema {
    pub fields: BTreeMap<String, FieldSpec>,
    /// When false, fields not listed in `fields` are reported as extra.
    #[serde(default)]
    pub allow_extra: bool,
}

impl UsageSchema {
    /// Validate `usage` against this schema.
    ///
    /// Returns [`AicmError::Validation`] carrying the full lists of missing
    /// fields, unexpected fields, and type mismatches.
    pub fn validate(&self, service_key: &str, usage: &Value) -> Result<(), AicmError> {
        let mut missing = Vec::new();
        let mut extra = Vec::new();
        let mut type_errors = Vec::new();

        let Some(obj) = usage.as_object() else {
            return Err(AicmError::Validation {
                service_key: service_key.to_string(),
                missing,
                extra,
                type_errors: vec!["usage: expected object".to_string()],
            });
        };

        for (name, spec) in &self.fields {
            match obj.get(name) {
                Some(value) => {
                    if !spec.kind.matches(value) {
                        type_errors.push(format!("{name}: expected {}", spec.kind.name()));
                    }
                }
                None if spec.required => missing.push(name.clone()),
                None => {}
            }
        }

        if !self.allow_extra {
            for name in obj.keys() {
                if !self.fields.contains_key(name) {
                    extra.push(name.clone());
                }
            }
        }

        if missing.is_empty() && extra.is_empty() && type_errors.is_empty() {
            Ok(())
        } else {
            Err(AicmError::Validation {
                service_key: service_key.to_string(),
                missing,
                extra,
                type_errors,
            })
        }
    }
}

/// A set of schemas keyed by service-key pattern.
///
/// Patterns are either exact keys (`openai::gpt-4o-mini`) or a provider
/// prefix wildcard (`openai::*`). Exact entries win over wildcards. Service
/// keys without a matching entry are not validated.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    entries: Vec<(String, UsageSchema)>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pattern: impl Into<String>, schema: UsageSchema) {
        self.entries.push((pattern.into(), schema));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the schema for `service_key`, exact matches first.
    pub fn lookup(&self, service_key: &str) -> Option<&UsageSchema> {
        if let Some((_, schema)) = self
            .entries
            .iter()
            .find(|(pattern, _)| pattern == service_key)
        {
            return Some(schema);
        }
        self.entries.iter().find_map(|(pattern, schema)| {
            pattern
                .strip_suffix("::*")
                .filter(|prefix| {
                    service_key
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with("::"))
                })
                .map(|_| schema)
        })
    }

    /// Validate `usage` for `service_key` if a schema is registered.
    pub fn validate(&self, service_key: &str, usage: &Value) -> Result<(), AicmError> {
        match self.lookup(service_key) {
            Some(schema) => schema.validate(service_key, usage),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_schema() -> UsageSchema {
        let mut fields = BTreeMap::new();
        fields.insert(
            "input_tokens".to_string(),
            FieldSpec {
                kind: FieldKind::Integer,
                required: true,
            },
        );
        fields.insert(
            "output_tokens".to_string(),
            FieldSpec {
                kind: FieldKind::Integer,
                required: true,
            },
        );
        fields.insert(
            "duration_seconds".to_string(),
            FieldSpec {
                kind: FieldKind::Number,
                required: false,
            },
        );
        UsageSchema {
            fields,
            allow_extra: false,
        }
    }

    #[test]
    fn valid_payload_passes() {
        let schema = token_schema();
        assert!(
            schema
                .validate(
                    "openai::gpt-4o-mini",
                    &json!({"input_tokens": 10, "output_tokens": 20})
                )
                .is_ok()
        );
    }

    #[test]
    fn all_three_lists_are_collected() {
        let schema = token_schema();
        let err = schema
            .validate(
                "openai::gpt-4o-mini",
                &json!({"input_tokens": "ten", "surprise": true}),
            )
            .unwrap_err();
        let AicmError::Validation {
            missing,
            extra,
            type_errors,
            ..
        } = err
        else {
            panic!("expected validation error");
        };
        assert_eq!(missing, vec!["output_tokens"]);
        assert_eq!(extra, vec!["surprise"]);
        assert_eq!(type_errors, vec!["input_tokens: expected integer"]);
    }

    #[test]
    fn optional_field_may_be_absent() {
        let schema = token_schema();
        assert!(
            schema
                .validate("svc", &json!({"input_tokens": 1, "output_tokens": 2}))
                .is_ok()
        );
    }

    #[test]
    fn number_kind_accepts_integer_and_float() {
        let schema = token_schema();
        assert!(
            schema
                .validate(
                    "svc",
                    &json!({"input_tokens": 1, "output_tokens": 2, "duration_seconds": 1.5})
                )
                .is_ok()
        );
        assert!(
            schema
                .validate(
                    "svc",
                    &json!({"input_tokens": 1, "output_tokens": 2, "duration_seconds": 3})
                )
                .is_ok()
        );
    }

    #[test]
    fn non_object_usage_is_a_type_error() {
        let err = token_schema().validate("svc", &json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("1 type errors"));
    }

    #[test]
    fn schema_set_prefers_exact_over_wildcard() {
        let mut set = SchemaSet::new();
        let mut loose = token_schema();
        loose.allow_extra = true;
        set.insert("openai::*", token_schema());
        set.insert("openai::whisper-1", loose);
        // whisper hits the exact (allow_extra) entry.
        assert!(
            set.validate(
                "openai::whisper-1",
                &json!({"input_tokens": 1, "output_tokens": 2, "seconds": 9})
            )
            .is_ok()
        );
        // other openai keys hit the wildcard, which rejects extras.
        assert!(
            set.validate(
                "openai::gpt-4o-mini",
                &json!({"input_tokens": 1, "output_tokens": 2, "seconds": 9})
            )
            .is_err()
        );
    }

    #[test]
    fn wildcard_requires_separator() {
        let mut set = SchemaSet::new();
        set.insert("openai::*", token_schema());
        assert!(set.lookup("openai_compat::model").is_none());
        assert!(set.lookup("openai::gpt-4o").is_some());
    }

    #[test]
    fn unknown_service_key_skips_validation() {
        let set = SchemaSet::new();
        assert!(set.validate("anything::here", &json!({"free": "form"})).is_ok());
    }
}
