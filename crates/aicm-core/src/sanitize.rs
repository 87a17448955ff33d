// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization of arbitrary usage payloads into deterministic JSON.
//!
//! Provider SDKs hand back loosely structured usage objects (nested modality
//! breakdowns, vendor extension fields, occasionally pathological values).
//! Before a payload enters the pipeline it is normalized here: object keys
//! sorted, recursion depth bounded, non-finite floats dropped to null, and
//! float noise rounded away so two serializations of the same record are
//! byte-identical.

use serde_json::{Map, Number, Value};

/// Maximum nesting depth before a subtree is replaced with [`DEPTH_MARKER`].
pub const MAX_DEPTH: usize = 16;

/// Marker inserted in place of a subtree that exceeded [`MAX_DEPTH`].
pub const DEPTH_MARKER: &str = "<max depth exceeded>";

/// Significant digits retained for floating point usage values.
const FLOAT_SIG_DIGITS: i32 = 12;

/// Normalize a usage value into deterministic plain JSON.
///
/// Objects are rebuilt with keys in sorted order, arrays keep their order,
/// and any subtree deeper than [`MAX_DEPTH`] collapses to a marker string.
pub fn sanitize(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String(DEPTH_MARKER.to_string());
    }
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sanitize_at(&map[key], depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| sanitize_at(v, depth + 1)).collect())
        }
        Value::Number(n) => sanitize_number(n),
        other => other.clone(),
    }
}

/// Integers pass through untouched; floats are rounded to a fixed number of
/// significant digits so serialization is stable across platforms.
fn sanitize_number(n: &Number) -> Value {
    if n.is_i64() || n.is_u64() {
        return Value::Number(n.clone());
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => Number::from_f64(round_significant(f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn round_significant(f: f64) -> f64 {
    if f == 0.0 {
        return 0.0;
    }
    let magnitude = FLOAT_SIG_DIGITS - 1 - f.abs().log10().floor() as i32;
    let scale = 10f64.powi(magnitude);
    (f * scale).round() / scale
}
