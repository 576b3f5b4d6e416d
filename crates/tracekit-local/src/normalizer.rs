// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Converts OTLP wire spans into the flat shape the store and the viewers work with.
//!
//! Normalization never fails. Missing or malformed fields degrade to defaults: an unknown kind
//! becomes `UNSPECIFIED`, a missing status becomes `ok`, and timestamps that cannot be read yield
//! `NaN` milliseconds, which surface as `null` start/end times and a `null` duration.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::otlp::{OtlpAnyValue, OtlpSpan};

const NANOS_PER_MILLI: f64 = 1_000_000.0;
const STATUS_CODE_ERROR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }

    /// Reads the wire `kind`, which may be a number or a numeric string.
    pub fn from_wire(kind: &Value) -> Self {
        let code = match kind {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|code| code.fract() == 0.0 && code.abs() <= i64::MAX as f64)
                    .map(|code| code as i64)
            }),
            Value::String(s) => s.parse::<i64>().ok(),
            _ => None,
        };
        code.map_or(SpanKind::Unspecified, SpanKind::from_code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "UNSPECIFIED",
            SpanKind::Internal => "INTERNAL",
            SpanKind::Server => "SERVER",
            SpanKind::Client => "CLIENT",
            SpanKind::Producer => "PRODUCER",
            SpanKind::Consumer => "CONSUMER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

impl SpanStatus {
    /// Only the numeric code 2 is an error; 1, 0, anything else or no status at all is `ok`.
    pub fn from_wire(code: Option<&Value>) -> Self {
        match code.and_then(Value::as_f64) {
            Some(code) if code == STATUS_CODE_ERROR => SpanStatus::Error,
            _ => SpanStatus::Ok,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
        }
    }
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttributeValue {
    /// Picks the first populated field in priority order: string, integer, float, boolean.
    /// Integers and floats are also accepted as decimal strings, as the protobuf JSON mapping
    /// encodes 64-bit integers that way.
    pub fn resolve(value: &OtlpAnyValue) -> Option<AttributeValue> {
        if let Some(s) = &value.string_value {
            return Some(AttributeValue::String(s.clone()));
        }
        let int = match &value.int_value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|int| int.fract() == 0.0 && int.abs() <= i64::MAX as f64)
                    .map(|int| int as i64)
            }),
            Value::String(s) => s.parse::<i64>().ok(),
            _ => None,
        };
        if let Some(int) = int {
            return Some(AttributeValue::Int(int));
        }
        let float = match &value.double_value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        };
        if let Some(float) = float {
            return Some(AttributeValue::Float(float));
        }
        value.bool_value.map(AttributeValue::Bool)
    }
}

/// A span in canonical form, before the store assigns its identity and ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSpan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub service: String,
    pub name: String,
    pub kind: SpanKind,
    #[serde(serialize_with = "iso8601::serialize_opt")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(serialize_with = "iso8601::serialize_opt")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds, rounded to two decimals. Negative or `NaN` for malformed input.
    pub duration: f64,
    pub status: SpanStatus,
    pub attributes: HashMap<String, AttributeValue>,
    pub events: Vec<Value>,
    pub links: Vec<Value>,
}

/// Converts one wire span, tagging it with the service name of the resource it came from.
pub fn normalize(span: OtlpSpan, service_name: &str) -> NormalizedSpan {
    let start_ms = unix_nanos_to_millis(&span.start_time_unix_nano);
    let end_ms = unix_nanos_to_millis(&span.end_time_unix_nano);

    let mut attributes = HashMap::with_capacity(span.attributes.len());
    for attr in span.attributes {
        match attr.value.as_ref().and_then(AttributeValue::resolve) {
            Some(value) => {
                attributes.insert(attr.key, value);
            }
            // a later valueless occurrence still overrides an earlier one
            None => {
                attributes.remove(&attr.key);
            }
        }
    }

    NormalizedSpan {
        trace_id: span.trace_id,
        span_id: span.span_id,
        parent_span_id: span.parent_span_id,
        service: service_name.to_string(),
        name: span.name.unwrap_or_default(),
        kind: SpanKind::from_wire(&span.kind),
        start_time: millis_to_datetime(start_ms),
        end_time: millis_to_datetime(end_ms),
        duration: round_to_hundredths(end_ms - start_ms),
        status: SpanStatus::from_wire(span.status.as_ref().map(|status| &status.code)),
        attributes,
        events: into_sequence(span.events),
        links: into_sequence(span.links),
    }
}

/// Reads a nanosecond timestamp sent either as a JSON number or as a string, using the leading
/// integer part of strings. Returns `NaN` when no integer can be read.
fn unix_nanos_to_millis(nanos: &Value) -> f64 {
    let nanos = match nanos {
        Value::Number(n) => n
            .as_u64()
            .map(|n| n as f64)
            .or_else(|| n.as_i64().map(|n| n as f64))
            .or_else(|| n.as_f64().map(f64::trunc)),
        Value::String(s) => leading_integer(s),
        _ => None,
    };
    nanos.map_or(f64::NAN, |nanos| nanos / NANOS_PER_MILLI)
}

fn leading_integer(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
    let digits = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .map_or(unsigned, |end| &unsigned[..end]);
    if digits.is_empty() {
        return None;
    }
    let magnitude = digits.parse::<f64>().ok()?;
    Some(if s.starts_with('-') {
        -magnitude
    } else {
        magnitude
    })
}

fn millis_to_datetime(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(millis.trunc() as i64)
}

/// Rounds half-up toward positive infinity, so `-0.005` becomes `-0.0` rather than `-0.01`.
fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}

fn into_sequence(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

/// ISO-8601 rendering with millisecond precision and a `Z` suffix, e.g.
/// `2018-12-13T14:51:00.000Z`.
pub(crate) mod iso8601 {
    use super::*;

    pub fn format(instant: &DateTime<Utc>) -> String {
        instant.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(instant: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(instant))
    }

    pub fn serialize_opt<S: Serializer>(
        instant: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match instant {
            Some(instant) => serialize(instant, s),
            None => s.serialize_none(),
        }
    }
}
