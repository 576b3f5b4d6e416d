// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP/HTTP JSON wire types.
//!
//! Instrumented applications push `ExportTraceServiceRequest` payloads in the OTLP JSON encoding.
//! Decoding is deliberately tolerant: apart from the top-level `resourceSpans` array, which is
//! validated by [`OtlpTraceRequest::from_value`], every field falls back to a default when it is
//! missing or carries an unexpected JSON type. The normalizer then turns whatever survived into
//! a best-effort trace record.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use crate::error::IngestError;

const RESOURCE_SPANS_FIELD: &str = "resourceSpans";

/// Top-level ingest payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OtlpTraceRequest {
    pub resource_spans: Vec<OtlpResourceSpans>,
}

impl OtlpTraceRequest {
    /// Validates the payload shape and decodes every resource span.
    ///
    /// Fails with [`IngestError::InvalidFormat`] when `resourceSpans` is missing or is not an
    /// array. Nothing below that level can fail.
    pub fn from_value(payload: Value) -> Result<Self, IngestError> {
        let Value::Object(mut fields) = payload else {
            return Err(IngestError::InvalidFormat);
        };
        match fields.remove(RESOURCE_SPANS_FIELD) {
            Some(Value::Array(items)) => Ok(OtlpTraceRequest {
                resource_spans: items.into_iter().map(decode_or_default).collect(),
            }),
            _ => Err(IngestError::InvalidFormat),
        }
    }

    /// Parses a raw request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, IngestError> {
        let payload: Value = serde_json::from_slice(body)?;
        Self::from_value(payload)
    }

    /// Total number of spans across all resource and scope spans.
    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|rs| rs.scope_spans.iter())
            .map(|ss| ss.spans.len())
            .sum()
    }
}

/// A batch of spans sharing one originating resource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpResourceSpans {
    #[serde(default, deserialize_with = "lenient::option")]
    pub resource: Option<OtlpResource>,
    #[serde(default, deserialize_with = "lenient::seq")]
    pub scope_spans: Vec<OtlpScopeSpans>,
}

impl OtlpResourceSpans {
    /// The `service.name` resource attribute's string value, when present and non-empty.
    pub fn service_name(&self) -> Option<&str> {
        self.resource
            .as_ref()?
            .attributes
            .iter()
            .find(|attr| attr.key == SERVICE_NAME_KEY)?
            .value
            .as_ref()?
            .string_value
            .as_deref()
            .filter(|name| !name.is_empty())
    }
}

pub const SERVICE_NAME_KEY: &str = "service.name";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OtlpResource {
    #[serde(default, deserialize_with = "lenient::seq")]
    pub attributes: Vec<OtlpKeyValue>,
}

/// Spans sharing one instrumentation scope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OtlpScopeSpans {
    #[serde(default, deserialize_with = "lenient::seq")]
    pub spans: Vec<OtlpSpan>,
}

/// A single span as sent on the wire.
///
/// `kind`, the two timestamps and `status.code` are kept as raw JSON values: exporters disagree
/// on whether these are numbers or strings, and the normalizer decides how to read them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan {
    #[serde(default, deserialize_with = "lenient::string")]
    pub trace_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub span_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub parent_span_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Value,
    #[serde(default)]
    pub start_time_unix_nano: Value,
    #[serde(default)]
    pub end_time_unix_nano: Value,
    #[serde(default, deserialize_with = "lenient::seq")]
    pub attributes: Vec<OtlpKeyValue>,
    #[serde(default, deserialize_with = "lenient::option")]
    pub status: Option<OtlpStatus>,
    #[serde(default)]
    pub events: Value,
    #[serde(default)]
    pub links: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OtlpKeyValue {
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub key: String,
    #[serde(default, deserialize_with = "lenient::option")]
    pub value: Option<OtlpAnyValue>,
}

/// OTLP typed value union. Only scalar variants are read; `arrayValue`, `kvlistValue` and
/// `bytesValue` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpAnyValue {
    #[serde(default, deserialize_with = "lenient::string")]
    pub string_value: Option<String>,
    /// Integers are encoded as decimal strings by the protobuf JSON mapping, but plain numbers
    /// are common too.
    #[serde(default)]
    pub int_value: Value,
    #[serde(default)]
    pub double_value: Value,
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub bool_value: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OtlpStatus {
    #[serde(default)]
    pub code: Value,
}

fn decode_or_default<T: DeserializeOwned + Default>(value: Value) -> T {
    match serde_json::from_value(value) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!("Falling back to defaults for undecodable OTLP element: {err}");
            T::default()
        }
    }
}

/// Field deserializers that never fail: a value of the wrong JSON type becomes the default.
mod lenient {
    use super::*;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            _ => None,
        })
    }

    pub fn string_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        string(d).map(Option::unwrap_or_default)
    }

    pub fn boolean<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(Value::deserialize(d)?.as_bool())
    }

    pub fn option<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        Ok(match Value::deserialize(d)? {
            Value::Null => None,
            other => serde_json::from_value(other).ok(),
        })
    }

    /// Non-array values decode as an empty list; elements that fail to decode become
    /// `T::default()` so that the element count is preserved.
    pub fn seq<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.into_iter().map(decode_or_default).collect(),
            _ => Vec::new(),
        })
    }
}
