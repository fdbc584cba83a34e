//! Translation between the canonical model and provider wire dialects.
//!
//! Each dialect module decodes its wire JSON into [`CanonicalRequest`]/[`CanonicalResponse`]
//! and encodes them back out. Conversions are lossless for fields both sides can express;
//! anything the destination cannot carry is listed in [`Transformed::dropped`].
//!
//! Inbound payloads go through [`decode_inbound`], which detects the dialect from structural
//! fingerprints before decoding. Streaming responses are reassembled by
//! [`stream::StreamAccumulator`] and can be re-encoded with [`stream::encode_stream`].

pub mod anthropic;
pub mod canonical;
pub mod detect;
pub mod extract;
pub mod openai;
pub mod stream;

use crate::errors::FormatError;
use axum::http::HeaderMap;
use canonical::{CanonicalRequest, CanonicalResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// A provider wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// OpenAI chat completions
    OpenAi,
    /// Anthropic messages
    Anthropic,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
        }
    }

    /// Path of the completion endpoint, relative to a provider's base URL.
    pub fn completion_path(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "chat/completions",
            Dialect::Anthropic => "messages",
        }
    }

    pub fn decode_request(&self, body: &Value) -> Result<Transformed<CanonicalRequest>, FormatError> {
        match self {
            Dialect::OpenAi => openai::decode_request(body),
            Dialect::Anthropic => anthropic::decode_request(body),
        }
    }

    pub fn encode_request(&self, request: &CanonicalRequest) -> Transformed<Value> {
        match self {
            Dialect::OpenAi => openai::encode_request(request),
            Dialect::Anthropic => anthropic::encode_request(request),
        }
    }

    pub fn decode_response(&self, body: &Value) -> Result<CanonicalResponse, FormatError> {
        match self {
            Dialect::OpenAi => openai::decode_response(body),
            Dialect::Anthropic => anthropic::decode_response(body),
        }
    }

    pub fn encode_response(&self, response: &CanonicalResponse) -> Value {
        match self {
            Dialect::OpenAi => openai::encode_response(response),
            Dialect::Anthropic => anthropic::encode_response(response),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field that could not be carried into the destination format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedField {
    pub field: String,
    pub reason: String,
}

impl DroppedField {
    pub(crate) fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The result of a conversion, together with everything the conversion had to leave behind.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed<T> {
    pub value: T,
    pub dropped: Vec<DroppedField>,
}

impl<T> Transformed<T> {
    pub(crate) fn new(value: T, dropped: Vec<DroppedField>) -> Self {
        Self { value, dropped }
    }

    pub fn is_lossless(&self) -> bool {
        self.dropped.is_empty()
    }

    pub fn dropped_field(&self, field: &str) -> bool {
        self.dropped.iter().any(|d| d.field == field)
    }

    /// Emit one warning per dropped field.
    pub fn warn_dropped(&self, direction: &str) {
        for dropped in &self.dropped {
            warn!(
                field = %dropped.field,
                reason = %dropped.reason,
                "Dropped field while {direction}"
            );
        }
    }
}

/// Detect the dialect of an inbound request and decode it.
///
/// Payloads matching no dialect fingerprint are rejected with a [`FormatError`] before any
/// provider is involved.
pub fn decode_inbound(
    path: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Dialect, Transformed<CanonicalRequest>), FormatError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| FormatError::InvalidJson(e.to_string()))?;
    let detection = detect::detect(path, headers, &value)?;
    let decoded = detection.dialect.decode_request(&value)?;
    Ok((detection.dialect, decoded))
}

/// Deserialize a wire struct, mapping serde's message into a [`FormatError`].
pub(crate) fn from_wire<T: serde::de::DeserializeOwned>(
    what: &str,
    body: &Value,
) -> Result<T, FormatError> {
    T::deserialize(body).map_err(|e| FormatError::invalid(what, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_inbound_rejects_non_json() {
        let err = decode_inbound(None, &HeaderMap::new(), b"not json").unwrap_err();
        assert!(matches!(err, FormatError::InvalidJson(_)));
    }

    #[test]
    fn test_decode_inbound_uses_endpoint_to_pick_dialect() {
        let body = serde_json::to_vec(&json!({
            "model": "any",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        let (dialect, _) =
            decode_inbound(Some("/v1/messages"), &HeaderMap::new(), &body).unwrap();
        assert_eq!(dialect, Dialect::Anthropic);

        let (dialect, _) =
            decode_inbound(Some("/v1/chat/completions"), &HeaderMap::new(), &body).unwrap();
        assert_eq!(dialect, Dialect::OpenAi);
    }
}
