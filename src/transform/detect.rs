//! Dialect detection for inbound payloads.
//!
//! The dialects overlap heavily (both have `model`, `messages`, `max_tokens`, `stream`), so no
//! single field decides. Instead several independent signals are scored per dialect and
//! combined with fixed weights:
//!
//! | signal     | weight |
//! |------------|--------|
//! | endpoint   | 0.40   |
//! | headers    | 0.30   |
//! | model name | 0.15   |
//! | structure  | 0.10   |
//! | body keys  | 0.05   |
//!
//! A payload must first pass the common fingerprint (a JSON object with a non-empty `messages`
//! array of role-bearing objects); anything else is a [`FormatError`].

use super::Dialect;
use crate::errors::FormatError;
use axum::http::HeaderMap;
use serde_json::Value;

const ENDPOINT_WEIGHT: f64 = 0.4;
const HEADER_WEIGHT: f64 = 0.3;
const MODEL_WEIGHT: f64 = 0.15;
const STRUCTURE_WEIGHT: f64 = 0.1;
const BODY_WEIGHT: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub dialect: Dialect,
    /// Share of the combined score held by the winning dialect, in `[0.5, 1.0]`
    pub confidence: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Score {
    openai: f64,
    anthropic: f64,
}

impl Score {
    fn add(&mut self, weight: f64, signal: Score) {
        self.openai += weight * signal.openai;
        self.anthropic += weight * signal.anthropic;
    }
}

pub fn detect(
    path: Option<&str>,
    headers: &HeaderMap,
    body: &Value,
) -> Result<Detection, FormatError> {
    check_fingerprint(body)?;

    let mut total = Score::default();
    total.add(ENDPOINT_WEIGHT, endpoint_signal(path));
    total.add(HEADER_WEIGHT, header_signal(headers));
    total.add(MODEL_WEIGHT, model_signal(body));
    total.add(STRUCTURE_WEIGHT, structure_signal(body));
    total.add(BODY_WEIGHT, body_signal(body));

    let sum = total.openai + total.anthropic;
    let (dialect, winner) = if total.anthropic > total.openai {
        (Dialect::Anthropic, total.anthropic)
    } else {
        (Dialect::OpenAi, total.openai)
    };
    let confidence = if sum > 0.0 { winner / sum } else { 0.5 };
    Ok(Detection {
        dialect,
        confidence,
    })
}

fn check_fingerprint(body: &Value) -> Result<(), FormatError> {
    let object = body
        .as_object()
        .ok_or_else(|| FormatError::Unrecognized("payload is not a JSON object".into()))?;
    let messages = object
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| FormatError::Unrecognized("no `messages` array".into()))?;
    if messages.is_empty() {
        return Err(FormatError::Unrecognized("`messages` is empty".into()));
    }
    for (index, message) in messages.iter().enumerate() {
        if message.get("role").and_then(Value::as_str).is_none() {
            return Err(FormatError::Unrecognized(format!(
                "messages[{index}] has no string `role`"
            )));
        }
    }
    Ok(())
}

fn endpoint_signal(path: Option<&str>) -> Score {
    match path {
        Some(p) if p.ends_with("/messages") => Score {
            openai: 0.0,
            anthropic: 1.0,
        },
        Some(p) if p.ends_with("/chat/completions") => Score {
            openai: 1.0,
            anthropic: 0.0,
        },
        _ => Score::default(),
    }
}

fn header_signal(headers: &HeaderMap) -> Score {
    if headers.contains_key("anthropic-version") || headers.contains_key("x-api-key") {
        return Score {
            openai: 0.0,
            anthropic: 1.0,
        };
    }
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    if bearer {
        // Anthropic-compatible gateways take bearer tokens too, so this only leans.
        Score {
            openai: 0.5,
            anthropic: 0.0,
        }
    } else {
        Score::default()
    }
}

fn model_signal(body: &Value) -> Score {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    if model.contains("claude") {
        Score {
            openai: 0.0,
            anthropic: 1.0,
        }
    } else if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") {
        Score {
            openai: 1.0,
            anthropic: 0.0,
        }
    } else {
        Score::default()
    }
}

/// Shapes only one dialect produces: top-level `system`, typed blocks, tool declaration styles.
fn structure_signal(body: &Value) -> Score {
    let mut anthropic = 0u32;
    let mut openai = 0u32;

    if body.get("system").is_some() {
        anthropic += 1;
    }
    if body.get("thinking").is_some() {
        anthropic += 1;
    }
    if body.get("functions").is_some() || body.get("response_format").is_some() {
        openai += 1;
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        for tool in tools {
            if tool.get("input_schema").is_some() {
                anthropic += 1;
            }
            if tool.get("type").and_then(Value::as_str) == Some("function")
                && tool.get("function").is_some()
            {
                openai += 1;
            }
        }
    }

    for message in body["messages"].as_array().into_iter().flatten() {
        match message.get("role").and_then(Value::as_str) {
            Some("system" | "developer" | "tool" | "function") => openai += 1,
            _ => {}
        }
        if message.get("tool_calls").is_some() || message.get("tool_call_id").is_some() {
            openai += 1;
        }
        for block in message["content"].as_array().into_iter().flatten() {
            match block.get("type").and_then(Value::as_str) {
                Some("image_url") => openai += 1,
                Some("tool_use" | "tool_result" | "thinking") => anthropic += 1,
                Some("image") if block.get("source").is_some() => anthropic += 1,
                _ => {}
            }
        }
    }

    normalized(openai, anthropic)
}

fn body_signal(body: &Value) -> Score {
    let mut anthropic = 0u32;
    let mut openai = 0u32;
    for key in ["top_k", "stop_sequences", "metadata"] {
        if body.get(key).is_some() {
            anthropic += 1;
        }
    }
    for key in [
        "frequency_penalty",
        "presence_penalty",
        "n",
        "logprobs",
        "max_completion_tokens",
        "stream_options",
        "seed",
    ] {
        if body.get(key).is_some() {
            openai += 1;
        }
    }
    normalized(openai, anthropic)
}

fn normalized(openai: u32, anthropic: u32) -> Score {
    let total = openai + anthropic;
    if total == 0 {
        return Score::default();
    }
    Score {
        openai: f64::from(openai) / f64::from(total),
        anthropic: f64::from(anthropic) / f64::from(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::not_an_object(json!(["messages"]))]
    #[case::missing_messages(json!({"model": "gpt-4o", "prompt": "hi"}))]
    #[case::empty_messages(json!({"model": "gpt-4o", "messages": []}))]
    #[case::roleless_message(json!({"model": "gpt-4o", "messages": [{"content": "hi"}]}))]
    fn test_malformed_payloads_match_no_fingerprint(#[case] body: Value) {
        let err = detect(Some("/v1/chat/completions"), &HeaderMap::new(), &body).unwrap_err();
        assert!(matches!(err, FormatError::Unrecognized(_)));
    }

    #[test]
    fn test_structure_alone_identifies_anthropic() {
        let body = json!({
            "model": "some-model",
            "system": "Be brief.",
            "top_k": 5,
            "messages": [{"role": "user", "content": [{"type": "image", "source": {"type": "url", "url": "https://x/y.png"}}]}]
        });
        let detection = detect(None, &HeaderMap::new(), &body).unwrap();
        assert_eq!(detection.dialect, Dialect::Anthropic);
        assert_eq!(detection.confidence, 1.0);
    }

    #[test]
    fn test_structure_alone_identifies_openai() {
        let body = json!({
            "model": "some-model",
            "frequency_penalty": 0.2,
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hi"}
            ]
        });
        let detection = detect(None, &HeaderMap::new(), &body).unwrap();
        assert_eq!(detection.dialect, Dialect::OpenAi);
    }

    #[test]
    fn test_headers_outweigh_model_name() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());
        let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
        let detection = detect(None, &headers, &body).unwrap();
        assert_eq!(detection.dialect, Dialect::Anthropic);
        assert!(detection.confidence > 0.5);
    }

    #[test]
    fn test_ambiguous_payload_defaults_to_openai() {
        let body = json!({"model": "llama-3", "messages": [{"role": "user", "content": "hi"}]});
        let detection = detect(None, &HeaderMap::new(), &body).unwrap();
        assert_eq!(detection.dialect, Dialect::OpenAi);
        assert_eq!(detection.confidence, 0.5);
    }
}
