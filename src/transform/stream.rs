//! Streaming responses: reassembly of SSE chunks into a canonical response, and re-encoding of
//! a canonical response as an SSE stream in either dialect.

use super::Dialect;
use super::anthropic::{decode_stop_reason, encode_block, encode_stop_reason};
use super::canonical::{CanonicalResponse, ContentBlock, StopReason, Usage};
use super::openai::{
    ChatUsage, arguments_string, decode_finish_reason, encode_finish_reason, parse_arguments,
    unix_now,
};
use crate::errors::ProviderError;
use crate::sse::{SseEvent, parse_events};
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::BTreeMap;

fn malformed(what: &str, detail: impl std::fmt::Display) -> ProviderError {
    ProviderError::ProviderServer {
        status: 200,
        message: format!("malformed {what} stream event: {detail}"),
    }
}

/// Accumulates a streamed response until it can be turned into a [`CanonicalResponse`].
#[derive(Debug)]
pub enum StreamAccumulator {
    OpenAi(OpenAiStream),
    Anthropic(AnthropicStream),
}

impl StreamAccumulator {
    pub fn new(dialect: Dialect) -> Self {
        match dialect {
            Dialect::OpenAi => StreamAccumulator::OpenAi(OpenAiStream::default()),
            Dialect::Anthropic => StreamAccumulator::Anthropic(AnthropicStream::default()),
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Result<(), ProviderError> {
        match self {
            StreamAccumulator::OpenAi(stream) => stream.push(event),
            StreamAccumulator::Anthropic(stream) => stream.push(event),
        }
    }

    /// Feed a buffered chunk of raw SSE bytes.
    pub fn push_bytes(&mut self, raw: &[u8]) -> Result<(), ProviderError> {
        for event in parse_events(raw) {
            self.push(&event)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<CanonicalResponse, ProviderError> {
        match self {
            StreamAccumulator::OpenAi(stream) => stream.finish(),
            StreamAccumulator::Anthropic(stream) => stream.finish(),
        }
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct OpenAiStream {
    id: String,
    model: String,
    reasoning: String,
    text: String,
    /// Keyed by the upstream's tool-call index, which need not start at zero or be dense.
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finish_reason: Option<StopReason>,
    usage: Usage,
    saw_chunk: bool,
}

impl OpenAiStream {
    fn push(&mut self, event: &SseEvent) -> Result<(), ProviderError> {
        if event.data.trim() == "[DONE]" {
            return Ok(());
        }
        let chunk: Value =
            serde_json::from_str(&event.data).map_err(|e| malformed("chat completion", e))?;
        if let Some(error) = chunk.get("error") {
            return Err(ProviderError::ProviderServer {
                status: 500,
                message: error["message"].as_str().unwrap_or("stream error").to_string(),
            });
        }
        self.saw_chunk = true;
        if let Some(id) = chunk["id"].as_str().filter(|_| self.id.is_empty()) {
            self.id = id.to_string();
        }
        if let Some(model) = chunk["model"].as_str().filter(|_| self.model.is_empty()) {
            self.model = model.to_string();
        }
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let usage: ChatUsage = serde_json::from_value(usage.clone())
                .map_err(|e| malformed("chat completion", e))?;
            self.usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        for choice in chunk["choices"].as_array().into_iter().flatten() {
            let delta = &choice["delta"];
            if let Some(reasoning) = delta["reasoning_content"].as_str() {
                self.reasoning.push_str(reasoning);
            }
            if let Some(content) = delta["content"].as_str() {
                self.text.push_str(content);
            }
            for call in delta["tool_calls"].as_array().into_iter().flatten() {
                // Without an index a fragment continues the latest call.
                let index = call["index"]
                    .as_u64()
                    .or_else(|| self.tool_calls.keys().next_back().copied())
                    .unwrap_or(0);
                let slot = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    slot.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    slot.name.push_str(name);
                }
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    slot.arguments.push_str(arguments);
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                self.finish_reason = Some(decode_finish_reason(reason));
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<CanonicalResponse, ProviderError> {
        if !self.saw_chunk {
            return Err(malformed("chat completion", "stream ended before any chunk"));
        }
        let mut content = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(ContentBlock::Thinking {
                text: self.reasoning,
                signature: None,
            });
        }
        if !self.text.is_empty() {
            content.push(ContentBlock::Text { text: self.text });
        }
        for (index, call) in self.tool_calls {
            if call.name.is_empty() {
                return Err(malformed(
                    "chat completion",
                    format!("tool call {index} never named its function"),
                ));
            }
            content.push(ContentBlock::ToolUse {
                input: parse_arguments(&call.arguments)
                    .map_err(|e| malformed("chat completion", e))?,
                id: if call.id.is_empty() {
                    format!("call_{index}")
                } else {
                    call.id
                },
                name: call.name,
            });
        }
        Ok(CanonicalResponse {
            id: self.id,
            model: self.model,
            content,
            stop_reason: self.finish_reason,
            usage: self.usage,
        })
    }
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    Thinking { text: String, signature: Option<String> },
    ToolUse { id: String, name: String, json: String },
}

#[derive(Debug, Default)]
pub struct AnthropicStream {
    id: String,
    model: String,
    blocks: Vec<(u64, PartialBlock)>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    started: bool,
}

impl AnthropicStream {
    fn block_mut(&mut self, index: u64) -> Result<&mut PartialBlock, ProviderError> {
        self.blocks
            .iter_mut()
            .find(|(i, _)| *i == index)
            .map(|(_, block)| block)
            .ok_or_else(|| malformed("messages", format!("delta for unknown block {index}")))
    }

    fn push(&mut self, event: &SseEvent) -> Result<(), ProviderError> {
        let payload: Value =
            serde_json::from_str(&event.data).map_err(|e| malformed("messages", e))?;
        let kind = event
            .event
            .as_deref()
            .or_else(|| payload["type"].as_str())
            .unwrap_or_default()
            .to_string();

        match kind.as_str() {
            "message_start" => {
                let message = &payload["message"];
                self.started = true;
                self.id = message["id"].as_str().unwrap_or_default().to_string();
                self.model = message["model"].as_str().unwrap_or_default().to_string();
                self.usage.input_tokens = message["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
                self.usage.output_tokens =
                    message["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
            }
            "content_block_start" => {
                let index = payload["index"].as_u64().unwrap_or(self.blocks.len() as u64);
                let block = &payload["content_block"];
                let partial = match block["type"].as_str() {
                    Some("text") => PartialBlock::Text(block["text"].as_str().unwrap_or_default().to_string()),
                    Some("thinking") => PartialBlock::Thinking {
                        text: block["thinking"].as_str().unwrap_or_default().to_string(),
                        signature: None,
                    },
                    Some("tool_use") => PartialBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        json: String::new(),
                    },
                    other => return Err(malformed("messages", format!("unknown block type {other:?}"))),
                };
                self.blocks.push((index, partial));
            }
            "content_block_delta" => {
                let index = payload["index"].as_u64().unwrap_or(0);
                let delta = &payload["delta"];
                let block = self.block_mut(index)?;
                match (delta["type"].as_str(), block) {
                    (Some("text_delta"), PartialBlock::Text(text)) => {
                        text.push_str(delta["text"].as_str().unwrap_or_default());
                    }
                    (Some("thinking_delta"), PartialBlock::Thinking { text, .. }) => {
                        text.push_str(delta["thinking"].as_str().unwrap_or_default());
                    }
                    (Some("signature_delta"), PartialBlock::Thinking { signature, .. }) => {
                        signature
                            .get_or_insert_with(String::new)
                            .push_str(delta["signature"].as_str().unwrap_or_default());
                    }
                    (Some("input_json_delta"), PartialBlock::ToolUse { json, .. }) => {
                        json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    (other, _) => {
                        return Err(malformed(
                            "messages",
                            format!("delta {other:?} does not match block {index}"),
                        ));
                    }
                }
            }
            "message_delta" => {
                if let Some(reason) = payload["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(decode_stop_reason(reason));
                }
                if let Some(output) = payload["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = output as u32;
                }
            }
            "error" => {
                let error = &payload["error"];
                let message = error["message"].as_str().unwrap_or("stream error").to_string();
                return Err(match error["type"].as_str() {
                    Some("rate_limit_error") => ProviderError::RateLimit { retry_after: None },
                    Some("overloaded_error") => ProviderError::ProviderServer {
                        status: 529,
                        message,
                    },
                    _ => ProviderError::ProviderServer {
                        status: 500,
                        message,
                    },
                });
            }
            // content_block_stop, message_stop and ping carry nothing we keep
            _ => {}
        }
        Ok(())
    }

    fn finish(mut self) -> Result<CanonicalResponse, ProviderError> {
        if !self.started {
            return Err(malformed("messages", "stream ended before message_start"));
        }
        self.blocks.sort_by_key(|(index, _)| *index);
        let mut content = Vec::with_capacity(self.blocks.len());
        for (_, block) in self.blocks {
            content.push(match block {
                PartialBlock::Text(text) => ContentBlock::Text { text },
                PartialBlock::Thinking { text, signature } => {
                    ContentBlock::Thinking { text, signature }
                }
                PartialBlock::ToolUse { name, .. } if name.is_empty() => {
                    return Err(malformed("messages", "tool_use block without a name"));
                }
                PartialBlock::ToolUse { id, name, json } => ContentBlock::ToolUse {
                    input: if json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&json).map_err(|e| malformed("messages", e))?
                    },
                    id,
                    name,
                },
            });
        }
        Ok(CanonicalResponse {
            id: self.id,
            model: self.model,
            content,
            stop_reason: self.stop_reason,
            usage: self.usage,
        })
    }
}

fn sse(event: Option<&str>, data: &Value) -> Bytes {
    match event {
        Some(name) => Bytes::from(format!("event: {name}\ndata: {data}\n\n")),
        None => Bytes::from(format!("data: {data}\n\n")),
    }
}

/// Re-encode a complete response as the SSE events `dialect` clients expect.
pub fn encode_stream(dialect: Dialect, response: &CanonicalResponse) -> Vec<Bytes> {
    match dialect {
        Dialect::OpenAi => encode_openai_stream(response),
        Dialect::Anthropic => encode_anthropic_stream(response),
    }
}

fn encode_openai_stream(response: &CanonicalResponse) -> Vec<Bytes> {
    let created = unix_now();
    let chunk = |delta: Value, finish_reason: Value| {
        json!({
            "id": response.id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": response.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    };

    let mut events = vec![sse(None, &chunk(json!({"role": "assistant"}), Value::Null))];
    if let Some(thinking) = response.thinking() {
        events.push(sse(
            None,
            &chunk(json!({"reasoning_content": thinking}), Value::Null),
        ));
    }
    let text = response.text();
    if !text.is_empty() {
        events.push(sse(None, &chunk(json!({"content": text}), Value::Null)));
    }
    for (index, (id, name, input)) in response.tool_calls().enumerate() {
        events.push(sse(
            None,
            &chunk(
                json!({"tool_calls": [{
                    "index": index,
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments_string(input)},
                }]}),
                Value::Null,
            ),
        ));
    }
    let finish = response
        .stop_reason
        .map(|r| json!(encode_finish_reason(r)))
        .unwrap_or(json!("stop"));
    let mut last = chunk(json!({}), finish);
    last["usage"] = json!({
        "prompt_tokens": response.usage.input_tokens,
        "completion_tokens": response.usage.output_tokens,
        "total_tokens": response.usage.total(),
    });
    events.push(sse(None, &last));
    events.push(Bytes::from_static(b"data: [DONE]\n\n"));
    events
}

fn encode_anthropic_stream(response: &CanonicalResponse) -> Vec<Bytes> {
    let mut events = vec![sse(
        Some("message_start"),
        &json!({
            "type": "message_start",
            "message": {
                "id": response.id,
                "type": "message",
                "role": "assistant",
                "model": response.model,
                "content": [],
                "stop_reason": Value::Null,
                "usage": {"input_tokens": response.usage.input_tokens, "output_tokens": 0},
            },
        }),
    )];

    for (index, block) in response.content.iter().enumerate() {
        let (start, deltas) = match block {
            ContentBlock::Text { text } => (
                json!({"type": "text", "text": ""}),
                vec![json!({"type": "text_delta", "text": text})],
            ),
            ContentBlock::Thinking { text, signature } => {
                let mut deltas = vec![json!({"type": "thinking_delta", "thinking": text})];
                if let Some(signature) = signature {
                    deltas.push(json!({"type": "signature_delta", "signature": signature}));
                }
                (json!({"type": "thinking", "thinking": ""}), deltas)
            }
            ContentBlock::ToolUse { id, name, input } => (
                json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
                vec![json!({"type": "input_json_delta", "partial_json": input.to_string()})],
            ),
            other => (encode_block(other), Vec::new()),
        };
        events.push(sse(
            Some("content_block_start"),
            &json!({"type": "content_block_start", "index": index, "content_block": start}),
        ));
        for delta in deltas {
            events.push(sse(
                Some("content_block_delta"),
                &json!({"type": "content_block_delta", "index": index, "delta": delta}),
            ));
        }
        events.push(sse(
            Some("content_block_stop"),
            &json!({"type": "content_block_stop", "index": index}),
        ));
    }

    events.push(sse(
        Some("message_delta"),
        &json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": response.stop_reason.map(encode_stop_reason),
                "stop_sequence": Value::Null,
            },
            "usage": {"output_tokens": response.usage.output_tokens},
        }),
    ));
    events.push(sse(
        Some("message_stop"),
        &json!({"type": "message_stop"}),
    ));
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> CanonicalResponse {
        CanonicalResponse {
            id: "resp-1".into(),
            model: "model-x".into(),
            content: vec![
                ContentBlock::Thinking {
                    text: "Plan the call.".into(),
                    signature: None,
                },
                ContentBlock::text("Looking it up."),
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "search".into(),
                    input: json!({"q": "tokio"}),
                },
            ],
            stop_reason: Some(StopReason::ToolUse),
            usage: Usage {
                input_tokens: 11,
                output_tokens: 7,
            },
        }
    }

    fn reassemble(dialect: Dialect, events: &[Bytes]) -> CanonicalResponse {
        let mut accumulator = StreamAccumulator::new(dialect);
        for event in events {
            accumulator.push_bytes(event).unwrap();
        }
        accumulator.finish().unwrap()
    }

    #[test]
    fn test_reencoded_stream_reassembles_in_both_dialects() {
        for dialect in [Dialect::OpenAi, Dialect::Anthropic] {
            let events = encode_stream(dialect, &response());
            assert_eq!(reassemble(dialect, &events), response(), "dialect {dialect}");
        }
    }

    #[test]
    fn test_openai_fragmented_tool_arguments() {
        let raw = concat!(
            "data: {\"id\":\"c1\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"type\":\"function\",\"function\":{\"name\":\"calc\",\"arguments\":\"{\\\"x\\\":\"}}]}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\" 2}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":9}}\n\n",
            "data: [DONE]\n\n",
        );
        let mut accumulator = StreamAccumulator::new(Dialect::OpenAi);
        accumulator.push_bytes(raw.as_bytes()).unwrap();
        let response = accumulator.finish().unwrap();

        let calls: Vec<_> = response.tool_calls().collect();
        assert_eq!(calls, vec![("call_a", "calc", &json!({"x": 2}))]);
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage.output_tokens, 9);
    }

    fn openai_tool_chunk(calls: Value) -> String {
        let chunk = json!({
            "id": "c1",
            "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": calls}}],
        });
        format!("data: {chunk}\n\n")
    }

    #[test]
    fn test_openai_sparse_and_interleaved_tool_call_indexes() {
        let mut accumulator = StreamAccumulator::new(Dialect::OpenAi);
        for calls in [
            json!([{"index": 4_000_000_000u64, "id": "call_b", "function": {"name": "clock", "arguments": ""}}]),
            json!([{"index": 2, "id": "call_a", "function": {"name": "weather", "arguments": "{\"city\":"}}]),
            json!([{"index": 4_000_000_000u64, "function": {"arguments": "{}"}}]),
            json!([{"index": 2, "function": {"arguments": "\"Oslo\"}"}}]),
        ] {
            accumulator
                .push_bytes(openai_tool_chunk(calls).as_bytes())
                .unwrap();
        }
        let response = accumulator.finish().unwrap();
        let calls: Vec<_> = response.tool_calls().collect();
        assert_eq!(
            calls,
            vec![
                ("call_a", "weather", &json!({"city": "Oslo"})),
                ("call_b", "clock", &json!({})),
            ]
        );
    }

    #[test]
    fn test_openai_tool_call_without_name_is_rejected() {
        let mut accumulator = StreamAccumulator::new(Dialect::OpenAi);
        accumulator
            .push_bytes(openai_tool_chunk(json!([{"index": 1, "function": {"arguments": "{}"}}])).as_bytes())
            .unwrap();
        assert!(matches!(
            accumulator.finish(),
            Err(ProviderError::ProviderServer { status: 200, .. })
        ));
    }

    #[test]
    fn test_anthropic_error_event_maps_to_provider_error() {
        let raw = b"event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let mut accumulator = StreamAccumulator::new(Dialect::Anthropic);
        let err = accumulator.push_bytes(raw).unwrap_err();
        assert_eq!(
            err,
            ProviderError::ProviderServer {
                status: 529,
                message: "Overloaded".into()
            }
        );
    }

    #[test]
    fn test_empty_stream_is_an_error() {
        assert!(StreamAccumulator::new(Dialect::OpenAi).finish().is_err());
        assert!(StreamAccumulator::new(Dialect::Anthropic).finish().is_err());
    }
}
