//! Anthropic messages dialect, also spoken by MiniMax's Anthropic-compatible endpoint.

use super::canonical::{
    CanonicalRequest, CanonicalResponse, ContentBlock, ImageSource, Message, Role, StopReason,
    ThinkingConfig, ToolChoice, ToolDefinition, Usage,
};
use super::{DroppedField, Transformed, from_wire};
use crate::errors::FormatError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Anthropic rejects requests without `max_tokens`; this is what we send when the client gave none.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Deserialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(default)]
    system: Option<SystemPrompt>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    top_k: Option<u32>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<WireTool>>,
    #[serde(default)]
    tool_choice: Option<WireToolChoice>,
    #[serde(default)]
    thinking: Option<WireThinking>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
struct SystemBlock {
    text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    Image {
        source: WireImageSource,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

#[derive(Debug, Clone, Deserialize)]
struct WireThinking {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub(crate) input_tokens: u32,
    #[serde(default)]
    pub(crate) output_tokens: u32,
}

pub fn decode_request(body: &Value) -> Result<Transformed<CanonicalRequest>, FormatError> {
    let wire: MessagesRequest = from_wire("messages request", body)?;
    let dropped: Vec<DroppedField> = wire
        .extra
        .keys()
        .map(|key| DroppedField::new(key.clone(), "no canonical equivalent"))
        .collect();

    let mut messages = Vec::with_capacity(wire.messages.len());
    for (index, message) in wire.messages.into_iter().enumerate() {
        let blocks = match message.content {
            WireContent::Text(text) => vec![WireBlock::Text { text }],
            WireContent::Blocks(blocks) => blocks,
        };
        match message.role.as_str() {
            "user" => {
                // Tool results travel inside user turns; canonical form gives each its own message.
                let mut content = Vec::new();
                for block in blocks {
                    match decode_block(block) {
                        result @ ContentBlock::ToolResult { .. } => messages.push(Message {
                            role: Role::Tool,
                            content: vec![result],
                        }),
                        other => content.push(other),
                    }
                }
                if !content.is_empty() {
                    messages.push(Message {
                        role: Role::User,
                        content,
                    });
                }
            }
            "assistant" => messages.push(Message {
                role: Role::Assistant,
                content: blocks.into_iter().map(decode_block).collect(),
            }),
            other => {
                return Err(FormatError::invalid(
                    format!("messages[{index}].role"),
                    format!("unknown role `{other}`"),
                ));
            }
        }
    }

    let thinking = match wire.thinking {
        Some(thinking) if thinking.kind == "enabled" => Some(ThinkingConfig {
            budget_tokens: thinking.budget_tokens,
            effort: None,
        }),
        _ => None,
    };

    let request = CanonicalRequest {
        model: wire.model,
        system: wire.system.map(|system| match system {
            SystemPrompt::Text(text) => text,
            SystemPrompt::Blocks(blocks) => blocks
                .into_iter()
                .map(|b| b.text)
                .collect::<Vec<_>>()
                .join("\n"),
        }),
        messages,
        max_tokens: wire.max_tokens,
        temperature: wire.temperature,
        top_p: wire.top_p,
        top_k: wire.top_k,
        stop: wire.stop_sequences.unwrap_or_default(),
        stream: wire.stream.unwrap_or(false),
        tools: wire
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.name,
                description: tool.description,
                parameters: tool
                    .input_schema
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect(),
        tool_choice: wire.tool_choice.map(|choice| match choice {
            WireToolChoice::Auto => ToolChoice::Auto,
            WireToolChoice::Any => ToolChoice::Required,
            WireToolChoice::None => ToolChoice::None,
            WireToolChoice::Tool { name } => ToolChoice::Tool(name),
        }),
        thinking,
        frequency_penalty: None,
        presence_penalty: None,
        seed: None,
        response_format: None,
        user: wire.metadata.and_then(|m| m.user_id),
    };

    Ok(Transformed::new(request, dropped))
}

pub fn encode_request(request: &CanonicalRequest) -> Transformed<Value> {
    let mut dropped = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    // Consecutive tool results are folded into a single user turn.
    let mut pending_results: Vec<Value> = Vec::new();

    for message in &request.messages {
        if message.role != Role::Tool && !pending_results.is_empty() {
            messages.push(json!({"role": "user", "content": std::mem::take(&mut pending_results)}));
        }
        match message.role {
            Role::Tool => {
                pending_results.extend(message.content.iter().map(encode_block));
            }
            Role::User => {
                let content = match message.content.as_slice() {
                    [ContentBlock::Text { text }] => json!(text),
                    blocks => Value::Array(blocks.iter().map(encode_block).collect()),
                };
                messages.push(json!({"role": "user", "content": content}));
            }
            Role::Assistant => {
                let content: Vec<Value> = message.content.iter().map(encode_block).collect();
                messages.push(json!({"role": "assistant", "content": content}));
            }
        }
    }
    if !pending_results.is_empty() {
        messages.push(json!({"role": "user", "content": pending_results}));
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), Value::Array(messages));
    let max_tokens = match request.max_tokens {
        Some(max_tokens) => max_tokens,
        None => {
            dropped.push(DroppedField::new(
                "max_tokens",
                format!("required by Anthropic; defaulted to {DEFAULT_MAX_TOKENS}"),
            ));
            DEFAULT_MAX_TOKENS
        }
    };
    body.insert("max_tokens".into(), json!(max_tokens));
    if let Some(system) = &request.system {
        body.insert("system".into(), json!(system));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".into(), json!(top_p));
    }
    if let Some(top_k) = request.top_k {
        body.insert("top_k".into(), json!(top_k));
    }
    if !request.stop.is_empty() {
        body.insert("stop_sequences".into(), json!(request.stop));
    }
    if request.stream {
        body.insert("stream".into(), json!(true));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut encoded = json!({"name": tool.name, "input_schema": tool.parameters});
                if let Some(description) = &tool.description {
                    encoded["description"] = json!(description);
                }
                encoded
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
    }
    if let Some(choice) = &request.tool_choice {
        let encoded = match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Required => json!({"type": "any"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
        };
        body.insert("tool_choice".into(), encoded);
    }
    if let Some(thinking) = &request.thinking {
        let budget = match (thinking.budget_tokens, thinking.effort.as_deref()) {
            (Some(budget), _) => budget,
            (None, effort) => {
                dropped.push(DroppedField::new(
                    "thinking.effort",
                    "Anthropic takes a token budget; effort mapped to a budget",
                ));
                effort_budget(effort)
            }
        };
        body.insert(
            "thinking".into(),
            json!({"type": "enabled", "budget_tokens": budget}),
        );
    }
    if let Some(user) = &request.user {
        body.insert("metadata".into(), json!({"user_id": user}));
    }
    for (field, present) in [
        ("frequency_penalty", request.frequency_penalty.is_some()),
        ("presence_penalty", request.presence_penalty.is_some()),
        ("seed", request.seed.is_some()),
        ("response_format", request.response_format.is_some()),
    ] {
        if present {
            dropped.push(DroppedField::new(field, "not supported by Anthropic"));
        }
    }

    Transformed::new(Value::Object(body), dropped)
}

pub fn decode_response(body: &Value) -> Result<CanonicalResponse, FormatError> {
    let wire: MessagesResponse = from_wire("messages response", body)?;
    if body.get("content").is_none() {
        return Err(FormatError::MissingField("content".into()));
    }
    let usage = wire.usage.unwrap_or_default();
    Ok(CanonicalResponse {
        id: wire.id.unwrap_or_default(),
        model: wire.model.unwrap_or_default(),
        content: wire.content.into_iter().map(decode_block).collect(),
        stop_reason: wire.stop_reason.as_deref().map(decode_stop_reason),
        usage: Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        },
    })
}

pub fn encode_response(response: &CanonicalResponse) -> Value {
    json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": response.content.iter().map(encode_block).collect::<Vec<_>>(),
        "stop_reason": response.stop_reason.map(encode_stop_reason),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": response.usage.input_tokens,
            "output_tokens": response.usage.output_tokens,
        },
    })
}

pub(crate) fn decode_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

pub(crate) fn encode_stop_reason(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ToolUse => "tool_use",
        StopReason::ContentFilter => "refusal",
    }
}

fn effort_budget(effort: Option<&str>) -> u32 {
    match effort {
        Some("low") => 1024,
        Some("high") => 16384,
        _ => 4096,
    }
}

fn decode_block(block: WireBlock) -> ContentBlock {
    match block {
        WireBlock::Text { text } => ContentBlock::Text { text },
        WireBlock::Image { source } => ContentBlock::Image {
            source: match source {
                WireImageSource::Base64 { media_type, data } => {
                    ImageSource::Base64 { media_type, data }
                }
                WireImageSource::Url { url } => ImageSource::Url { url },
            },
        },
        WireBlock::Thinking {
            thinking,
            signature,
        } => ContentBlock::Thinking {
            text: thinking,
            signature,
        },
        WireBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
        WireBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id,
            content: match content {
                None => String::new(),
                Some(ToolResultContent::Text(text)) => text,
                Some(ToolResultContent::Blocks(blocks)) => blocks
                    .into_iter()
                    .filter_map(|b| match b {
                        WireBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(""),
            },
            is_error: is_error.unwrap_or(false),
        },
    }
}

pub(crate) fn encode_block(block: &ContentBlock) -> Value {
    let wire = match block {
        ContentBlock::Text { text } => WireBlock::Text { text: text.clone() },
        ContentBlock::Image { source } => WireBlock::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => WireImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageSource::Url { url } => WireImageSource::Url { url: url.clone() },
            },
        },
        ContentBlock::Thinking { text, signature } => WireBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
        ContentBlock::ToolUse { id, name, input } => WireBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => WireBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Some(ToolResultContent::Text(content.clone())),
            is_error: is_error.then_some(true),
        },
    };
    serde_json::to_value(wire).unwrap_or(Value::Null)
}
