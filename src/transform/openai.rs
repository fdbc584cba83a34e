//! OpenAI chat completions dialect.
//!
//! Also covers OpenAI-compatible providers that return reasoning on a separate
//! `reasoning_content` field next to `content`.

use super::canonical::{
    CanonicalRequest, CanonicalResponse, ContentBlock, ImageSource, Message, Role, StopReason,
    ThinkingConfig, ToolChoice, ToolDefinition, Usage, collect_text,
};
use super::{DroppedField, Transformed, from_wire};
use crate::errors::FormatError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop: Option<StopSequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ChatToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    /// Fields the canonical model has no slot for
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ChatPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatPart {
    Text { text: String },
    ImageUrl { image_url: ChatImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatImageUrl {
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatTool {
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: ChatFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ChatToolChoice {
    Mode(String),
    Named {
        #[serde(rename = "type")]
        kind: String,
        function: NamedFunction,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NamedFunction {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<ChatContent>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub(crate) prompt_tokens: u32,
    #[serde(default)]
    pub(crate) completion_tokens: u32,
}

pub fn decode_request(body: &Value) -> Result<Transformed<CanonicalRequest>, FormatError> {
    let wire: ChatRequest = from_wire("chat completion request", body)?;
    let mut dropped: Vec<DroppedField> = wire
        .extra
        .keys()
        .map(|key| DroppedField::new(key.clone(), "no canonical equivalent"))
        .collect();

    let mut system_parts = Vec::new();
    let mut messages = Vec::with_capacity(wire.messages.len());
    for (index, message) in wire.messages.into_iter().enumerate() {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = content_text(message.content.as_ref());
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => messages.push(Message {
                role: Role::User,
                content: content_blocks(message.content)?,
            }),
            "assistant" => {
                let mut content = Vec::new();
                if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
                    content.push(ContentBlock::Thinking {
                        text: reasoning,
                        signature: None,
                    });
                }
                content.extend(content_blocks(message.content)?);
                for call in message.tool_calls.unwrap_or_default() {
                    content.push(ContentBlock::ToolUse {
                        input: parse_arguments(&call.function.arguments)?,
                        id: call.id,
                        name: call.function.name,
                    });
                }
                messages.push(Message {
                    role: Role::Assistant,
                    content,
                });
            }
            "tool" | "function" => {
                let tool_use_id = message
                    .tool_call_id
                    .or(message.name)
                    .ok_or_else(|| FormatError::MissingField(format!("messages[{index}].tool_call_id")))?;
                messages.push(Message {
                    role: Role::Tool,
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id,
                        content: content_text(message.content.as_ref()),
                        is_error: false,
                    }],
                });
            }
            other => {
                return Err(FormatError::invalid(
                    format!("messages[{index}].role"),
                    format!("unknown role `{other}`"),
                ));
            }
        }
    }

    let tool_choice = match wire.tool_choice {
        None => None,
        Some(ChatToolChoice::Mode(mode)) => Some(match mode.as_str() {
            "auto" => ToolChoice::Auto,
            "none" => ToolChoice::None,
            "required" => ToolChoice::Required,
            other => {
                return Err(FormatError::invalid(
                    "tool_choice",
                    format!("unknown mode `{other}`"),
                ));
            }
        }),
        Some(ChatToolChoice::Named { function, .. }) => Some(ToolChoice::Tool(function.name)),
    };

    if wire.stream_options.is_some() && wire.stream != Some(true) {
        dropped.push(DroppedField::new(
            "stream_options",
            "only meaningful for streaming requests",
        ));
    }

    let request = CanonicalRequest {
        model: wire.model,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        messages,
        max_tokens: wire.max_completion_tokens.or(wire.max_tokens),
        temperature: wire.temperature,
        top_p: wire.top_p,
        top_k: None,
        stop: match wire.stop {
            None => Vec::new(),
            Some(StopSequence::Single(s)) => vec![s],
            Some(StopSequence::Multiple(v)) => v,
        },
        stream: wire.stream.unwrap_or(false),
        tools: wire
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool
                    .function
                    .parameters
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect(),
        tool_choice,
        thinking: wire.reasoning_effort.map(|effort| ThinkingConfig {
            budget_tokens: None,
            effort: Some(effort),
        }),
        frequency_penalty: wire.frequency_penalty,
        presence_penalty: wire.presence_penalty,
        seed: wire.seed,
        response_format: wire.response_format,
        user: wire.user,
    };

    Ok(Transformed::new(request, dropped))
}

pub fn encode_request(request: &CanonicalRequest) -> Transformed<Value> {
    let mut dropped = Vec::new();
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }

    for (index, message) in request.messages.iter().enumerate() {
        match message.role {
            Role::User => {
                messages.push(json!({
                    "role": "user",
                    "content": encode_user_content(index, &message.content, &mut dropped),
                }));
            }
            Role::Assistant => {
                messages.push(encode_assistant(index, &message.content, &mut dropped));
            }
            Role::Tool => {
                for block in &message.content {
                    match block {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            if *is_error {
                                dropped.push(DroppedField::new(
                                    format!("messages[{index}].is_error"),
                                    "tool messages have no error flag",
                                ));
                            }
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                        other => dropped.push(unsupported_block(index, other)),
                    }
                }
            }
        }
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), Value::Array(messages));
    if let Some(max_tokens) = request.max_tokens {
        body.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".into(), json!(top_p));
    }
    if request.top_k.is_some() {
        dropped.push(DroppedField::new("top_k", "not supported by OpenAI"));
    }
    if !request.stop.is_empty() {
        body.insert("stop".into(), json!(request.stop));
    }
    if request.stream {
        body.insert("stream".into(), json!(true));
        body.insert("stream_options".into(), json!({"include_usage": true}));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut function = json!({"name": tool.name, "parameters": tool.parameters});
                if let Some(description) = &tool.description {
                    function["description"] = json!(description);
                }
                json!({"type": "function", "function": function})
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
    }
    if let Some(choice) = &request.tool_choice {
        let encoded = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
        };
        body.insert("tool_choice".into(), encoded);
    }
    if let Some(thinking) = &request.thinking {
        if thinking.budget_tokens.is_some() {
            dropped.push(DroppedField::new(
                "thinking.budget_tokens",
                "OpenAI only accepts a reasoning effort",
            ));
        }
        if let Some(effort) = &thinking.effort {
            body.insert("reasoning_effort".into(), json!(effort));
        }
    }
    if let Some(penalty) = request.frequency_penalty {
        body.insert("frequency_penalty".into(), json!(penalty));
    }
    if let Some(penalty) = request.presence_penalty {
        body.insert("presence_penalty".into(), json!(penalty));
    }
    if let Some(seed) = request.seed {
        body.insert("seed".into(), json!(seed));
    }
    if let Some(format) = &request.response_format {
        body.insert("response_format".into(), format.clone());
    }
    if let Some(user) = &request.user {
        body.insert("user".into(), json!(user));
    }

    Transformed::new(Value::Object(body), dropped)
}

pub fn decode_response(body: &Value) -> Result<CanonicalResponse, FormatError> {
    let wire: ChatResponse = from_wire("chat completion response", body)?;
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| FormatError::MissingField("choices".into()))?;

    let mut content = Vec::new();
    if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
        content.push(ContentBlock::Thinking {
            text: reasoning,
            signature: None,
        });
    }
    content.extend(content_blocks(choice.message.content)?);
    for call in choice.message.tool_calls.unwrap_or_default() {
        content.push(ContentBlock::ToolUse {
            input: parse_arguments(&call.function.arguments)?,
            id: call.id,
            name: call.function.name,
        });
    }

    let usage = wire.usage.unwrap_or_default();
    Ok(CanonicalResponse {
        id: wire.id.unwrap_or_default(),
        model: wire.model.unwrap_or_default(),
        content,
        stop_reason: choice.finish_reason.as_deref().map(decode_finish_reason),
        usage: Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    })
}

pub fn encode_response(response: &CanonicalResponse) -> Value {
    let text = response.text();
    let mut message = json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { json!(text) },
    });
    if let Some(thinking) = response.thinking() {
        message["reasoning_content"] = json!(thinking);
    }
    let tool_calls: Vec<Value> = response
        .tool_calls()
        .map(|(id, name, input)| encode_tool_call(id, name, input))
        .collect();
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": response.id,
        "object": "chat.completion",
        "created": unix_now(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": response.stop_reason.map(encode_finish_reason),
        }],
        "usage": {
            "prompt_tokens": response.usage.input_tokens,
            "completion_tokens": response.usage.output_tokens,
            "total_tokens": response.usage.total(),
        },
    })
}

pub(crate) fn decode_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

pub(crate) fn encode_finish_reason(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        StopReason::ContentFilter => "content_filter",
    }
}

pub(crate) fn encode_tool_call(id: &str, name: &str, input: &Value) -> Value {
    json!({
        "id": id,
        "type": "function",
        "function": {"name": name, "arguments": arguments_string(input)},
    })
}

pub(crate) fn arguments_string(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Function arguments arrive as a JSON-encoded string; empty means no arguments.
pub(crate) fn parse_arguments(arguments: &str) -> Result<Value, FormatError> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments)
        .map_err(|e| FormatError::invalid("tool_calls.function.arguments", e.to_string()))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn content_text(content: Option<&ChatContent>) -> String {
    match content {
        None => String::new(),
        Some(ChatContent::Text(text)) => text.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                ChatPart::Text { text } => Some(text.as_str()),
                ChatPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

fn content_blocks(content: Option<ChatContent>) -> Result<Vec<ContentBlock>, FormatError> {
    Ok(match content {
        None => Vec::new(),
        Some(ChatContent::Text(text)) if text.is_empty() => Vec::new(),
        Some(ChatContent::Text(text)) => vec![ContentBlock::Text { text }],
        Some(ChatContent::Parts(parts)) => parts
            .into_iter()
            .map(|part| match part {
                ChatPart::Text { text } => ContentBlock::Text { text },
                ChatPart::ImageUrl { image_url } => ContentBlock::Image {
                    source: decode_image_url(image_url.url),
                },
            })
            .collect(),
    })
}

fn decode_image_url(url: String) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((media_type, data)) = rest.split_once(";base64,")
    {
        return ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }
    ImageSource::Url { url }
}

fn encode_image(source: &ImageSource) -> Value {
    let url = match source {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url.clone(),
    };
    json!({"type": "image_url", "image_url": {"url": url}})
}

fn encode_user_content(
    index: usize,
    blocks: &[ContentBlock],
    dropped: &mut Vec<DroppedField>,
) -> Value {
    if let [ContentBlock::Text { text }] = blocks {
        return json!(text);
    }
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(json!({"type": "text", "text": text})),
            ContentBlock::Image { source } => parts.push(encode_image(source)),
            other => dropped.push(unsupported_block(index, other)),
        }
    }
    Value::Array(parts)
}

fn encode_assistant(
    index: usize,
    blocks: &[ContentBlock],
    dropped: &mut Vec<DroppedField>,
) -> Value {
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { .. } => {}
            ContentBlock::Thinking { text, signature } => {
                reasoning.push_str(text);
                if signature.is_some() {
                    dropped.push(DroppedField::new(
                        format!("messages[{index}].thinking.signature"),
                        "OpenAI has no reasoning signature",
                    ));
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(encode_tool_call(id, name, input));
            }
            other => dropped.push(unsupported_block(index, other)),
        }
    }

    let text = collect_text(blocks);
    let mut message = json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { json!(text) },
    });
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }
    message
}

fn unsupported_block(index: usize, block: &ContentBlock) -> DroppedField {
    let kind = match block {
        ContentBlock::Text { .. } => "text",
        ContentBlock::Image { .. } => "image",
        ContentBlock::Thinking { .. } => "thinking",
        ContentBlock::ToolUse { .. } => "tool_use",
        ContentBlock::ToolResult { .. } => "tool_result",
    };
    DroppedField::new(
        format!("messages[{index}].{kind}"),
        "block type not allowed for this role",
    )
}
