//! Recovery of structure that some providers leave embedded in plain text.
//!
//! Models served behind OpenAI-compatible endpoints sometimes emit tool invocations as JSON or
//! XML-ish markup inside the message text, and reasoning between `<think>` tags, instead of
//! using the dedicated fields. These helpers lift both back into typed content blocks.

use super::canonical::{CanonicalResponse, ContentBlock, StopReason};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;
use tracing::debug;

static MARKUP_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:tool_call|tool_use|function_call)>\s*(.*?)\s*</(?:tool_call|tool_use|function_call)>")
        .expect("tool call pattern is valid")
});

static THINK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<think(?:ing)?>(.*?)</think(?:ing)?>").expect("think pattern is valid")
});

/// A tool invocation recovered from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCall {
    pub name: String,
    pub input: Value,
}

/// Pull tool calls out of `text`, returning the remaining text and the calls found.
///
/// Recognizes `{"tool_calls": [...]}` objects and `<tool_call>`, `<tool_use>` or
/// `<function_call>` elements wrapping a JSON call.
pub fn extract_tool_calls(text: &str) -> (String, Vec<ExtractedCall>) {
    let mut calls = Vec::new();

    let without_markup = MARKUP_CALL.replace_all(text, |caps: &regex::Captures<'_>| {
        match serde_json::from_str::<Value>(&caps[1]) {
            Ok(value) => {
                let before = calls.len();
                collect_calls(&value, &mut calls);
                if calls.len() > before {
                    return String::new();
                }
                caps[0].to_string()
            }
            Err(_) => caps[0].to_string(),
        }
    });
    let mut remaining = without_markup.into_owned();

    while let Some((start, end, value)) = find_tool_calls_object(&remaining) {
        let before = calls.len();
        collect_calls(&value, &mut calls);
        if calls.len() == before {
            break;
        }
        remaining.replace_range(start..end, "");
    }

    (remaining.trim().to_string(), calls)
}

/// Split `<think>` segments out of `text`, returning (thinking, answer).
pub fn split_thinking(text: &str) -> (Option<String>, String) {
    let thoughts: Vec<String> = THINK_TAG
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if thoughts.is_empty() {
        return (None, text.to_string());
    }
    let answer = THINK_TAG.replace_all(text, "").trim().to_string();
    (Some(thoughts.join("\n")), answer)
}

/// Lift embedded reasoning and tool calls into their own blocks.
///
/// Tool extraction only runs when the request declared tools and the provider returned no
/// native tool calls, so ordinary JSON answers are left alone.
pub fn normalize_response(response: &mut CanonicalResponse, tools_declared: bool) {
    let has_native_calls = response.tool_calls().next().is_some();
    let has_native_thinking = response.thinking().is_some();

    let mut content = Vec::with_capacity(response.content.len());
    let mut extracted = Vec::new();
    for block in std::mem::take(&mut response.content) {
        let ContentBlock::Text { text } = block else {
            content.push(block);
            continue;
        };
        let (thinking, mut text) = if has_native_thinking {
            (None, text)
        } else {
            split_thinking(&text)
        };
        if let Some(thinking) = thinking {
            content.push(ContentBlock::Thinking {
                text: thinking,
                signature: None,
            });
        }
        if tools_declared && !has_native_calls {
            let (rest, calls) = extract_tool_calls(&text);
            if !calls.is_empty() {
                text = rest;
                extracted.extend(calls);
            }
        }
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
    }

    if !extracted.is_empty() {
        debug!(count = extracted.len(), "Extracted tool calls from response text");
        for call in extracted {
            content.push(ContentBlock::ToolUse {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: call.name,
                input: call.input,
            });
        }
        response.stop_reason = Some(StopReason::ToolUse);
    }
    response.content = content;
}

fn find_tool_calls_object(text: &str) -> Option<(usize, usize, Value)> {
    let key = text.find("\"tool_calls\"")?;
    let start = text[..key].rfind('{')?;
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    let value = stream.next()?.ok()?;
    let end = start + stream.byte_offset();
    Some((start, end, value))
}

fn collect_calls(value: &Value, calls: &mut Vec<ExtractedCall>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_calls(item, calls)),
        Value::Object(map) => {
            if let Some(inner) = map.get("tool_calls") {
                collect_calls(inner, calls);
            } else if let Some(call) = parse_call(value) {
                calls.push(call);
            }
        }
        _ => {}
    }
}

fn parse_call(value: &Value) -> Option<ExtractedCall> {
    // {"function": {"name": ..., "arguments": ...}}
    if let Some(function) = value.get("function") {
        let name = function.get("name")?.as_str()?;
        return Some(ExtractedCall {
            name: name.to_string(),
            input: normalize_arguments(function.get("arguments")),
        });
    }
    // {"name": ..., "arguments" | "input" | "parameters": ...}
    if let Some(name) = value.get("name").and_then(Value::as_str) {
        let arguments = value
            .get("arguments")
            .or_else(|| value.get("input"))
            .or_else(|| value.get("parameters"));
        return Some(ExtractedCall {
            name: name.to_string(),
            input: normalize_arguments(arguments),
        });
    }
    // {"tool": ..., "args": ...}
    let name = value.get("tool")?.as_str()?;
    Some(ExtractedCall {
        name: name.to_string(),
        input: normalize_arguments(value.get("args")),
    })
}

fn normalize_arguments(arguments: Option<&Value>) -> Value {
    match arguments {
        None | Some(Value::Null) => json!({}),
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_else(|_| json!({"input": raw})),
        Some(other) => other.clone(),
    }
}
