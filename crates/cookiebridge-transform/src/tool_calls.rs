//! Recovery of tool calls from free-form model text.
//!
//! The upstream has no structured tool-calling channel, so calls arrive as a
//! `{"tool_calls": [...]}` envelope somewhere in the reply. Recovery is a
//! layered, cost-bounded fallback chain and is never authoritative: when in
//! doubt the text is returned unchanged.

use std::ops::Range;
use std::sync::OnceLock;

use cookiebridge_protocol::openai::chat::types::{
    ChatCompletionFunctionCall, ChatCompletionMessageToolCall, ChatCompletionMessageToolCallChunk,
    ChatCompletionMessageToolCallChunkFunction, ChatCompletionToolCallChunkType,
};
use regex::Regex;
use serde_json::Value;

use crate::repair::repair_object;

const TOOL_CALLS_KEY: &str = "\"tool_calls\"";
const LARGE_TEXT_BYTES: usize = 50_000;
const LARGE_TEXT_WINDOW: usize = 5_000;
const MAX_FALLBACK_ATTEMPTS: usize = 10;
const MAX_FENCED_BLOCKS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Always a JSON-encoded string.
    pub arguments: String,
}

impl ToolCall {
    pub fn to_message_tool_call(&self) -> ChatCompletionMessageToolCall {
        ChatCompletionMessageToolCall::Function {
            id: self.id.clone(),
            function: ChatCompletionFunctionCall {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
        }
    }

    pub fn to_chunk(&self, index: i64) -> ChatCompletionMessageToolCallChunk {
        ChatCompletionMessageToolCallChunk {
            index,
            id: Some(self.id.clone()),
            r#type: Some(ChatCompletionToolCallChunkType::Function),
            function: Some(ChatCompletionMessageToolCallChunkFunction {
                name: Some(self.name.clone()),
                arguments: Some(self.arguments.clone()),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub calls: Vec<ToolCall>,
    /// Text with the envelope (or its fenced block) removed; the untouched
    /// input when no call was recovered.
    pub remaining: String,
    /// An envelope key was present but no call could be recovered.
    pub malformed: bool,
}

impl Extraction {
    fn unchanged(text: &str, malformed: bool) -> Self {
        Self {
            calls: Vec::new(),
            remaining: text.to_string(),
            malformed,
        }
    }
}

/// Returns the recovered calls and the remaining prose. Never fails: any
/// problem yields `([], text)`.
pub fn extract_tool_calls(text: &str) -> (Vec<ToolCall>, String) {
    let extraction = extract(text);
    (extraction.calls, extraction.remaining)
}

pub fn extract(text: &str) -> Extraction {
    if !text.contains(TOOL_CALLS_KEY) {
        return Extraction::unchanged(text, false);
    }

    let direct = find_envelope(text).map(|(value, span)| (value, widen_to_fence(text, span)));
    let Some((envelope, span)) = direct.or_else(|| find_fenced_envelope(text)) else {
        return Extraction::unchanged(text, true);
    };

    let calls = parse_calls(&envelope);
    if calls.is_empty() {
        return Extraction::unchanged(text, true);
    }

    let mut remaining = String::with_capacity(text.len() - span.len());
    remaining.push_str(&text[..span.start]);
    remaining.push_str(&text[span.end..]);
    Extraction {
        calls,
        remaining: remaining.trim().to_string(),
        malformed: false,
    }
}

/// Locates a top-level object carrying `tool_calls`. The returned span is in
/// `text` coordinates.
fn find_envelope(text: &str) -> Option<(Value, Range<usize>)> {
    let (window, offset) = search_window(text);
    let key_at = window.rfind(TOOL_CALLS_KEY)?;

    if let Some(start) = window[..key_at].rfind('{')
        && let Some((value, len)) = decode_at(window, start)
    {
        return Some((value, offset + start..offset + start + len));
    }

    let mut attempts = 0;
    let mut cursor = 0;
    while attempts < MAX_FALLBACK_ATTEMPTS {
        let start = cursor + window[cursor..].find('{')?;
        attempts += 1;
        if let Some((value, len)) = decode_at(window, start) {
            return Some((value, offset + start..offset + start + len));
        }
        cursor = start + 1;
    }
    None
}

/// Structural decode at `start`, ignoring whatever follows the object, with
/// the repair pass as a second chance.
fn decode_at(text: &str, start: usize) -> Option<(Value, usize)> {
    let fragment = &text[start..];
    let mut stream = serde_json::Deserializer::from_str(fragment).into_iter::<Value>();
    let decoded = match stream.next() {
        Some(Ok(value)) => Some((value, stream.byte_offset())),
        _ => None,
    };
    let (value, len) = decoded.or_else(|| repair_object(fragment))?;
    has_tool_calls(&value).then_some((value, len))
}

fn find_fenced_envelope(text: &str) -> Option<(Value, Range<usize>)> {
    for captures in fenced_block().captures_iter(text).take(MAX_FENCED_BLOCKS) {
        let (Some(block), Some(body)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if !body.as_str().contains(TOOL_CALLS_KEY) {
            continue;
        }
        if let Some((value, _)) = find_envelope(body.as_str().trim()) {
            return Some((value, block.range()));
        }
    }
    None
}

/// A directly decoded envelope that is the sole content of a fenced block
/// takes the fence with it.
fn widen_to_fence(text: &str, span: Range<usize>) -> Range<usize> {
    fenced_block()
        .captures_iter(text)
        .take(MAX_FENCED_BLOCKS)
        .filter_map(|captures| Some((captures.get(0)?, captures.get(1)?)))
        .find(|(_, body)| {
            body.start() <= span.start
                && span.end <= body.end()
                && body.as_str().trim() == &text[span.clone()]
        })
        .map(|(block, _)| block.range())
        .unwrap_or(span)
}

/// Texts over the size threshold are only searched near the last envelope
/// key.
fn search_window(text: &str) -> (&str, usize) {
    if text.len() <= LARGE_TEXT_BYTES {
        return (text, 0);
    }
    let Some(key_at) = text.rfind(TOOL_CALLS_KEY) else {
        return (text, 0);
    };
    let mut start = key_at.saturating_sub(LARGE_TEXT_WINDOW);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (key_at + LARGE_TEXT_WINDOW).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    (&text[start..end], start)
}

fn has_tool_calls(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|object| object.contains_key("tool_calls"))
}

fn parse_calls(envelope: &Value) -> Vec<ToolCall> {
    let Some(items) = envelope.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| item.is_object())
        .map(|item| {
            let function = item.get("function");
            let name = function
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = match function.and_then(|function| function.get("arguments")) {
                Some(Value::String(raw)) => raw.clone(),
                None | Some(Value::Null) => "{}".to_string(),
                Some(other) => other.to_string(),
            };
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(synthesize_call_id);
            ToolCall {
                id,
                name,
                arguments,
            }
        })
        .collect()
}

fn synthesize_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..12])
}

fn fenced_block() -> &'static Regex {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    FENCED.get_or_init(|| {
        Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("fenced block regex should compile")
    })
}
