use std::sync::OnceLock;

use bytes::Bytes;
use cookiebridge_protocol::openai::chat::stream::{
    ChatCompletionChunkObjectType, ChatCompletionStreamChoice, CreateChatCompletionStreamResponse,
};
use cookiebridge_protocol::openai::chat::types::{
    ChatCompletionFinishReason, ChatCompletionRole, ChatCompletionStreamResponseDelta,
    CompletionUsage,
};
use cookiebridge_protocol::sse;
use regex::Regex;

use crate::tool_calls::ToolCall;

/// Target size of a resegmented chunk, in characters.
const SEGMENT_TARGET_CHARS: usize = 50;

/// Builds `chat.completion.chunk` frames for one response.
///
/// Content can arrive as true upstream deltas ([`Self::content`]) or as one
/// complete text that is split up ([`Self::resegment`]). Either way the
/// stream ends with [`Self::finish`] followed by [`Self::done`].
#[derive(Debug, Clone)]
pub struct ChatCompletionStreamFramer {
    id: String,
    model: String,
    created: i64,
    include_usage: bool,
    role_sent: bool,
}

impl ChatCompletionStreamFramer {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            include_usage: false,
            role_sent: false,
        }
    }

    pub fn with_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }

    /// Pass-through delta. Empty deltas produce no frame; the first non-empty
    /// one carries the assistant role.
    pub fn content(&mut self, delta: &str) -> Option<CreateChatCompletionStreamResponse> {
        if delta.is_empty() {
            return None;
        }
        let role = self.take_role();
        Some(self.make_chunk(
            ChatCompletionStreamResponseDelta {
                role,
                content: Some(delta.to_string()),
                tool_calls: None,
            },
            None,
            None,
        ))
    }

    /// Splits a complete text into content frames; see [`segment_text`].
    pub fn resegment(&mut self, text: &str) -> Vec<CreateChatCompletionStreamResponse> {
        segment_text(text)
            .iter()
            .filter_map(|chunk| self.content(chunk))
            .collect()
    }

    /// One frame per call, each carrying the role and a single tool-call
    /// entry.
    pub fn tool_calls(&mut self, calls: &[ToolCall]) -> Vec<CreateChatCompletionStreamResponse> {
        self.role_sent = true;
        calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                self.make_chunk(
                    ChatCompletionStreamResponseDelta {
                        role: Some(ChatCompletionRole::Assistant),
                        content: None,
                        tool_calls: Some(vec![call.to_chunk(index as i64)]),
                    },
                    None,
                    None,
                )
            })
            .collect()
    }

    /// Empty-delta frame with the finish reason. Usage is attached only when
    /// the caller asked for it, zero-filled when the upstream reported none.
    pub fn finish(
        &mut self,
        reason: ChatCompletionFinishReason,
        usage: Option<CompletionUsage>,
    ) -> CreateChatCompletionStreamResponse {
        let usage = self.include_usage.then(|| usage.unwrap_or_default());
        self.make_chunk(ChatCompletionStreamResponseDelta::default(), Some(reason), usage)
    }

    pub fn done(&self) -> Bytes {
        sse::encode_done()
    }

    fn take_role(&mut self) -> Option<ChatCompletionRole> {
        if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some(ChatCompletionRole::Assistant)
        }
    }

    fn make_chunk(
        &self,
        delta: ChatCompletionStreamResponseDelta,
        finish_reason: Option<ChatCompletionFinishReason>,
        usage: Option<CompletionUsage>,
    ) -> CreateChatCompletionStreamResponse {
        CreateChatCompletionStreamResponse {
            id: self.id.clone(),
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatCompletionStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

/// Encodes a chunk as one SSE `data:` event.
pub fn encode_chunk(chunk: &CreateChatCompletionStreamResponse) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(chunk)?;
    Ok(sse::encode_data(&json))
}

/// Splits `text` into chunks that emulate incremental delivery.
///
/// Sentence pieces (split after `[.!?]+` followed by whitespace) accumulate
/// until a chunk reaches the target size or ends a sentence. When that
/// yields at most one chunk the text is packed word by word instead.
/// Concatenating the result always reproduces `text` exactly.
pub fn segment_text(text: &str) -> Vec<String> {
    let chunks = split_sentences(text);
    if chunks.len() > 1 {
        return chunks;
    }
    pack_words(text)
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut last = 0;
    let mut pieces = Vec::new();
    for found in sentence_break().find_iter(text) {
        pieces.push(&text[last..found.start()]);
        pieces.push(found.as_str());
        last = found.end();
    }
    pieces.push(&text[last..]);

    for piece in pieces {
        current.push_str(piece);
        let ends_sentence = piece.trim().ends_with(['.', '!', '?']);
        if (current.chars().count() >= SEGMENT_TARGET_CHARS || ends_sentence)
            && !current.trim().is_empty()
        {
            chunks.push(std::mem::take(&mut current));
        }
    }
    push_remainder(&mut chunks, current);
    chunks
}

fn pack_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let leading = word().find(text).map_or(text.len(), |found| found.start());
    let mut current = text[..leading].to_string();
    for found in word().find_iter(text) {
        current.push_str(found.as_str());
        if current.chars().count() >= SEGMENT_TARGET_CHARS {
            chunks.push(std::mem::take(&mut current));
        }
    }
    push_remainder(&mut chunks, current);
    chunks
}

/// Whitespace-only leftovers join the previous chunk so nothing is lost.
fn push_remainder(chunks: &mut Vec<String>, rest: String) {
    if rest.is_empty() {
        return;
    }
    match chunks.last_mut() {
        Some(last) if rest.trim().is_empty() => last.push_str(&rest),
        _ => chunks.push(rest),
    }
}

fn sentence_break() -> &'static Regex {
    static SENTENCE_BREAK: OnceLock<Regex> = OnceLock::new();
    SENTENCE_BREAK
        .get_or_init(|| Regex::new(r"[.!?]+\s+").expect("sentence regex should compile"))
}

fn word() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"\S+\s*").expect("word regex should compile"))
}
