//! OpenAI chat completions on top of the upstream session.

use bytes::Bytes;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cookiebridge_common::GlobalConfig;
use cookiebridge_protocol::openai::chat::request::CreateChatCompletionRequestBody;
use cookiebridge_protocol::openai::chat::response::{
    ChatCompletionChoice, ChatCompletionObjectType, CreateChatCompletionResponse,
};
use cookiebridge_protocol::openai::chat::stream::CreateChatCompletionStreamResponse;
use cookiebridge_protocol::openai::chat::types::{
    ChatCompletionFinishReason, ChatCompletionResponseMessage, ChatCompletionRole,
    CompletionUsage,
};
use cookiebridge_protocol::openai::models::{
    ListModelsResponse, ListObjectType, Model, ModelObjectType,
};
use cookiebridge_protocol::sse;
use cookiebridge_provider_core::DeltaStream;
use cookiebridge_transform::{
    ChatCompletionStreamFramer, ToolCall, collapse_messages, encode_chunk, extract,
};

use crate::error::SessionResult;
use crate::session::{ChatReplyStream, UpstreamSession};

const MODEL_CREATED: i64 = 1_677_610_602;
const MODEL_OWNER: &str = "google";

/// A finished completion, or the SSE byte frames of one in progress.
#[derive(Debug)]
pub enum ChatCompletionReply {
    Json(CreateChatCompletionResponse),
    Stream(mpsc::Receiver<Bytes>),
}

pub async fn create_chat_completion(
    session: &UpstreamSession,
    config: &GlobalConfig,
    body: CreateChatCompletionRequestBody,
) -> SessionResult<ChatCompletionReply> {
    let model = config.resolve_model(body.model.as_deref());
    let response_model = body
        .model
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| model.clone());
    let tools = if body.wants_tool_calls() {
        body.tool_definitions()
    } else {
        Vec::new()
    };
    let prompt = collapse_messages(&body.messages, &tools);
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let created = OffsetDateTime::now_utc().unix_timestamp();
    info!(
        event = "chat_completion",
        model = %model,
        is_stream = body.is_stream(),
        tools = tools.len()
    );

    if !body.is_stream() {
        let text = session.generate(&prompt, Some(&model)).await?;
        let (calls, remaining) = split_tool_calls(&text, !tools.is_empty());
        return Ok(ChatCompletionReply::Json(build_response(
            id,
            created,
            response_model,
            &calls,
            remaining,
        )));
    }

    let framer = ChatCompletionStreamFramer::new(id, response_model, created)
        .with_usage(body.include_usage());
    if tools.is_empty() {
        let deltas = session.stream(&prompt, Some(&model)).await?;
        return Ok(ChatCompletionReply::Stream(spawn_passthrough(framer, deltas)));
    }

    // Tool calls can only be recovered from the complete text.
    let text = session.generate(&prompt, Some(&model)).await?;
    let (calls, remaining) = split_tool_calls(&text, true);
    Ok(ChatCompletionReply::Stream(spawn_frames(
        framed_text(framer, &calls, &remaining),
    )))
}

fn split_tool_calls(text: &str, enabled: bool) -> (Vec<ToolCall>, String) {
    if !enabled {
        return (Vec::new(), text.to_string());
    }
    let extraction = extract(text);
    if extraction.malformed {
        debug!(event = "malformed_tool_call_ignored", "tool_calls envelope could not be recovered");
    }
    (extraction.calls, extraction.remaining)
}

pub fn build_response(
    id: String,
    created: i64,
    model: String,
    calls: &[ToolCall],
    remaining: String,
) -> CreateChatCompletionResponse {
    let (content, tool_calls, finish_reason) = if calls.is_empty() {
        (Some(remaining), None, ChatCompletionFinishReason::Stop)
    } else {
        (
            Some(remaining).filter(|text| !text.is_empty()),
            Some(calls.iter().map(ToolCall::to_message_tool_call).collect()),
            ChatCompletionFinishReason::ToolCalls,
        )
    };
    CreateChatCompletionResponse {
        id,
        object: ChatCompletionObjectType::ChatCompletion,
        created,
        model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatCompletionResponseMessage {
                role: ChatCompletionRole::Assistant,
                content,
                tool_calls,
            },
            finish_reason,
        }],
        usage: Some(CompletionUsage::default()),
    }
}

/// Frames for a complete text: tool-call frames when calls were found,
/// resegmented content otherwise. Ends with the finish frame; `[DONE]` is
/// appended by the sender.
fn framed_text(
    mut framer: ChatCompletionStreamFramer,
    calls: &[ToolCall],
    remaining: &str,
) -> (ChatCompletionStreamFramer, Vec<CreateChatCompletionStreamResponse>) {
    let mut chunks = if calls.is_empty() {
        framer.resegment(remaining)
    } else {
        framer.tool_calls(calls)
    };
    let reason = if calls.is_empty() {
        ChatCompletionFinishReason::Stop
    } else {
        ChatCompletionFinishReason::ToolCalls
    };
    chunks.push(framer.finish(reason, None));
    (framer, chunks)
}

fn spawn_frames(
    (framer, chunks): (ChatCompletionStreamFramer, Vec<CreateChatCompletionStreamResponse>),
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        for chunk in &chunks {
            if !send_chunk(&tx, chunk).await {
                return;
            }
        }
        let _ = tx.send(framer.done()).await;
    });
    rx
}

/// Forwards upstream deltas as they arrive. A mid-stream failure becomes an
/// error event followed by `[DONE]`.
fn spawn_passthrough(
    mut framer: ChatCompletionStreamFramer,
    mut deltas: DeltaStream,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(item) = deltas.recv().await {
            match item {
                Ok(delta) => {
                    if let Some(chunk) = framer.content(&delta)
                        && !send_chunk(&tx, &chunk).await
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(event = "upstream_stream_failed", error = %err);
                    let _ = tx.send(error_frame(&err.to_string())).await;
                    let _ = tx.send(framer.done()).await;
                    return;
                }
            }
        }
        let finish = framer.finish(ChatCompletionFinishReason::Stop, None);
        if send_chunk(&tx, &finish).await {
            let _ = tx.send(framer.done()).await;
        }
    });
    rx
}

/// SSE frames `{"delta": ...}` for a streaming `/v1/chat` turn, ending with
/// `{"conversation_id": ...}` and `[DONE]`.
pub fn chat_stream_frames(stream: ChatReplyStream) -> mpsc::Receiver<Bytes> {
    let ChatReplyStream {
        conversation_id,
        mut deltas,
    } = stream;
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(item) = deltas.recv().await {
            let frame = match item {
                Ok(delta) if delta.is_empty() => continue,
                Ok(delta) => sse::encode_data(&json!({ "delta": delta }).to_string()),
                Err(err) => {
                    warn!(event = "upstream_stream_failed", error = %err);
                    let _ = tx.send(error_frame(&err.to_string())).await;
                    break;
                }
            };
            if tx.send(frame).await.is_err() {
                return;
            }
        }
        let tail = json!({ "conversation_id": conversation_id }).to_string();
        if tx.send(sse::encode_data(&tail)).await.is_ok() {
            let _ = tx.send(sse::encode_done()).await;
        }
    });
    rx
}

async fn send_chunk(tx: &mpsc::Sender<Bytes>, chunk: &CreateChatCompletionStreamResponse) -> bool {
    match encode_chunk(chunk) {
        Ok(frame) => tx.send(frame).await.is_ok(),
        Err(err) => {
            warn!(event = "chunk_encode_failed", error = %err);
            true
        }
    }
}

fn error_frame(message: &str) -> Bytes {
    let body = json!({ "error": { "message": message, "type": "upstream_error" } });
    sse::encode_data(&body.to_string())
}

pub fn list_models(config: &GlobalConfig) -> ListModelsResponse {
    ListModelsResponse {
        object: ListObjectType::List,
        data: config
            .advertised_models()
            .into_iter()
            .map(|id| Model {
                id,
                object: ModelObjectType::Model,
                created: MODEL_CREATED,
                owned_by: MODEL_OWNER.to_string(),
            })
            .collect(),
    }
}
