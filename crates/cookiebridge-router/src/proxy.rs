use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use cookiebridge_core::{
    AppState, ChatCompletionReply, chat_stream_frames, create_chat_completion, list_models,
};
use cookiebridge_protocol::openai::chat::request::CreateChatCompletionRequestBody;
use cookiebridge_protocol::sse::KEEP_ALIVE_FRAME;

use crate::error::ApiError;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type ProxyState = Arc<AppState>;

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .route("/v1/generate", post(generate))
        .route("/v1/chat", post(chat))
        .route("/v1/conversations", get(list_conversations))
        .route(
            "/v1/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .with_state(state)
}

async fn chat_completions(
    State(state): State<ProxyState>,
    Json(body): Json<CreateChatCompletionRequestBody>,
) -> Result<Response, ApiError> {
    if body.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    let config = state.config();
    match create_chat_completion(&state.session, &config, body).await? {
        ChatCompletionReply::Json(response) => Ok(Json(response).into_response()),
        ChatCompletionReply::Stream(rx) => Ok(sse_response(rx)),
    }
}

async fn models(State(state): State<ProxyState>) -> impl IntoResponse {
    Json(list_models(&state.config()))
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
}

async fn generate(
    State(state): State<ProxyState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    let model = state.config().resolve_model(req.model.as_deref());
    let text = state.session.generate(&req.prompt, Some(&model)).await?;
    Ok(Json(json!({ "text": text })).into_response())
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    stream: bool,
}

async fn chat(
    State(state): State<ProxyState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    if let Some(profile) = req.profile.as_deref().filter(|name| !name.trim().is_empty())
        && state.session.current_profile().await.as_deref() != Some(profile)
    {
        state.session.switch_profile(profile).await?;
    }

    let conversation_id = req.conversation_id.as_deref();
    if req.stream {
        let stream = state
            .session
            .chat_stream(&req.message, conversation_id)
            .await?;
        return Ok(sse_response(chat_stream_frames(stream)));
    }
    let reply = state.session.chat(&req.message, conversation_id).await?;
    Ok(Json(reply).into_response())
}

async fn list_conversations(State(state): State<ProxyState>) -> impl IntoResponse {
    let conversations = state.session.conversation_ids().await;
    Json(json!({
        "count": conversations.len(),
        "conversations": conversations,
    }))
}

async fn get_conversation(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(turns) = state.session.conversation_history(&id).await else {
        return Err(ApiError::not_found(format!("Conversation '{id}' not found")));
    };
    Ok(Json(json!({ "conversation_id": id, "turns": turns })).into_response())
}

async fn delete_conversation(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.session.delete_conversation(&id).await {
        return Err(ApiError::not_found(format!("Conversation '{id}' not found")));
    }
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": format!("Conversation '{id}' deleted"),
        })),
    )
        .into_response())
}

fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(wrap_sse_stream_with_heartbeat(rx)).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    // Hint common reverse proxies to avoid buffering SSE responses.
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn wrap_sse_stream_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First heartbeat goes out one full interval after the stream opens.
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(KEEP_ALIVE_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}
