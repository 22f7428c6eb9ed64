//! Connector for an OpenAI-compatible gateway (Bifrost and friends).
//!
//! Stateless upstream: conversation history lives in the [`ChatSession`]
//! turns and is replayed on every request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use wreq::Client;
use wreq::header::AUTHORIZATION;

use cookiebridge_protocol::openai::chat::request::CreateChatCompletionRequestBody;
use cookiebridge_protocol::openai::chat::types::ChatCompletionRequestMessage;
use cookiebridge_protocol::sse::SseDataDecoder;
use cookiebridge_provider_core::{
    ChatSession, ChatStream, DeltaStream, SessionAuth, TurnRole, UpstreamConnection,
    UpstreamConnector, UpstreamError, UpstreamKind, UpstreamResult, drain_into,
};

use crate::client::{
    HttpClientConfig, body_chunks, build_client, log_upstream_request, log_upstream_response,
    map_wreq_error, read_body,
};

/// Credential name holding the bearer key in a stored profile.
pub const API_KEY: &str = "api_key";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/v1";
const DEFAULT_API_KEY: &str = "sk-bifrost-default";
const DEFAULT_MAX_TOKENS: i64 = 4096;
const DEFAULT_TEMPERATURE: f64 = 1.0;
const PROVIDER: &str = "openai-compat";

pub struct OpenAiCompatConnector {
    http: HttpClientConfig,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatConnector {
    pub fn new(
        http: HttpClientConfig,
        base_url: Option<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        let base_url = base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            http,
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            default_model: default_model.into(),
        }
    }
}

#[async_trait]
impl UpstreamConnector for OpenAiCompatConnector {
    fn kind(&self) -> UpstreamKind {
        UpstreamKind::OpenaiCompat
    }

    fn required_credentials(&self) -> Vec<String> {
        vec![API_KEY.to_string()]
    }

    async fn connect(&self, auth: SessionAuth) -> UpstreamResult<Arc<dyn UpstreamConnection>> {
        let api_key = match auth {
            SessionAuth::Profile { name, credentials } => credentials
                .get(API_KEY)
                .cloned()
                .ok_or_else(|| {
                    UpstreamError::AuthFailure(format!("profile {name} has no {API_KEY}"))
                })?,
            SessionAuth::Auto => self
                .api_key
                .clone()
                .unwrap_or_else(|| DEFAULT_API_KEY.to_string()),
        };

        Ok(Arc::new(OpenAiCompatConnection {
            client: build_client(&self.http)?,
            base_url: self.base_url.clone(),
            api_key,
            default_model: self.default_model.clone(),
            idle_timeout: self.http.stream_idle_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct OpenAiCompatConnection {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl OpenAiCompatConnection {
    fn request_body(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        model: Option<&str>,
        stream: bool,
    ) -> CreateChatCompletionRequestBody {
        CreateChatCompletionRequestBody {
            messages,
            model: Some(model.unwrap_or(&self.default_model).to_string()),
            stream: stream.then_some(true),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            temperature: Some(DEFAULT_TEMPERATURE),
            ..Default::default()
        }
    }

    async fn post(
        &self,
        body: &CreateChatCompletionRequestBody,
        op: &str,
    ) -> UpstreamResult<wreq::Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UpstreamError::Closed);
        }
        let started = log_upstream_request(PROVIDER, op, body.model.as_deref(), body.is_stream());
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(map_wreq_error)?;
        log_upstream_response(PROVIDER, op, resp.status().as_u16(), started);
        Ok(resp)
    }

    async fn complete(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        model: Option<&str>,
        op: &str,
    ) -> UpstreamResult<String> {
        let body = self.request_body(messages, model, false);
        let text = read_body(self.post(&body, op).await?).await?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|err| UpstreamError::Protocol(format!("invalid completion body: {err}")))?;
        completion_text(&value)
            .ok_or_else(|| UpstreamError::Protocol("completion has no choices".to_string()))
    }

    async fn open_stream(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        model: Option<&str>,
        op: &str,
    ) -> UpstreamResult<DeltaStream> {
        let body = self.request_body(messages, model, true);
        let resp = self.post(&body, op).await?;
        let mut chunks = body_chunks(resp, self.idle_timeout).await?;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut decoder = SseDataDecoder::new();
            loop {
                let (events, finished) = match chunks.recv().await {
                    Some(Ok(bytes)) => (decoder.push(&bytes), false),
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    None => (decoder.finish(), true),
                };
                for event in events {
                    if event.trim() == "[DONE]" {
                        return;
                    }
                    let Some(delta) = stream_delta(&event) else {
                        continue;
                    };
                    if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
                        return;
                    }
                }
                if finished {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl UpstreamConnection for OpenAiCompatConnection {
    async fn generate(&self, prompt: &str, model: Option<&str>) -> UpstreamResult<String> {
        self.complete(vec![ChatCompletionRequestMessage::user(prompt)], model, "generate")
            .await
    }

    async fn stream(&self, prompt: &str, model: Option<&str>) -> UpstreamResult<DeltaStream> {
        self.open_stream(vec![ChatCompletionRequestMessage::user(prompt)], model, "stream")
            .await
    }

    async fn chat(&self, session: &mut ChatSession, message: &str) -> UpstreamResult<String> {
        let reply = self
            .complete(history_messages(session, message), None, "chat")
            .await?;
        start_conversation(session);
        session.record_exchange(message, &reply);
        Ok(reply)
    }

    async fn chat_stream(&self, mut session: ChatSession, message: &str) -> UpstreamResult<ChatStream> {
        let upstream = self
            .open_stream(history_messages(&session, message), None, "chat_stream")
            .await?;
        let (tx, deltas) = mpsc::channel(16);
        let (session_tx, session_rx) = oneshot::channel();
        let message = message.to_string();
        tokio::spawn(async move {
            if let Ok(reply) = drain_into(upstream, &tx).await {
                start_conversation(&mut session);
                session.record_exchange(&message, &reply);
            }
            let _ = session_tx.send(session);
        });
        Ok(ChatStream {
            deltas,
            session: session_rx,
        })
    }

    async fn close(&self) -> UpstreamResult<()> {
        self.closed.store(true, Ordering::Release);
        debug!(provider = PROVIDER, "connection closed");
        Ok(())
    }
}

fn start_conversation(session: &mut ChatSession) {
    session
        .conversation_id
        .get_or_insert_with(|| format!("conv_{}", uuid::Uuid::new_v4().simple()));
}

fn history_messages(session: &ChatSession, message: &str) -> Vec<ChatCompletionRequestMessage> {
    let mut messages: Vec<_> = session
        .turns
        .iter()
        .map(|turn| match turn.role {
            TurnRole::User => ChatCompletionRequestMessage::user(&turn.text),
            TurnRole::Assistant => ChatCompletionRequestMessage::assistant(&turn.text),
        })
        .collect();
    messages.push(ChatCompletionRequestMessage::user(message));
    messages
}

fn completion_text(value: &Value) -> Option<String> {
    let message = value.get("choices")?.get(0)?.get("message")?;
    Some(
        message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}

fn stream_delta(event: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(event) {
        Ok(value) => value,
        Err(err) => {
            debug!(provider = PROVIDER, error = %err, "skipping undecodable stream event");
            return None;
        }
    };
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_replays_turns_then_new_message() {
        let mut session = ChatSession::default();
        session.record_exchange("hi", "hello");
        let messages = history_messages(&session, "again");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], ChatCompletionRequestMessage::assistant("hello"));
        assert_eq!(messages[2], ChatCompletionRequestMessage::user("again"));
    }

    #[test]
    fn extracts_completion_and_stream_text() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hey"}}]});
        assert_eq!(completion_text(&body).as_deref(), Some("hey"));
        assert_eq!(completion_text(&json!({"choices": []})), None);

        let event = json!({"choices": [{"delta": {"content": "he"}}]}).to_string();
        assert_eq!(stream_delta(&event).as_deref(), Some("he"));
        assert_eq!(stream_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert_eq!(stream_delta("not json"), None);
    }

    #[test]
    fn conversation_id_is_assigned_once() {
        let mut session = ChatSession::default();
        start_conversation(&mut session);
        let first = session.conversation_id.clone().unwrap();
        assert!(first.starts_with("conv_"));
        start_conversation(&mut session);
        assert_eq!(session.conversation_id.as_deref(), Some(first.as_str()));
    }
}
