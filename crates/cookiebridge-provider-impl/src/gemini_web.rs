//! Cookie-session emulation of the Gemini web app.
//!
//! Initialisation loads `/app` with the session cookies and scrapes the
//! per-session access token (`SNlM0e`). Generation posts to the
//! `StreamGenerate` RPC and reads the `wrb.fr` frames of its line-oriented
//! response; every frame carries the full candidate text so far.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use wreq::Client;
use wreq::header::COOKIE;

use cookiebridge_provider_core::{
    ChatSession, ChatStream, CredentialMap, CredentialSource, DeltaStream, SessionAuth,
    UpstreamConnection, UpstreamConnector, UpstreamError, UpstreamKind, UpstreamResult,
};

use crate::client::{
    HttpClientConfig, body_chunks, build_client, log_upstream_request, log_upstream_response,
    map_wreq_error, read_body,
};

pub const SECURE_1PSID: &str = "__Secure-1PSID";
pub const SECURE_1PSIDTS: &str = "__Secure-1PSIDTS";
pub const DEFAULT_BASE_URL: &str = "https://gemini.google.com";

const PROVIDER: &str = "gemini-web";
const STREAM_GENERATE_PATH: &str =
    "/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate";
const MODEL_HEADER: &str = "x-goog-ext-525001261-jspb";
const RESPONSE_PREFIX: &str = ")]}'";

fn model_header(model: &str) -> Option<&'static str> {
    match model {
        "gemini-2.5-flash" => Some(r#"[1,null,null,null,"71c2d248d3b102ff",null,null,0,[4]]"#),
        "gemini-2.5-pro" => Some(r#"[1,null,null,null,"4af6c7f5da75d65d",null,null,0,[4]]"#),
        "gemini-3.0-pro" => Some(r#"[1,null,null,null,"9d8ca3786ebdfbea",null,null,0,[4]]"#),
        _ => None,
    }
}

pub struct GeminiWebConnector {
    http: HttpClientConfig,
    base_url: String,
    source: Option<Arc<dyn CredentialSource>>,
}

impl GeminiWebConnector {
    pub fn new(
        http: HttpClientConfig,
        base_url: Option<String>,
        source: Option<Arc<dyn CredentialSource>>,
    ) -> Self {
        let base_url = base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            http,
            base_url,
            source,
        }
    }

    /// Cookies from the credential source's default label, expired ones
    /// dropped.
    async fn ambient_credentials(&self) -> UpstreamResult<CredentialMap> {
        let source = self.source.as_ref().ok_or_else(|| {
            UpstreamError::AuthFailure("no credential source for auto-discovery".to_string())
        })?;
        let label = source.default_label().ok_or_else(|| {
            UpstreamError::AuthFailure("credential source has no default label".to_string())
        })?;
        let records = source
            .extract(label)
            .await
            .map_err(|err| UpstreamError::AuthFailure(err.to_string()))?;
        Ok(records
            .into_iter()
            .filter(|record| !record.is_expired())
            .map(|record| (record.name, record.value))
            .collect())
    }
}

#[async_trait]
impl UpstreamConnector for GeminiWebConnector {
    fn kind(&self) -> UpstreamKind {
        UpstreamKind::GeminiWeb
    }

    fn required_credentials(&self) -> Vec<String> {
        vec![SECURE_1PSID.to_string(), SECURE_1PSIDTS.to_string()]
    }

    async fn connect(&self, auth: SessionAuth) -> UpstreamResult<Arc<dyn UpstreamConnection>> {
        let credentials = match auth {
            SessionAuth::Profile { credentials, .. } => credentials,
            SessionAuth::Auto => self.ambient_credentials().await?,
        };
        let missing: Vec<&str> = [SECURE_1PSID, SECURE_1PSIDTS]
            .into_iter()
            .filter(|name| !credentials.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(UpstreamError::AuthFailure(format!(
                "missing cookies: {}",
                missing.join(", ")
            )));
        }

        let client = build_client(&self.http)?;
        let cookie_header = cookie_header(&credentials);
        let started = log_upstream_request(PROVIDER, "init", None, false);
        let resp = client
            .get(format!("{}/app", self.base_url))
            .header(COOKIE, cookie_header.as_str())
            .send()
            .await
            .map_err(map_wreq_error)?;
        log_upstream_response(PROVIDER, "init", resp.status().as_u16(), started);
        let page = read_body(resp).await?;
        let tokens = PageTokens::scrape(&page).ok_or_else(|| {
            UpstreamError::AuthFailure(
                "access token not found in app page; cookies may be stale".to_string(),
            )
        })?;

        Ok(Arc::new(GeminiWebConnection {
            client,
            base_url: self.base_url.clone(),
            cookie_header,
            tokens,
            idle_timeout: self.http.stream_idle_timeout,
            req_id: AtomicU64::new(100_000),
            closed: AtomicBool::new(false),
        }))
    }
}

fn cookie_header(credentials: &CredentialMap) -> String {
    credentials
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PageTokens {
    access_token: String,
    build_label: Option<String>,
    session_id: Option<String>,
}

impl PageTokens {
    fn scrape(page: &str) -> Option<Self> {
        Some(Self {
            access_token: page_value(page, "SNlM0e")?,
            build_label: page_value(page, "cfb2h"),
            session_id: page_value(page, "FdrFJe"),
        })
    }
}

/// Value of `"key":"value"` embedded in the app page's bootstrap data.
fn page_value(page: &str, key: &str) -> Option<String> {
    let marker = format!("\"{key}\":\"");
    let start = page.find(&marker)? + marker.len();
    let len = page[start..].find('"')?;
    Some(page[start..start + len].to_string()).filter(|value| !value.is_empty())
}

pub struct GeminiWebConnection {
    client: Client,
    base_url: String,
    cookie_header: String,
    tokens: PageTokens,
    idle_timeout: Duration,
    req_id: AtomicU64,
    closed: AtomicBool,
}

impl GeminiWebConnection {
    async fn send(
        &self,
        prompt: &str,
        metadata: &[String],
        model: Option<&str>,
        op: &str,
        is_stream: bool,
    ) -> UpstreamResult<wreq::Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UpstreamError::Closed);
        }

        let metadata = if metadata.is_empty() {
            Value::Null
        } else {
            json!(metadata)
        };
        let inner = json!([[prompt], null, metadata]).to_string();
        let f_req = json!([null, inner]).to_string();
        let req_id = self.req_id.fetch_add(100_000, Ordering::Relaxed);

        let mut query: Vec<(&str, String)> = vec![
            ("hl", "en".to_string()),
            ("_reqid", req_id.to_string()),
            ("rt", "c".to_string()),
        ];
        if let Some(label) = &self.tokens.build_label {
            query.push(("bl", label.clone()));
        }
        if let Some(session_id) = &self.tokens.session_id {
            query.push(("f.sid", session_id.clone()));
        }

        let mut builder = self
            .client
            .post(format!("{}{STREAM_GENERATE_PATH}", self.base_url))
            .query(&query)
            .header(COOKIE, self.cookie_header.as_str())
            .header("origin", self.base_url.as_str())
            .header("referer", format!("{}/", self.base_url))
            .header("x-same-domain", "1")
            .form(&[
                ("at", self.tokens.access_token.as_str()),
                ("f.req", f_req.as_str()),
            ]);
        if let Some(header) = model.and_then(model_header) {
            builder = builder.header(MODEL_HEADER, header);
        }

        let started = log_upstream_request(PROVIDER, op, model, is_stream);
        let resp = builder.send().await.map_err(map_wreq_error)?;
        log_upstream_response(PROVIDER, op, resp.status().as_u16(), started);
        Ok(resp)
    }

    async fn complete(
        &self,
        prompt: &str,
        metadata: &[String],
        model: Option<&str>,
        op: &str,
    ) -> UpstreamResult<GeminiReply> {
        let resp = self.send(prompt, metadata, model, op, false).await?;
        let body = read_body(resp).await?;
        parse_stream_generate(&body)
            .ok_or_else(|| UpstreamError::Protocol("no candidate in response".to_string()))
    }

    /// Streams text deltas; the final reply resolves once the body ends.
    async fn open_stream(
        &self,
        prompt: &str,
        metadata: &[String],
        model: Option<&str>,
        op: &str,
    ) -> UpstreamResult<(DeltaStream, oneshot::Receiver<Option<GeminiReply>>)> {
        let resp = self.send(prompt, metadata, model, op, true).await?;
        let mut chunks = body_chunks(resp, self.idle_timeout).await?;
        let (tx, rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut parser = ReplyStreamParser::default();
            let mut sent = String::new();
            let mut latest: Option<GeminiReply> = None;

            let mut forward = |replies: Vec<GeminiReply>, deltas: &mut Vec<String>| {
                for reply in replies {
                    if reply.text.len() > sent.len() && reply.text.starts_with(sent.as_str()) {
                        deltas.push(reply.text[sent.len()..].to_string());
                        sent.clone_from(&reply.text);
                    }
                    latest = Some(reply);
                }
            };

            loop {
                let mut deltas = Vec::new();
                let finished = match chunks.recv().await {
                    Some(Ok(bytes)) => {
                        forward(parser.push(&bytes), &mut deltas);
                        false
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err)).await;
                        let _ = done_tx.send(None);
                        return;
                    }
                    None => {
                        forward(parser.finish(), &mut deltas);
                        true
                    }
                };
                for delta in deltas {
                    if tx.send(Ok(delta)).await.is_err() {
                        let _ = done_tx.send(None);
                        return;
                    }
                }
                if finished {
                    break;
                }
            }

            if latest.is_none() {
                let _ = tx
                    .send(Err(UpstreamError::Protocol(
                        "no candidate in response".to_string(),
                    )))
                    .await;
            }
            let _ = done_tx.send(latest);
        });

        Ok((rx, done_rx))
    }
}

#[async_trait]
impl UpstreamConnection for GeminiWebConnection {
    async fn generate(&self, prompt: &str, model: Option<&str>) -> UpstreamResult<String> {
        Ok(self.complete(prompt, &[], model, "generate").await?.text)
    }

    async fn stream(&self, prompt: &str, model: Option<&str>) -> UpstreamResult<DeltaStream> {
        let (deltas, _done) = self.open_stream(prompt, &[], model, "stream").await?;
        Ok(deltas)
    }

    async fn chat(&self, session: &mut ChatSession, message: &str) -> UpstreamResult<String> {
        let reply = self.complete(message, &session.metadata, None, "chat").await?;
        reply.apply_to(session, message);
        Ok(reply.text)
    }

    async fn chat_stream(&self, mut session: ChatSession, message: &str) -> UpstreamResult<ChatStream> {
        let (deltas, done) = self
            .open_stream(message, &session.metadata, None, "chat_stream")
            .await?;
        let (session_tx, session_rx) = oneshot::channel();
        let message = message.to_string();
        tokio::spawn(async move {
            if let Ok(Some(reply)) = done.await {
                reply.apply_to(&mut session, &message);
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

/// One decoded candidate with the ids needed to continue the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GeminiReply {
    pub text: String,
    pub conversation_id: Option<String>,
    pub response_id: Option<String>,
    pub candidate_id: Option<String>,
}

impl GeminiReply {
    fn metadata(&self) -> Vec<String> {
        [&self.conversation_id, &self.response_id, &self.candidate_id]
            .into_iter()
            .map(|id| id.clone().unwrap_or_default())
            .collect()
    }

    fn apply_to(&self, session: &mut ChatSession, message: &str) {
        session.metadata = self.metadata();
        if let Some(id) = &self.conversation_id {
            session.conversation_id = Some(id.clone());
        }
        session.record_exchange(message, &self.text);
    }
}

/// The last complete reply in a full `StreamGenerate` body.
pub(crate) fn parse_stream_generate(body: &str) -> Option<GeminiReply> {
    body.lines().filter_map(parse_frame).last()
}

fn parse_frame(line: &str) -> Option<GeminiReply> {
    let line = line.trim();
    let line = line.strip_prefix(RESPONSE_PREFIX).unwrap_or(line).trim();
    if !line.starts_with('[') {
        return None;
    }
    let frame: Value = serde_json::from_str(line).ok()?;
    frame.as_array()?.iter().find_map(|item| {
        let item = item.as_array()?;
        if item.first()?.as_str()? != "wrb.fr" {
            return None;
        }
        let body: Value = serde_json::from_str(item.get(2)?.as_str()?).ok()?;
        reply_from_body(&body)
    })
}

fn reply_from_body(body: &Value) -> Option<GeminiReply> {
    let candidate = body.get(4)?.get(0)?;
    let text = candidate.get(1)?.get(0)?.as_str()?.to_string();
    let id_at = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_string);
    let metadata = body.get(1);
    Some(GeminiReply {
        text,
        conversation_id: id_at(metadata.and_then(|ids| ids.get(0))),
        response_id: id_at(metadata.and_then(|ids| ids.get(1))),
        candidate_id: id_at(candidate.get(0)),
    })
}

/// Splits a chunked body into lines and decodes every complete frame.
#[derive(Debug, Default)]
struct ReplyStreamParser {
    buffer: Vec<u8>,
}

impl ReplyStreamParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<GeminiReply> {
        self.buffer.extend_from_slice(chunk);
        let mut replies = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(reply) = parse_frame(&String::from_utf8_lossy(&line)) {
                replies.push(reply);
            }
        }
        replies
    }

    fn finish(&mut self) -> Vec<GeminiReply> {
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(&String::from_utf8_lossy(&rest))
            .into_iter()
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{frame, response};
    use super::*;

    #[test]
    fn scrapes_page_tokens() {
        let page = r#"<script>WIZ_global_data = {"cfb2h":"boq_build_1","FdrFJe":"-123","SNlM0e":"tok:abc"};</script>"#;
        let tokens = PageTokens::scrape(page).unwrap();
        assert_eq!(tokens.access_token, "tok:abc");
        assert_eq!(tokens.build_label.as_deref(), Some("boq_build_1"));
        assert_eq!(tokens.session_id.as_deref(), Some("-123"));
        assert!(PageTokens::scrape("<html>signed out</html>").is_none());
    }

    #[test]
    fn full_body_yields_last_candidate() {
        let body = response(&["Hel", "Hello wor", "Hello world"]);
        let reply = parse_stream_generate(&body).unwrap();
        assert_eq!(reply.text, "Hello world");
        assert_eq!(reply.metadata(), vec!["c_123", "r_456", "rc_789"]);
        assert!(parse_stream_generate(")]}'\n\n[[\"e\",4]]\n").is_none());
    }

    #[test]
    fn stream_parser_handles_split_lines() {
        let line = frame("partial");
        let (head, tail) = line.split_at(line.len() / 2);
        let mut parser = ReplyStreamParser::default();
        assert!(parser.push(b")]}'\n\n").is_empty());
        assert!(parser.push(head.as_bytes()).is_empty());
        let replies = parser.push(format!("{tail}\n").as_bytes());
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "partial");
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn reply_updates_chat_session() {
        let reply = parse_stream_generate(&response(&["hi there"])).unwrap();
        let mut session = ChatSession::default();
        reply.apply_to(&mut session, "hi");
        assert_eq!(session.conversation_id.as_deref(), Some("c_123"));
        assert_eq!(session.metadata.len(), 3);
        assert_eq!(session.turns.len(), 2);
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let mut credentials = CredentialMap::new();
        credentials.insert(SECURE_1PSID.to_string(), "a".to_string());
        credentials.insert(SECURE_1PSIDTS.to_string(), "b".to_string());
        assert_eq!(
            cookie_header(&credentials),
            "__Secure-1PSID=a; __Secure-1PSIDTS=b"
        );
    }
}
