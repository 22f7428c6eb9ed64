use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Form;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use cookiebridge_provider_core::{
    ChatSession, CredentialMap, DeltaStream, SessionAuth, UpstreamConnector, UpstreamError,
};
use cookiebridge_provider_impl::{GeminiWebConnector, HttpClientConfig, OpenAiCompatConnector};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn collect(mut deltas: DeltaStream) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(delta) = deltas.recv().await {
        out.push(delta.unwrap());
    }
    out
}

fn gemini_line(text: &str) -> String {
    let body = json!([null, ["c_1", "r_1"], null, null, [["rc_1", [text]]]]).to_string();
    json!([["wrb.fr", null, body]]).to_string()
}

fn gemini_app() -> Router {
    let app_page = |headers: HeaderMap| async move {
        let cookie = headers
            .get("cookie")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if cookie.contains("__Secure-1PSID=good") {
            r#"<script>{"cfb2h":"bl_1","FdrFJe":"42","SNlM0e":"at-token"}</script>"#.to_string()
        } else {
            "<html>sign in</html>".to_string()
        }
    };
    let generate = |Form(form): Form<HashMap<String, String>>| async move {
        if form.get("at").map(String::as_str) != Some("at-token") {
            return (StatusCode::UNAUTHORIZED, String::new());
        }
        let mut body = String::from(")]}'\n\n");
        for text in ["Hel", "Hello", "Hello world"] {
            let line = gemini_line(text);
            body.push_str(&format!("{}\n{line}\n", line.len()));
        }
        (StatusCode::OK, body)
    };
    Router::new().route("/app", get(app_page)).route(
        "/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate",
        post(generate),
    )
}

fn gemini_credentials(psid: &str) -> SessionAuth {
    let mut credentials = CredentialMap::new();
    credentials.insert("__Secure-1PSID".to_string(), psid.to_string());
    credentials.insert("__Secure-1PSIDTS".to_string(), "ts".to_string());
    SessionAuth::Profile {
        name: "work".to_string(),
        credentials,
    }
}

#[tokio::test]
async fn gemini_web_generates_and_streams() {
    let base = serve(gemini_app()).await;
    let connector = GeminiWebConnector::new(HttpClientConfig::default(), Some(base), None);
    let connection = connector.connect(gemini_credentials("good")).await.unwrap();

    let text = connection
        .generate("hi", Some("gemini-2.5-flash"))
        .await
        .unwrap();
    assert_eq!(text, "Hello world");

    let deltas = collect(connection.stream("hi", None).await.unwrap()).await;
    assert_eq!(deltas, vec!["Hel", "lo", " world"]);

    let stream = connection
        .chat_stream(ChatSession::default(), "hi")
        .await
        .unwrap();
    assert_eq!(collect(stream.deltas).await.concat(), "Hello world");
    let session = stream.session.await.unwrap();
    assert_eq!(session.conversation_id.as_deref(), Some("c_1"));
    assert_eq!(session.metadata, vec!["c_1", "r_1", "rc_1"]);

    connection.close().await.unwrap();
    assert_eq!(
        connection.generate("hi", None).await,
        Err(UpstreamError::Closed)
    );
}

#[tokio::test]
async fn gemini_web_rejects_stale_or_partial_cookies() {
    let base = serve(gemini_app()).await;
    let connector = GeminiWebConnector::new(HttpClientConfig::default(), Some(base), None);

    let stale = connector.connect(gemini_credentials("stale")).await;
    assert!(matches!(stale, Err(UpstreamError::AuthFailure(_))));

    let auto = connector.connect(SessionAuth::Auto).await;
    assert!(matches!(auto, Err(UpstreamError::AuthFailure(_))));

    let mut partial = CredentialMap::new();
    partial.insert("__Secure-1PSID".to_string(), "good".to_string());
    let partial = connector
        .connect(SessionAuth::Profile {
            name: "p".to_string(),
            credentials: partial,
        })
        .await;
    assert!(matches!(partial, Err(UpstreamError::AuthFailure(msg)) if msg.contains("__Secure-1PSIDTS")));
}

fn openai_app() -> Router {
    let completions = |headers: HeaderMap, Json(body): Json<Value>| async move {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
            return (StatusCode::UNAUTHORIZED, "{}".to_string());
        }
        let turns = body["messages"].as_array().map(Vec::len).unwrap_or(0);
        let reply = format!("seen {turns}");
        if body["stream"].as_bool() == Some(true) {
            let mut out = String::from(": keep-alive\n\n");
            out.push_str("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n");
            let count = turns.to_string();
            for piece in ["seen", " ", count.as_str()] {
                let event = json!({"choices": [{"delta": {"content": piece}}]});
                out.push_str(&format!("data: {event}\n\n"));
            }
            out.push_str("data: [DONE]\n\n");
            (StatusCode::OK, out)
        } else {
            let event = json!({"choices": [{"message": {"role": "assistant", "content": reply}}]});
            (StatusCode::OK, event.to_string())
        }
    };
    Router::new().route("/v1/chat/completions", post(completions))
}

#[tokio::test]
async fn openai_compat_replays_history() {
    let base = serve(openai_app()).await;
    let connector = OpenAiCompatConnector::new(
        HttpClientConfig::default(),
        Some(format!("{base}/v1")),
        Some("sk-test".to_string()),
        "gemini-2.5-flash",
    );
    let connection: Arc<_> = connector.connect(SessionAuth::Auto).await.unwrap();

    assert_eq!(connection.generate("hi", None).await.unwrap(), "seen 1");

    let mut session = ChatSession::default();
    assert_eq!(connection.chat(&mut session, "one").await.unwrap(), "seen 1");
    assert!(session.conversation_id.is_some());

    let stream = connection.chat_stream(session, "two").await.unwrap();
    assert_eq!(collect(stream.deltas).await.concat(), "seen 3");
    let session = stream.session.await.unwrap();
    assert_eq!(session.turns.len(), 4);
}

#[tokio::test]
async fn openai_compat_maps_rejected_key_to_auth_failure() {
    let base = serve(openai_app()).await;
    let connector = OpenAiCompatConnector::new(
        HttpClientConfig::default(),
        Some(format!("{base}/v1")),
        Some("sk-wrong".to_string()),
        "gemini-2.5-flash",
    );
    let connection = connector.connect(SessionAuth::Auto).await.unwrap();
    assert!(matches!(
        connection.generate("hi", None).await,
        Err(UpstreamError::AuthFailure(_))
    ));
}
