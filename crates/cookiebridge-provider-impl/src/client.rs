use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wreq::{Client, Proxy};

use cookiebridge_provider_core::{UpstreamError, UpstreamTransportErrorKind};

/// Settings shared by every connector's HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Maximum silence between two body chunks of a streaming response.
    pub stream_idle_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) fn build_client(config: &HttpClientConfig) -> Result<Client, UpstreamError> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.stream_idle_timeout);

    if let Some(proxy) = normalize_proxy(config.proxy.as_deref()) {
        builder = builder.proxy(Proxy::all(proxy).map_err(map_wreq_error)?);
    }

    builder.build().map_err(map_wreq_error)
}

fn normalize_proxy(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|item| !item.is_empty())
}

pub(crate) fn log_upstream_request(provider: &str, op: &str, model: Option<&str>, is_stream: bool) -> Instant {
    info!(
        event = "upstream_request",
        provider = %provider,
        op = %op,
        model = model.unwrap_or("-"),
        is_stream = is_stream
    );
    Instant::now()
}

pub(crate) fn log_upstream_response(provider: &str, op: &str, status: u16, started: Instant) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if (200..300).contains(&status) {
        info!(event = "upstream_response", provider = %provider, op = %op, status, elapsed_ms);
    } else {
        warn!(event = "upstream_response", provider = %provider, op = %op, status, elapsed_ms);
    }
}

/// Reads a complete body, turning non-2xx statuses into errors.
pub(crate) async fn read_body(resp: wreq::Response) -> Result<String, UpstreamError> {
    let status = resp.status().as_u16();
    let body = resp.text().await.map_err(map_wreq_error)?;
    if !(200..300).contains(&status) {
        return Err(UpstreamError::from_status(status, truncate(body)));
    }
    Ok(body)
}

/// Forwards body chunks into a channel until the stream ends, fails or
/// stays idle longer than `idle_timeout`. Non-2xx statuses fail up front.
pub(crate) async fn body_chunks(
    resp: wreq::Response,
    idle_timeout: Duration,
) -> Result<mpsc::Receiver<Result<Bytes, UpstreamError>>, UpstreamError> {
    let status = resp.status().as_u16();
    if !(200..300).contains(&status) {
        let body = resp.text().await.map_err(map_wreq_error)?;
        return Err(UpstreamError::from_status(status, truncate(body)));
    }

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let item = match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    let _ = tx
                        .send(Err(UpstreamError::Transport {
                            kind: UpstreamTransportErrorKind::ReadTimeout,
                            message: "stream idle timeout".to_string(),
                        }))
                        .await;
                    break;
                }
            };
            let chunk = item.map_err(map_wreq_error);
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    Ok(rx)
}

fn truncate(mut body: String) -> String {
    const MAX_ERROR_BODY: usize = 2048;
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

pub(crate) fn map_wreq_error(err: wreq::Error) -> UpstreamError {
    let kind = classify_wreq_error(&err);
    UpstreamError::Transport {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_proxy_is_ignored() {
        assert_eq!(normalize_proxy(Some("  ")), None);
        assert_eq!(normalize_proxy(Some(" http://p:1 ")), Some("http://p:1"));
        assert_eq!(normalize_proxy(None), None);
    }

    #[test]
    fn error_bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(2000);
        let cut = truncate(body);
        assert!(cut.len() <= 2048);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
