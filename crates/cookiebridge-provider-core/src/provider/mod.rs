use std::sync::Arc;

use async_trait::async_trait;
use cookiebridge_common::UpstreamKind;
use tokio::sync::{mpsc, oneshot};

use crate::credential::CredentialMap;
use crate::errors::{UpstreamError, UpstreamResult};
use crate::session::ChatSession;

/// Incremental text deltas from the upstream. A transport failure mid-stream
/// arrives as the last item.
pub type DeltaStream = mpsc::Receiver<UpstreamResult<String>>;

/// A streaming chat turn. `session` resolves once the turn is complete and
/// carries the updated conversation state.
#[derive(Debug)]
pub struct ChatStream {
    pub deltas: DeltaStream,
    pub session: oneshot::Receiver<ChatSession>,
}

/// How a connection authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAuth {
    /// Explicit credentials loaded from a stored profile.
    Profile {
        name: String,
        credentials: CredentialMap,
    },
    /// Let the connector discover ambient credentials.
    Auto,
}

impl SessionAuth {
    pub fn profile_name(&self) -> Option<&str> {
        match self {
            SessionAuth::Profile { name, .. } => Some(name),
            SessionAuth::Auto => None,
        }
    }
}

/// Opens authenticated connections to one kind of upstream.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    fn kind(&self) -> UpstreamKind;

    /// Credential names a stored profile must carry to be usable.
    fn required_credentials(&self) -> Vec<String>;

    async fn connect(&self, auth: SessionAuth) -> UpstreamResult<Arc<dyn UpstreamConnection>>;
}

/// A live authenticated connection.
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    async fn generate(&self, prompt: &str, model: Option<&str>) -> UpstreamResult<String>;

    /// Streams one completion. The default buffers [`Self::generate`] into a
    /// single delta.
    async fn stream(&self, prompt: &str, model: Option<&str>) -> UpstreamResult<DeltaStream> {
        let text = self.generate(prompt, model).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(text)).await;
        Ok(rx)
    }

    /// One turn of a multi-turn conversation; updates `session` in place.
    async fn chat(&self, session: &mut ChatSession, message: &str) -> UpstreamResult<String>;

    async fn chat_stream(&self, mut session: ChatSession, message: &str) -> UpstreamResult<ChatStream> {
        let text = self.chat(&mut session, message).await?;
        let (tx, deltas) = mpsc::channel(1);
        let _ = tx.send(Ok(text)).await;
        let (done, session_rx) = oneshot::channel();
        let _ = done.send(session);
        Ok(ChatStream {
            deltas,
            session: session_rx,
        })
    }

    async fn close(&self) -> UpstreamResult<()> {
        Ok(())
    }
}

/// Forwards every delta of `stream` into `out`, returning the joined text.
/// Stops early when the receiver side of `out` is gone.
pub async fn drain_into(
    mut stream: DeltaStream,
    out: &mpsc::Sender<UpstreamResult<String>>,
) -> UpstreamResult<String> {
    let mut text = String::new();
    while let Some(item) = stream.recv().await {
        match item {
            Ok(delta) => {
                text.push_str(&delta);
                if out.send(Ok(delta)).await.is_err() {
                    return Err(UpstreamError::Closed);
                }
            }
            Err(err) => {
                let _ = out.send(Err(err.clone())).await;
                return Err(err);
            }
        }
    }
    Ok(text)
}
