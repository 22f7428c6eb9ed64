//! The per-process upstream session.
//!
//! Holds at most one live connection, the profile it was opened with and the
//! local conversation map. Init and profile switches serialise on one mutex;
//! calls read the connection under a read lock and run without holding it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use cookiebridge_provider_core::{
    ChatSession, ChatTurn, CredentialSource, DeltaStream, SessionAuth, UpstreamConnection,
    UpstreamConnector, UpstreamError, UpstreamResult,
};
use cookiebridge_storage::{CredentialStore, RequiredCredentials};

use crate::error::{SessionError, SessionResult};

/// One refresh-and-retry after the first failure, never more.
const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Ready,
    Refreshing,
    Failed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Initializing => "initializing",
            SessionPhase::Ready => "ready",
            SessionPhase::Refreshing => "refreshing",
            SessionPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub text: String,
    pub conversation_id: String,
}

/// A streaming chat turn. The conversation is stored back once `deltas`
/// has been fully produced.
#[derive(Debug)]
pub struct ChatReplyStream {
    pub conversation_id: String,
    pub deltas: DeltaStream,
}

struct ActiveConnection {
    phase: SessionPhase,
    profile: Option<String>,
    connection: Option<Arc<dyn UpstreamConnection>>,
}

/// Local conversations. `generation` moves on every clear so that a turn
/// started before a profile switch is not stored into the new account.
#[derive(Default)]
struct ConversationMap {
    generation: u64,
    sessions: HashMap<String, ChatSession>,
}

impl ConversationMap {
    fn clear(&mut self) {
        self.generation += 1;
        self.sessions.clear();
    }

    fn store(&mut self, generation: u64, key: String, session: ChatSession) -> bool {
        if generation != self.generation {
            return false;
        }
        self.sessions.insert(key, session);
        true
    }
}

type Conversations = Arc<Mutex<ConversationMap>>;

pub struct UpstreamSession {
    connector: Arc<dyn UpstreamConnector>,
    store: CredentialStore,
    source: Option<Arc<dyn CredentialSource>>,
    request_timeout: Duration,
    init_lock: Mutex<()>,
    active: RwLock<ActiveConnection>,
    conversations: Conversations,
}

impl UpstreamSession {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        store: CredentialStore,
        source: Option<Arc<dyn CredentialSource>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            source,
            request_timeout,
            init_lock: Mutex::new(()),
            active: RwLock::new(ActiveConnection {
                phase: SessionPhase::Uninitialized,
                profile: None,
                connection: None,
            }),
            conversations: Arc::new(Mutex::new(ConversationMap::default())),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn source(&self) -> Option<&Arc<dyn CredentialSource>> {
        self.source.as_ref()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.active.read().await.phase
    }

    pub async fn current_profile(&self) -> Option<String> {
        self.active.read().await.profile.clone()
    }

    /// Opens a connection with the profile's stored credentials. An unusable
    /// profile fails before the current connection is touched.
    pub async fn init_with_profile(&self, name: &str) -> SessionResult<()> {
        let _guard = self.init_lock.lock().await;
        let credentials = self.usable_credentials(name).await?;
        self.open(
            SessionAuth::Profile {
                name: name.to_string(),
                credentials,
            },
            true,
        )
        .await
    }

    pub async fn switch_profile(&self, name: &str) -> SessionResult<()> {
        self.init_with_profile(name).await
    }

    /// Opens a connection with whatever credentials the connector can
    /// discover on its own.
    pub async fn init_auto(&self) -> SessionResult<()> {
        let _guard = self.init_lock.lock().await;
        self.open(SessionAuth::Auto, true).await
    }

    pub async fn ensure_initialized(&self) -> SessionResult<()> {
        if self.active.read().await.connection.is_some() {
            return Ok(());
        }
        self.init_auto().await
    }

    pub async fn generate(&self, prompt: &str, model: Option<&str>) -> SessionResult<String> {
        self.with_retry("generate", |connection| async move {
            connection.generate(prompt, model).await
        })
        .await
    }

    /// Only the stream start is bounded by the request timeout and retried.
    pub async fn stream(&self, prompt: &str, model: Option<&str>) -> SessionResult<DeltaStream> {
        self.with_retry("stream", |connection| async move {
            connection.stream(prompt, model).await
        })
        .await
    }

    /// One turn of the conversation `conversation_id`, created on first use.
    /// Without an id a new conversation is started.
    pub async fn chat(
        &self,
        message: &str,
        conversation_id: Option<&str>,
    ) -> SessionResult<ChatReply> {
        let key = conversation_key(conversation_id);
        let (session, generation) = self.conversation(&key).await;
        let (text, session) = self
            .with_retry("chat", |connection| {
                let mut session = session.clone();
                async move {
                    let text = connection.chat(&mut session, message).await?;
                    Ok((text, session))
                }
            })
            .await?;
        if !self
            .conversations
            .lock()
            .await
            .store(generation, key.clone(), session)
        {
            warn!(conversation_id = %key, "conversations cleared during chat; turn not stored");
        }
        Ok(ChatReply {
            text,
            conversation_id: key,
        })
    }

    pub async fn chat_stream(
        &self,
        message: &str,
        conversation_id: Option<&str>,
    ) -> SessionResult<ChatReplyStream> {
        let key = conversation_key(conversation_id);
        let (session, generation) = self.conversation(&key).await;
        let stream = self
            .with_retry("chat_stream", |connection| {
                let session = session.clone();
                async move { connection.chat_stream(session, message).await }
            })
            .await?;

        let conversations = self.conversations.clone();
        let stored_key = key.clone();
        let finished = stream.session;
        tokio::spawn(async move {
            if let Ok(session) = finished.await {
                conversations
                    .lock()
                    .await
                    .store(generation, stored_key, session);
            }
        });

        Ok(ChatReplyStream {
            conversation_id: key,
            deltas: stream.deltas,
        })
    }

    pub async fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .conversations
            .lock()
            .await
            .sessions
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub async fn conversation_history(&self, id: &str) -> Option<Vec<ChatTurn>> {
        self.conversations
            .lock()
            .await
            .sessions
            .get(id)
            .map(|session| session.turns.clone())
    }

    pub async fn delete_conversation(&self, id: &str) -> bool {
        self.conversations
            .lock()
            .await
            .sessions
            .remove(id)
            .is_some()
    }

    /// Closes the connection and forgets the profile and all conversations.
    pub async fn close(&self) -> SessionResult<()> {
        let _guard = self.init_lock.lock().await;
        let previous = {
            let mut active = self.active.write().await;
            active.phase = SessionPhase::Uninitialized;
            active.profile = None;
            active.connection.take()
        };
        self.conversations.lock().await.clear();
        if let Some(connection) = previous {
            connection.close().await?;
        }
        Ok(())
    }

    async fn conversation(&self, key: &str) -> (ChatSession, u64) {
        let conversations = self.conversations.lock().await;
        let session = conversations.sessions.get(key).cloned().unwrap_or_default();
        (session, conversations.generation)
    }

    /// The live connection and the profile it was opened with.
    async fn connection(&self) -> SessionResult<(Arc<dyn UpstreamConnection>, Option<String>)> {
        let active = self.active.read().await;
        let connection = active
            .connection
            .clone()
            .ok_or(SessionError::UpstreamNotInitialized)?;
        Ok((connection, active.profile.clone()))
    }

    async fn set_phase(&self, phase: SessionPhase) {
        self.active.write().await.phase = phase;
    }

    async fn usable_credentials(
        &self,
        name: &str,
    ) -> SessionResult<cookiebridge_provider_core::CredentialMap> {
        match self.store.check_required_credentials(name).await? {
            RequiredCredentials::Ready(credentials) => Ok(credentials),
            RequiredCredentials::Missing(missing) => Err(SessionError::CredentialMissing {
                profile: name.to_string(),
                missing,
            }),
            RequiredCredentials::Expired(expired) => Err(SessionError::CredentialExpired {
                profile: name.to_string(),
                expired,
            }),
        }
    }

    /// Closes the previous connection, then connects. Caller holds
    /// `init_lock`.
    async fn open(&self, auth: SessionAuth, clear_conversations: bool) -> SessionResult<()> {
        let previous = {
            let mut active = self.active.write().await;
            active.phase = SessionPhase::Initializing;
            active.connection.take()
        };
        if let Some(connection) = previous
            && let Err(err) = connection.close().await
        {
            warn!(error = %err, "closing previous upstream connection failed");
        }
        if clear_conversations {
            self.conversations.lock().await.clear();
        }

        let profile = auth.profile_name().map(str::to_string);
        let connected =
            tokio::time::timeout(self.request_timeout, self.connector.connect(auth)).await;
        let mut active = self.active.write().await;
        match connected {
            Ok(Ok(connection)) => {
                info!(
                    upstream = %self.connector.kind(),
                    profile = profile.as_deref().unwrap_or("<auto>"),
                    "upstream session ready"
                );
                active.connection = Some(connection);
                active.profile = profile;
                active.phase = SessionPhase::Ready;
                Ok(())
            }
            Ok(Err(err)) => {
                active.profile = None;
                active.phase = SessionPhase::Failed;
                Err(err.into())
            }
            Err(_) => {
                active.profile = None;
                active.phase = SessionPhase::Failed;
                Err(SessionError::UpstreamTimeout(self.request_timeout))
            }
        }
    }

    /// Re-extracts the profile's credentials and reconnects with them.
    /// Conversations survive; they belong to the same account. Returns
    /// `false` without touching anything when `profile` is no longer the
    /// active one.
    async fn refresh(&self, profile: &str, source: &dyn CredentialSource) -> SessionResult<bool> {
        let _guard = self.init_lock.lock().await;
        if self.active.read().await.profile.as_deref() != Some(profile) {
            return Ok(false);
        }
        self.set_phase(SessionPhase::Refreshing).await;

        let refreshed = match self.store.refresh_profile(profile, source).await {
            Ok(true) => self.usable_credentials(profile).await,
            Ok(false) => Err(SessionError::CredentialMissing {
                profile: profile.to_string(),
                missing: self.store.required().to_vec(),
            }),
            Err(err) => Err(err.into()),
        };
        match refreshed {
            Ok(credentials) => {
                self.open(
                    SessionAuth::Profile {
                        name: profile.to_string(),
                        credentials,
                    },
                    false,
                )
                .await?;
                Ok(true)
            }
            Err(err) => {
                self.set_phase(SessionPhase::Failed).await;
                Err(err)
            }
        }
    }

    /// Runs `call` against the live connection under the request timeout.
    /// A non-timeout failure with a named profile active triggers one
    /// refresh and one retry. Whatever the retry does, the first failure is
    /// what propagates.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> SessionResult<T>
    where
        F: FnMut(Arc<dyn UpstreamConnection>) -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        let mut attempt = 1;
        let mut original: Option<UpstreamError> = None;
        loop {
            let (connection, profile) = self.connection().await?;
            let err = match tokio::time::timeout(self.request_timeout, call(connection)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => {
                    warn!(op, attempt, timeout_secs = self.request_timeout.as_secs(), "upstream call timed out");
                    return Err(match original.take() {
                        Some(first) => first.into(),
                        None => SessionError::UpstreamTimeout(self.request_timeout),
                    });
                }
            };
            if let Some(first) = original.take() {
                warn!(op, attempt, error = %err, "retried upstream call failed");
                return Err(first.into());
            }
            if err.is_timeout() || attempt >= MAX_ATTEMPTS {
                return Err(err.into());
            }
            let (Some(profile), Some(source)) = (profile, self.source.clone()) else {
                return Err(err.into());
            };

            warn!(op, profile = %profile, attempt, error = %err, "upstream call failed; refreshing credentials");
            match self.refresh(&profile, source.as_ref()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(op, profile = %profile, "profile switched during call; not refreshing");
                    return Err(err.into());
                }
                Err(refresh_err) => {
                    warn!(op, profile = %profile, error = %refresh_err, "credential refresh failed");
                    return Err(err.into());
                }
            }
            original = Some(err);
            attempt += 1;
        }
    }
}

fn conversation_key(requested: Option<&str>) -> String {
    requested
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("conv_{}", uuid::Uuid::new_v4().simple()))
}
