use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use cookiebridge_core::{ErrorKind, SessionError, SessionPhase, UpstreamSession};
use cookiebridge_provider_core::{
    ChatSession, CredentialRecord, CredentialSource, SessionAuth, SourceError, UpstreamConnection,
    UpstreamConnector, UpstreamError, UpstreamKind, UpstreamResult,
};
use cookiebridge_storage::{CredentialStore, SeaOrmStorage, Storage};

const PSID: &str = "__Secure-1PSID";
const PSIDTS: &str = "__Secure-1PSIDTS";

#[derive(Default)]
struct Script {
    connects: AtomicUsize,
    closes: AtomicUsize,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    /// Calls numbered from here on hang; 0 never hangs.
    hang_from: AtomicUsize,
    /// The next call waits for `release` after signalling `entered`.
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

struct FakeConnector(Arc<Script>);

#[async_trait]
impl UpstreamConnector for FakeConnector {
    fn kind(&self) -> UpstreamKind {
        UpstreamKind::GeminiWeb
    }

    fn required_credentials(&self) -> Vec<String> {
        vec![PSID.to_string(), PSIDTS.to_string()]
    }

    async fn connect(&self, auth: SessionAuth) -> UpstreamResult<Arc<dyn UpstreamConnection>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        let label = match auth {
            SessionAuth::Profile { credentials, .. } => credentials[PSID].clone(),
            SessionAuth::Auto => "auto".to_string(),
        };
        Ok(Arc::new(FakeConnection {
            script: self.0.clone(),
            label,
        }))
    }
}

struct FakeConnection {
    script: Arc<Script>,
    label: String,
}

impl FakeConnection {
    async fn answer(&self, prompt: &str) -> UpstreamResult<String> {
        let call = self.script.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.script.gated.swap(false, Ordering::SeqCst) {
            self.script.entered.notify_one();
            self.script.release.notified().await;
        }
        let hang_from = self.script.hang_from.load(Ordering::SeqCst);
        if hang_from != 0 && call >= hang_from {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        let failed = self
            .script
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(UpstreamError::AuthFailure(format!("session expired on call {call}")));
        }
        Ok(format!("{}: {prompt}", self.label))
    }
}

#[async_trait]
impl UpstreamConnection for FakeConnection {
    async fn generate(&self, prompt: &str, _model: Option<&str>) -> UpstreamResult<String> {
        self.answer(prompt).await
    }

    async fn chat(&self, session: &mut ChatSession, message: &str) -> UpstreamResult<String> {
        let reply = self.answer(message).await?;
        session
            .conversation_id
            .get_or_insert_with(|| "remote-1".to_string());
        session.record_exchange(message, &reply);
        Ok(reply)
    }

    async fn close(&self) -> UpstreamResult<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CountingSource {
    calls: AtomicUsize,
    sid: &'static str,
}

#[async_trait]
impl CredentialSource for CountingSource {
    async fn extract(&self, _label: &str) -> Result<Vec<CredentialRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.sid.is_empty() {
            return Ok(Vec::new());
        }
        Ok(cookies(self.sid))
    }
}

fn cookies(sid: &str) -> Vec<CredentialRecord> {
    vec![
        CredentialRecord::new(PSID, sid),
        CredentialRecord::new(PSIDTS, "ts"),
    ]
}

struct Harness {
    _dir: TempDir,
    script: Arc<Script>,
    source: Arc<CountingSource>,
    store: CredentialStore,
    session: UpstreamSession,
}

async fn harness(fresh_sid: &'static str) -> Harness {
    harness_with_timeout(fresh_sid, Duration::from_millis(300)).await
}

async fn harness_with_timeout(fresh_sid: &'static str, request_timeout: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("core.db").display());
    let storage = SeaOrmStorage::connect(&dsn).await.unwrap();
    storage.sync().await.unwrap();
    let store = storage.credential_store(vec![PSID.to_string(), PSIDTS.to_string()]);

    let script = Arc::new(Script::default());
    let source = Arc::new(CountingSource {
        calls: AtomicUsize::new(0),
        sid: fresh_sid,
    });
    let session = UpstreamSession::new(
        Arc::new(FakeConnector(script.clone())),
        store.clone(),
        Some(source.clone()),
        request_timeout,
    );
    Harness {
        _dir: dir,
        script,
        source,
        store,
        session,
    }
}

#[tokio::test]
async fn calls_before_init_report_not_initialized() {
    let h = harness("fresh").await;
    assert_eq!(h.session.phase().await, SessionPhase::Uninitialized);
    let err = h.session.generate("hi", None).await.unwrap_err();
    assert!(matches!(err, SessionError::UpstreamNotInitialized));
    assert_eq!(err.kind(), ErrorKind::NotInitialized);

    let err = h.session.init_with_profile("ghost").await.unwrap_err();
    assert!(matches!(err, SessionError::ProfileNotFound(name) if name == "ghost"));
    assert_eq!(h.script.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unusable_profile_leaves_current_connection_alone() {
    let h = harness("fresh").await;
    h.session.init_auto().await.unwrap();
    let past = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
    let records = vec![
        CredentialRecord::new(PSID, "sid").with_expiry(past),
        CredentialRecord::new(PSIDTS, "ts"),
    ];
    h.store.save_profile("old", records, "chrome").await.unwrap();

    let err = h.session.switch_profile("old").await.unwrap_err();
    assert!(matches!(err, SessionError::CredentialExpired { ref expired, .. } if expired == &vec![PSID.to_string()]));
    assert_eq!(err.kind(), ErrorKind::Credential);
    assert_eq!(h.session.phase().await, SessionPhase::Ready);
    assert_eq!(h.session.generate("hi", None).await.unwrap(), "auto: hi");
    assert_eq!(h.script.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auth_failure_refreshes_once_and_retries_once() {
    let h = harness("fresh").await;
    h.store.save_profile("work", cookies("stale"), "chrome").await.unwrap();
    h.session.init_with_profile("work").await.unwrap();
    h.script.failures_left.store(1, Ordering::SeqCst);

    let text = h.session.generate("hi", None).await.unwrap();
    assert_eq!(text, "fresh: hi");
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.script.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.script.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.script.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.current_profile().await.as_deref(), Some("work"));
    assert_eq!(h.session.phase().await, SessionPhase::Ready);
}

#[tokio::test]
async fn second_failure_propagates_without_another_refresh() {
    let h = harness("fresh").await;
    h.store.save_profile("work", cookies("stale"), "chrome").await.unwrap();
    h.session.init_with_profile("work").await.unwrap();
    h.script.failures_left.store(5, Ordering::SeqCst);

    let err = h.session.generate("hi", None).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Upstream(UpstreamError::AuthFailure(ref message)) if message.ends_with("call 1")
    ));
    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.script.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_refresh_returns_original_error() {
    let h = harness("").await;
    h.store.save_profile("work", cookies("stale"), "chrome").await.unwrap();
    h.session.init_with_profile("work").await.unwrap();
    h.script.failures_left.store(1, Ordering::SeqCst);

    let err = h.session.generate("hi", None).await.unwrap_err();
    assert!(matches!(err, SessionError::Upstream(UpstreamError::AuthFailure(_))));
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.script.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.phase().await, SessionPhase::Failed);
}

#[tokio::test]
async fn auto_session_does_not_refresh() {
    let h = harness("fresh").await;
    h.session.ensure_initialized().await.unwrap();
    h.script.failures_left.store(1, Ordering::SeqCst);

    assert!(h.session.generate("hi", None).await.is_err());
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.script.calls.load(Ordering::SeqCst), 1);

    // Already initialised: no second connect.
    h.session.ensure_initialized().await.unwrap();
    assert_eq!(h.script.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_is_not_retried() {
    let h = harness("fresh").await;
    h.store.save_profile("work", cookies("sid"), "chrome").await.unwrap();
    h.session.init_with_profile("work").await.unwrap();
    h.script.hang_from.store(1, Ordering::SeqCst);

    let err = h.session.generate("hi", None).await.unwrap_err();
    assert!(matches!(err, SessionError::UpstreamTimeout(_)));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(h.script.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn retry_timeout_still_reports_first_failure() {
    let h = harness("fresh").await;
    h.store.save_profile("work", cookies("stale"), "chrome").await.unwrap();
    h.session.init_with_profile("work").await.unwrap();
    h.script.failures_left.store(1, Ordering::SeqCst);
    h.script.hang_from.store(2, Ordering::SeqCst);

    let err = h.session.generate("hi", None).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Upstream(UpstreamError::AuthFailure(ref message)) if message.ends_with("call 1")
    ));
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.script.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failure_after_concurrent_switch_does_not_reopen_old_profile() {
    let h = harness_with_timeout("fresh", Duration::from_secs(5)).await;
    h.store.save_profile("a", cookies("sid-a"), "chrome").await.unwrap();
    h.store.save_profile("b", cookies("sid-b"), "chrome").await.unwrap();
    h.session.init_with_profile("a").await.unwrap();
    h.script.failures_left.store(1, Ordering::SeqCst);
    h.script.gated.store(true, Ordering::SeqCst);

    let call = h.session.generate("hi", None);
    let switch = async {
        h.script.entered.notified().await;
        h.session.switch_profile("b").await.unwrap();
        h.script.release.notify_one();
    };
    let (result, ()) = tokio::join!(call, switch);

    let err = result.unwrap_err();
    assert!(matches!(err, SessionError::Upstream(UpstreamError::AuthFailure(_))));
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.script.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.session.current_profile().await.as_deref(), Some("b"));
    assert_eq!(h.session.phase().await, SessionPhase::Ready);
    assert_eq!(h.session.generate("x", None).await.unwrap(), "sid-b: x");
}

#[tokio::test]
async fn chat_spanning_a_switch_is_not_stored() {
    let h = harness_with_timeout("fresh", Duration::from_secs(5)).await;
    h.store.save_profile("a", cookies("sid-a"), "chrome").await.unwrap();
    h.store.save_profile("b", cookies("sid-b"), "chrome").await.unwrap();
    h.session.init_with_profile("a").await.unwrap();
    h.script.gated.store(true, Ordering::SeqCst);

    let call = h.session.chat("hi", Some("c1"));
    let switch = async {
        h.script.entered.notified().await;
        h.session.switch_profile("b").await.unwrap();
        h.script.release.notify_one();
    };
    let (reply, ()) = tokio::join!(call, switch);

    assert_eq!(reply.unwrap().text, "sid-a: hi");
    assert!(h.session.conversation_ids().await.is_empty());

    h.session.chat("again", Some("c1")).await.unwrap();
    assert_eq!(
        h.session.conversation_history("c1").await.map(|turns| turns.len()),
        Some(2)
    );
}

#[tokio::test]
async fn chat_keeps_conversations_apart() {
    let h = harness("fresh").await;
    h.session.init_auto().await.unwrap();

    let first = h.session.chat("one", None).await.unwrap();
    let again = h
        .session
        .chat("two", Some(&first.conversation_id))
        .await
        .unwrap();
    assert_eq!(again.conversation_id, first.conversation_id);
    let other = h.session.chat("solo", Some("mine")).await.unwrap();
    assert_eq!(other.conversation_id, "mine");

    let history = h
        .session
        .conversation_history(&first.conversation_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].text, "two");
    assert_eq!(h.session.conversation_ids().await.len(), 2);

    assert!(h.session.delete_conversation("mine").await);
    assert!(!h.session.delete_conversation("mine").await);
    assert!(h.session.conversation_history("mine").await.is_none());
}

#[tokio::test]
async fn chat_stream_stores_session_after_completion() {
    let h = harness("fresh").await;
    h.session.init_auto().await.unwrap();

    let mut stream = h.session.chat_stream("hello", Some("c1")).await.unwrap();
    let mut text = String::new();
    while let Some(delta) = stream.deltas.recv().await {
        text.push_str(&delta.unwrap());
    }
    assert_eq!(text, "auto: hello");

    let mut stored = None;
    for _ in 0..50 {
        stored = h.session.conversation_history("c1").await;
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored.map(|turns| turns.len()), Some(2));
}

#[tokio::test]
async fn switching_profiles_closes_and_clears() {
    let h = harness("fresh").await;
    h.store.save_profile("a", cookies("sid-a"), "chrome").await.unwrap();
    h.store.save_profile("b", cookies("sid-b"), "chrome").await.unwrap();

    h.session.init_with_profile("a").await.unwrap();
    h.session.chat("hi", Some("c1")).await.unwrap();
    h.session.switch_profile("b").await.unwrap();

    assert_eq!(h.script.closes.load(Ordering::SeqCst), 1);
    assert!(h.session.conversation_ids().await.is_empty());
    assert_eq!(h.session.current_profile().await.as_deref(), Some("b"));
    assert_eq!(h.session.generate("x", None).await.unwrap(), "sid-b: x");

    h.session.close().await.unwrap();
    assert_eq!(h.script.closes.load(Ordering::SeqCst), 2);
    assert_eq!(h.session.phase().await, SessionPhase::Uninitialized);
    assert!(h.session.current_profile().await.is_none());
}
