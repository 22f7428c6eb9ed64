use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cookiebridge_common::GlobalConfigPatch;
use cookiebridge_provider_core::{CredentialRecord, CredentialSource, SourceError};
use cookiebridge_storage::{
    CredentialStore, RequiredCredentials, SeaOrmStorage, Storage, StorageError,
};
use tempfile::TempDir;
use time::OffsetDateTime;

const PSID: &str = "__Secure-1PSID";
const PSIDTS: &str = "__Secure-1PSIDTS";

async fn open() -> (TempDir, SeaOrmStorage, CredentialStore) {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("store.db").display());
    let storage = SeaOrmStorage::connect(&dsn).await.unwrap();
    storage.sync().await.unwrap();
    let store = storage.credential_store(vec![PSID.to_string(), PSIDTS.to_string()]);
    (dir, storage, store)
}

fn cookies(sid: &str) -> Vec<CredentialRecord> {
    vec![
        CredentialRecord::new(PSID, sid).with_domain(".google.com"),
        CredentialRecord::new(PSIDTS, "ts").with_domain(".google.com"),
        CredentialRecord::new("NID", "other"),
    ]
}

struct CountingSource {
    calls: AtomicUsize,
    records: Vec<CredentialRecord>,
    delay: Duration,
}

impl CountingSource {
    fn new(records: Vec<CredentialRecord>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            records,
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl CredentialSource for CountingSource {
    async fn extract(&self, label: &str) -> Result<Vec<CredentialRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if label == "missing" {
            return Err(SourceError::UnknownSource(label.to_string()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.records.clone())
    }
}

#[tokio::test]
async fn save_and_load_profile() {
    let (_dir, _storage, store) = open().await;
    store.save_profile("work", cookies("sid-1"), "chrome").await.unwrap();

    let profile = store.load_profile("work").await.unwrap().unwrap();
    assert_eq!(profile.source, "chrome");
    assert_eq!(profile.credentials.len(), 3);
    let psid = profile
        .credentials
        .iter()
        .find(|record| record.name == PSID)
        .unwrap();
    assert_eq!(psid.value, "sid-1");
    assert_eq!(psid.domain, ".google.com");

    let required = store.get_required_credentials("work").await.unwrap().unwrap();
    assert_eq!(required.len(), 2);
    assert_eq!(required.get(PSID).map(String::as_str), Some("sid-1"));
    assert!(!required.contains_key("NID"));
}

#[tokio::test]
async fn missing_required_credential_persists_nothing() {
    let (_dir, _storage, store) = open().await;
    let partial = vec![CredentialRecord::new(PSID, "sid")];

    let err = store.save_profile("work", partial, "chrome").await.unwrap_err();
    match err {
        StorageError::MissingCredentials { profile, missing } => {
            assert_eq!(profile, "work");
            assert_eq!(missing, vec![PSIDTS.to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.load_profile("work").await.unwrap().is_none());
    assert!(store.list_profiles().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_required_credential_is_unusable() {
    let (_dir, _storage, store) = open().await;
    let past = OffsetDateTime::now_utc() - time::Duration::hours(1);
    let records = vec![
        CredentialRecord::new(PSID, "sid"),
        CredentialRecord::new(PSIDTS, "ts").with_expiry(past),
    ];
    store.save_profile("work", records, "chrome").await.unwrap();

    assert!(store.get_required_credentials("work").await.unwrap().is_none());
    assert_eq!(
        store.check_required_credentials("work").await.unwrap(),
        RequiredCredentials::Expired(vec![PSIDTS.to_string()])
    );
}

#[tokio::test]
async fn unknown_profile_is_not_found() {
    let (_dir, _storage, store) = open().await;
    assert!(store.get_required_credentials("ghost").await.unwrap().is_none());
    assert!(matches!(
        store.check_required_credentials("ghost").await,
        Err(StorageError::ProfileNotFound(name)) if name == "ghost"
    ));
}

#[tokio::test]
async fn resave_replaces_credentials_and_keeps_created_at() {
    let (_dir, _storage, store) = open().await;
    store.save_profile("work", cookies("old"), "chrome").await.unwrap();
    let first = store.load_profile("work").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let fewer = vec![
        CredentialRecord::new(PSID, "new"),
        CredentialRecord::new(PSIDTS, "ts"),
    ];
    store.save_profile("work", fewer, "firefox").await.unwrap();
    let second = store.load_profile("work").await.unwrap().unwrap();

    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
    assert_eq!(second.source, "firefox");
    assert_eq!(second.credentials.len(), 2);
}

#[tokio::test]
async fn list_profiles_orders_by_recent_update() {
    let (_dir, _storage, store) = open().await;
    store.save_profile("a", cookies("1"), "chrome").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.save_profile("b", cookies("2")[..2].to_vec(), "chrome").await.unwrap();

    let listed = store.list_profiles().await.unwrap();
    let names: Vec<_> = listed.iter().map(|summary| summary.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
    assert_eq!(listed[0].credential_count, 2);
    assert_eq!(listed[1].credential_count, 3);
}

#[tokio::test]
async fn delete_profile_cascades() {
    let (_dir, _storage, store) = open().await;
    store.save_profile("work", cookies("sid"), "chrome").await.unwrap();

    assert!(store.delete_profile("work").await.unwrap());
    assert!(!store.delete_profile("work").await.unwrap());
    assert!(store.load_profile("work").await.unwrap().is_none());

    // A new profile with the same name starts from an empty credential set.
    store
        .save_profile("work", cookies("fresh")[..2].to_vec(), "chrome")
        .await
        .unwrap();
    let profile = store.load_profile("work").await.unwrap().unwrap();
    assert_eq!(profile.credentials.len(), 2);
}

#[tokio::test]
async fn refresh_reextracts_from_recorded_source() {
    let (_dir, _storage, store) = open().await;
    store.save_profile("work", cookies("old"), "chrome").await.unwrap();
    let source = CountingSource::new(cookies("new"));

    assert!(store.refresh_profile("work", &source).await.unwrap());
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    let required = store.get_required_credentials("work").await.unwrap().unwrap();
    assert_eq!(required.get(PSID).map(String::as_str), Some("new"));

    assert!(!store.refresh_profile("ghost", &source).await.unwrap());
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    let empty = CountingSource::new(Vec::new());
    assert!(!store.refresh_profile("work", &empty).await.unwrap());
}

#[tokio::test]
async fn extraction_is_bounded_by_timeout() {
    let (_dir, storage, _store) = open().await;
    let store = storage
        .credential_store(vec![PSID.to_string(), PSIDTS.to_string()])
        .with_extract_timeout(Duration::from_millis(30));
    let mut source = CountingSource::new(cookies("slow"));
    source.delay = Duration::from_millis(500);

    let err = store
        .create_profile_from_source("work", "chrome", &source)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ExtractTimeout(_)));
    assert!(store.load_profile("work").await.unwrap().is_none());
}

#[tokio::test]
async fn create_from_source_reports_source_errors() {
    let (_dir, _storage, store) = open().await;
    let source = Arc::new(CountingSource::new(cookies("sid")));

    let stored = store
        .create_profile_from_source("work", "chrome", source.as_ref())
        .await
        .unwrap();
    assert_eq!(stored, 3);

    let err = store
        .create_profile_from_source("other", "missing", source.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Source(SourceError::UnknownSource(_))));
}

#[tokio::test]
async fn export_then_import_under_new_name() {
    let (_dir, _storage, store) = open().await;
    store.save_profile("work", cookies("sid"), "chrome").await.unwrap();

    let document = store.export_profile("work").await.unwrap().unwrap();
    let json = serde_json::to_string(&document).unwrap();
    let parsed = serde_json::from_str(&json).unwrap();
    store.import_profile("copy", parsed).await.unwrap();

    let copy = store.load_profile("copy").await.unwrap().unwrap();
    assert_eq!(copy.name, "copy");
    assert_eq!(copy.source, "chrome");
    assert_eq!(copy.credentials.len(), 3);
}

#[tokio::test]
async fn global_config_round_trips() {
    let (_dir, storage, _store) = open().await;
    assert!(storage.load_global_config().await.unwrap().is_none());

    let mut config = GlobalConfigPatch {
        dsn: Some("sqlite://x.db".to_string()),
        ..Default::default()
    }
    .into_config()
    .unwrap();
    storage.upsert_global_config(&config).await.unwrap();
    config.port = 9000;
    storage.upsert_global_config(&config).await.unwrap();

    let loaded = storage.load_global_config().await.unwrap().unwrap();
    assert_eq!(loaded, config);
    storage.health().await.unwrap();
}
