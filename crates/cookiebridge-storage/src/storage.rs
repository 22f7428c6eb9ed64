use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use cookiebridge_common::GlobalConfig;
use cookiebridge_provider_core::{CredentialMap, CredentialRecord, SourceError};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("profile '{profile}' is missing required credentials: {}", .missing.join(", "))]
    MissingCredentials {
        profile: String,
        missing: Vec<String>,
    },
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("credential source failed: {0}")]
    Source(#[from] SourceError),
    #[error("credential extraction timed out after {0:?}")]
    ExtractTimeout(Duration),
}

/// A stored profile with all of its credentials. Also the JSON document used
/// for export and import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub credentials: Vec<CredentialRecord>,
}

pub type ProfileDocument = Profile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub credential_count: u64,
}

/// Outcome of checking a profile's required credential subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredCredentials {
    Ready(CredentialMap),
    Missing(Vec<String>),
    Expired(Vec<String>),
}

impl RequiredCredentials {
    pub fn into_ready(self) -> Option<CredentialMap> {
        match self {
            RequiredCredentials::Ready(map) => Some(map),
            RequiredCredentials::Missing(_) | RequiredCredentials::Expired(_) => None,
        }
    }
}

/// Process-level persistence used at bootstrap.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0).
    async fn sync(&self) -> StorageResult<()>;

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfig>>;
    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()>;
}
