use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, FromQueryResult,
    QueryFilter, QueryOrder, QuerySelect, TransactionError, TransactionTrait,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

use cookiebridge_provider_core::{CredentialRecord, CredentialSource, missing_required};

use crate::entities;
use crate::storage::{
    Profile, ProfileDocument, ProfileSummary, RequiredCredentials, StorageError, StorageResult,
};

pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, FromQueryResult)]
struct CredentialCountRow {
    profile_name: String,
    credential_count: Option<i64>,
}

/// Multi-profile credential persistence with expiry-aware retrieval.
///
/// Writers serialise on one mutex and run inside a transaction. Readers take
/// no lock and may observe the state from just before a concurrent write.
#[derive(Clone)]
pub struct CredentialStore {
    db: DatabaseConnection,
    required: Arc<[String]>,
    write_lock: Arc<Mutex<()>>,
    extract_timeout: Duration,
}

impl CredentialStore {
    pub fn new(db: DatabaseConnection, required: Vec<String>) -> Self {
        Self {
            db,
            required: required.into(),
            write_lock: Arc::new(Mutex::new(())),
            extract_timeout: DEFAULT_EXTRACT_TIMEOUT,
        }
    }

    pub fn with_extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Replaces the profile's credential set atomically. Fails without
    /// writing anything when a required credential is absent. `created_at`
    /// survives a re-save; `updated_at` is bumped.
    pub async fn save_profile(
        &self,
        name: &str,
        credentials: Vec<CredentialRecord>,
        source: &str,
    ) -> StorageResult<()> {
        // Duplicate names collapse to the last record; the table keys on name.
        let credentials: Vec<CredentialRecord> = credentials
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();

        let missing = missing_required(&credentials, &self.required);
        if !missing.is_empty() {
            return Err(StorageError::MissingCredentials {
                profile: name.to_string(),
                missing: missing.into_iter().map(str::to_string).collect(),
            });
        }

        let _guard = self.write_lock.lock().await;
        let now = OffsetDateTime::now_utc();
        let count = credentials.len();
        let profile_name = name.to_string();
        let source = source.to_string();

        let result = self
            .db
            .transaction::<_, (), DbErr>(move |txn| {
                Box::pin(async move {
                    use entities::credentials::Column as CredentialColumn;
                    use entities::profiles::Column as ProfileColumn;

                    let profile = entities::profiles::ActiveModel {
                        name: ActiveValue::Set(profile_name.clone()),
                        source: ActiveValue::Set(source),
                        created_at: ActiveValue::Set(now),
                        updated_at: ActiveValue::Set(now),
                        ..Default::default()
                    };
                    entities::Profiles::insert(profile)
                        .on_conflict(
                            OnConflict::column(ProfileColumn::Name)
                                .update_columns([ProfileColumn::Source, ProfileColumn::UpdatedAt])
                                .to_owned(),
                        )
                        .exec_without_returning(txn)
                        .await?;

                    entities::Credentials::delete_many()
                        .filter(CredentialColumn::ProfileName.eq(profile_name.as_str()))
                        .exec(txn)
                        .await?;

                    if !credentials.is_empty() {
                        let models = credentials.into_iter().map(|record| {
                            entities::credentials::ActiveModel {
                                profile_name: ActiveValue::Set(profile_name.clone()),
                                name: ActiveValue::Set(record.name),
                                value: ActiveValue::Set(record.value),
                                domain: ActiveValue::Set(record.domain),
                                path: ActiveValue::Set(record.path),
                                expires_at: ActiveValue::Set(record.expires),
                                secure: ActiveValue::Set(record.secure),
                                http_only: ActiveValue::Set(record.http_only),
                                ..Default::default()
                            }
                        });
                        entities::Credentials::insert_many(models)
                            .exec_without_returning(txn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await;
        flatten_transaction(result)?;

        info!(profile = %name, credentials = count, "saved profile");
        Ok(())
    }

    /// The profile and all of its credentials in one joined read.
    pub async fn load_profile(&self, name: &str) -> StorageResult<Option<Profile>> {
        let rows = entities::Profiles::find_by_id(name.to_string())
            .find_with_related(entities::Credentials)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .map(|(profile, credentials)| Profile {
                name: profile.name,
                source: profile.source,
                created_at: profile.created_at,
                updated_at: profile.updated_at,
                credentials: credentials.into_iter().map(record_from_row).collect(),
            }))
    }

    /// Reads only the required credential names and classifies the result.
    pub async fn check_required_credentials(
        &self,
        name: &str,
    ) -> StorageResult<RequiredCredentials> {
        use entities::credentials::Column;

        let rows = entities::Credentials::find()
            .filter(Column::ProfileName.eq(name))
            .filter(Column::Name.is_in(self.required.iter().cloned()))
            .all(&self.db)
            .await?;

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|required| !rows.iter().any(|row| &row.name == *required))
            .cloned()
            .collect();
        if !missing.is_empty() || self.required.is_empty() {
            let exists = entities::Profiles::find_by_id(name.to_string())
                .one(&self.db)
                .await?
                .is_some();
            if !exists {
                return Err(StorageError::ProfileNotFound(name.to_string()));
            }
        }
        if !missing.is_empty() {
            return Ok(RequiredCredentials::Missing(missing));
        }

        let now = OffsetDateTime::now_utc();
        let expired: Vec<String> = rows
            .iter()
            .filter(|row| row.expires_at.is_some_and(|at| at <= now))
            .map(|row| row.name.clone())
            .collect();
        if !expired.is_empty() {
            return Ok(RequiredCredentials::Expired(expired));
        }

        Ok(RequiredCredentials::Ready(
            rows.into_iter().map(|row| (row.name, row.value)).collect(),
        ))
    }

    /// Required credential values, or `None` when the profile is unknown or
    /// any required credential is missing or expired.
    pub async fn get_required_credentials(
        &self,
        name: &str,
    ) -> StorageResult<Option<cookiebridge_provider_core::CredentialMap>> {
        match self.check_required_credentials(name).await {
            Ok(state) => Ok(state.into_ready()),
            Err(StorageError::ProfileNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// All profiles, most recently updated first.
    pub async fn list_profiles(&self) -> StorageResult<Vec<ProfileSummary>> {
        use entities::credentials::Column as CredentialColumn;
        use entities::profiles::Column as ProfileColumn;

        let profiles = entities::Profiles::find()
            .order_by_desc(ProfileColumn::UpdatedAt)
            .order_by_asc(ProfileColumn::Name)
            .all(&self.db)
            .await?;
        let counts: HashMap<String, i64> = entities::Credentials::find()
            .select_only()
            .column(CredentialColumn::ProfileName)
            .column_as(CredentialColumn::Name.count(), "credential_count")
            .group_by(CredentialColumn::ProfileName)
            .into_model::<CredentialCountRow>()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| (row.profile_name, row.credential_count.unwrap_or(0)))
            .collect();

        Ok(profiles
            .into_iter()
            .map(|profile| {
                let credential_count = counts
                    .get(&profile.name)
                    .copied()
                    .unwrap_or(0)
                    .max(0) as u64;
                ProfileSummary {
                    name: profile.name,
                    source: profile.source,
                    created_at: profile.created_at,
                    updated_at: profile.updated_at,
                    credential_count,
                }
            })
            .collect())
    }

    /// Deletes the profile and its credentials. Returns whether it existed.
    pub async fn delete_profile(&self, name: &str) -> StorageResult<bool> {
        let _guard = self.write_lock.lock().await;
        let profile_name = name.to_string();
        let result = self
            .db
            .transaction::<_, u64, DbErr>(move |txn| {
                Box::pin(async move {
                    use entities::credentials::Column;

                    entities::Credentials::delete_many()
                        .filter(Column::ProfileName.eq(profile_name.as_str()))
                        .exec(txn)
                        .await?;
                    let deleted = entities::Profiles::delete_by_id(profile_name)
                        .exec(txn)
                        .await?;
                    Ok(deleted.rows_affected)
                })
            })
            .await;
        let deleted = flatten_transaction(result)? > 0;
        if deleted {
            info!(profile = %name, "deleted profile");
        }
        Ok(deleted)
    }

    /// Re-extracts the profile's credentials from its recorded source and
    /// replaces the stored set. `false` when the profile does not exist or
    /// the source had nothing.
    pub async fn refresh_profile(
        &self,
        name: &str,
        source: &dyn CredentialSource,
    ) -> StorageResult<bool> {
        let Some(profile) = entities::Profiles::find_by_id(name.to_string())
            .one(&self.db)
            .await?
        else {
            return Ok(false);
        };

        let records = self.extract(source, &profile.source).await?;
        if records.is_empty() {
            debug!(profile = %name, source = %profile.source, "credential source returned nothing");
            return Ok(false);
        }
        self.save_profile(name, records, &profile.source).await?;
        info!(profile = %name, source = %profile.source, "refreshed profile");
        Ok(true)
    }

    /// Extracts credentials for `source_label` and stores them as `name`.
    /// Returns the number of stored credentials.
    pub async fn create_profile_from_source(
        &self,
        name: &str,
        source_label: &str,
        source: &dyn CredentialSource,
    ) -> StorageResult<usize> {
        let records = self.extract(source, source_label).await?;
        let count = records.len();
        self.save_profile(name, records, source_label).await?;
        Ok(count)
    }

    pub async fn export_profile(&self, name: &str) -> StorageResult<Option<ProfileDocument>> {
        self.load_profile(name).await
    }

    /// Stores `document`'s credentials under `name`, subject to the same
    /// required-set check as any other save.
    pub async fn import_profile(&self, name: &str, document: ProfileDocument) -> StorageResult<()> {
        self.save_profile(name, document.credentials, &document.source)
            .await
    }

    async fn extract(
        &self,
        source: &dyn CredentialSource,
        label: &str,
    ) -> StorageResult<Vec<CredentialRecord>> {
        match tokio::time::timeout(self.extract_timeout, source.extract(label)).await {
            Ok(records) => Ok(records?),
            Err(_) => Err(StorageError::ExtractTimeout(self.extract_timeout)),
        }
    }
}

fn record_from_row(row: entities::credentials::Model) -> CredentialRecord {
    CredentialRecord {
        name: row.name,
        value: row.value,
        domain: row.domain,
        path: row.path,
        expires: row.expires_at,
        secure: row.secure,
        http_only: row.http_only,
    }
}

fn flatten_transaction<T>(result: Result<T, TransactionError<DbErr>>) -> Result<T, DbErr> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Connection(err)) => Err(err),
        Err(TransactionError::Transaction(err)) => Err(err),
    }
}
