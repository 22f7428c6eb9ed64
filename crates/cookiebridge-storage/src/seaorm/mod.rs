use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, EntityTrait,
    Schema,
};
use time::OffsetDateTime;

use cookiebridge_common::GlobalConfig;

use crate::credential_store::CredentialStore;
use crate::entities;
use crate::storage::{Storage, StorageResult};

const GLOBAL_CONFIG_ID: i64 = 1;

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Ensure sqlite enforces foreign keys (required for cascade + integrity).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Credential store sharing this connection. `required` is the credential
    /// subset a profile must carry for the configured upstream.
    pub fn credential_store(&self, required: Vec<String>) -> CredentialStore {
        CredentialStore::new(self.db.clone(), required)
    }

    pub async fn health(&self) -> StorageResult<()> {
        entities::GlobalConfig::find_by_id(GLOBAL_CONFIG_ID)
            .one(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GlobalConfig)
            .register(entities::Profiles)
            .register(entities::Credentials)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfig>> {
        let Some(row) = entities::GlobalConfig::find_by_id(GLOBAL_CONFIG_ID)
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(row.config_json)?))
    }

    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()> {
        use entities::global_config::Column;

        let active = entities::global_config::ActiveModel {
            id: ActiveValue::Set(GLOBAL_CONFIG_ID),
            config_json: ActiveValue::Set(serde_json::to_value(config)?),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };

        entities::GlobalConfig::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::ConfigJson, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}
