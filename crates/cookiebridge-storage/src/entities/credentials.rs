use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub profile_name: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// `None` for session credentials that never expire.
    pub expires_at: Option<OffsetDateTime>,
    pub secure: bool,
    pub http_only: bool,
    #[sea_orm(belongs_to, from = "profile_name", to = "name", on_delete = "Cascade")]
    pub profile: HasOne<super::profiles::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
