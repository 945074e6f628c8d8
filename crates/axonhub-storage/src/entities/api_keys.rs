use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Gateway credentials. The raw `key_value` never leaves this table for
/// caching; hot lookups go through a hash-derived cache key.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub project_id: i64,
    #[sea_orm(unique)]
    pub key_value: String,
    pub name: Option<String>,
    /// `user` or `service_account`.
    pub key_type: String,
    /// `enabled` or `disabled`.
    pub status: String,
    pub scopes: Json,
    /// Named configuration slices; at most one is active.
    pub profiles: Option<Json>,
    pub quota: Option<Json>,
    /// Soft delete; 0 means live.
    pub deleted_at: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
    #[sea_orm(belongs_to, from = "project_id", to = "id", on_delete = "Cascade")]
    pub project: HasOne<super::projects::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
