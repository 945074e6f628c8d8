use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One attempt of a request against one channel. A request keeps one row
/// per retry/failover attempt.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_executions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: i64,
    pub channel_id: i64,
    pub project_id: i64,
    /// Model id after channel-local resolution.
    pub model_id: String,
    /// Outbound wire format of the channel.
    pub format: String,
    pub status: String,
    pub stream: bool,
    pub request_body: Json,
    pub response_body: Option<Json>,
    pub response_chunks: Option<Json>,
    pub data_storage_id: i64,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub first_token_ms: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "request_id", to = "id", on_delete = "Cascade")]
    pub request: HasOne<super::requests::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
