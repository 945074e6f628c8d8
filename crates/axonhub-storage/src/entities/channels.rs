use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Upstream endpoint configuration rows; the hot registry mirrors the
/// enabled subset in memory.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// Provider family, e.g. `openai_compatible`, `anthropic`, `gemini`.
    pub channel_type: String,
    /// `enabled`, `disabled` or `archived`.
    pub status: String,
    pub base_url: String,
    pub credentials: Json,
    pub supported_models: Json,
    pub settings: Json,
    /// Operator-visible reason for the last automatic disable.
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
