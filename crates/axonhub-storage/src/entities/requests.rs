use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One top-level client call. Rows become immutable once the status leaves
/// `processing`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "requests")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub project_id: i64,
    pub api_key_id: i64,
    /// Model id exactly as the client requested it.
    pub model_id: String,
    /// Inbound wire format, e.g. `openai/chat_completions`.
    pub format: String,
    /// `processing`, `completed`, `canceled` or `failed`.
    pub status: String,
    pub stream: bool,
    /// `api` or `admin`.
    pub source: String,
    /// Inline body, or a placeholder when stored externally.
    pub request_body: Json,
    pub response_body: Option<Json>,
    pub response_chunks: Option<Json>,
    /// DataStorage row holding the blobs; 0 means inline.
    pub data_storage_id: i64,
    /// Provider-assigned response id.
    pub external_id: Option<String>,
    pub channel_id: Option<i64>,
    pub trace_id: Option<i64>,
    pub duration_ms: Option<i64>,
    pub first_token_ms: Option<i64>,
    pub usage: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}

pub mod status {
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const CANCELED: &str = "canceled";
    pub const FAILED: &str = "failed";
}
