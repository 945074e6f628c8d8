use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Where request/response blobs live. A single `primary` (database) row is
/// always present; external rows point at fs/s3/gcs locations.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "data_storages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// `database`, `fs`, `s3` or `gcs`.
    pub storage_type: String,
    pub is_primary: bool,
    pub is_default: bool,
    /// `active` or `inactive`.
    pub status: String,
    /// Backend-specific settings; sensitive fields merge-preserve on update.
    pub settings: Json,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}

pub mod storage_type {
    pub const DATABASE: &str = "database";
    pub const FS: &str = "fs";
    pub const S3: &str = "s3";
    pub const GCS: &str = "gcs";
}
