use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Groups related requests into one threaded conversation.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "traces")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub project_id: i64,
    pub name: Option<String>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "project_id", to = "id", on_delete = "Cascade")]
    pub project: HasOne<super::projects::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
