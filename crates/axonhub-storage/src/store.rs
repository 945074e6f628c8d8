use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Schema,
};
use time::OffsetDateTime;

use axonhub_channel::channel::{
    Channel, ChannelCredentials, ChannelSettings, ChannelStatus, ChannelType,
};
use axonhub_channel::registry::ChannelSource;
use axonhub_common::GatewayError;

use crate::db::connect_shared;
use crate::entities::{self, requests::status};

/// Thin typed facade over the gateway database.
#[derive(Clone)]
pub struct GatewayStorage {
    db: DatabaseConnection,
}

impl GatewayStorage {
    pub async fn connect(dsn: &str) -> Result<Self, DbErr> {
        let db = connect_shared(dsn).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::Projects)
            .register(entities::ApiKeys)
            .register(entities::Channels)
            .register(entities::Traces)
            .register(entities::Requests)
            .register(entities::RequestExecutions)
            .register(entities::DataStorages)
            .sync(&self.db)
            .await
    }

    // ---- channels ----

    pub async fn list_enabled_channels(&self) -> Result<Vec<entities::channels::Model>, DbErr> {
        entities::Channels::find()
            .filter(entities::channels::Column::Status.eq("enabled"))
            .order_by_asc(entities::channels::Column::Id)
            .all(&self.db)
            .await
    }

    pub async fn set_channel_disabled(&self, channel_id: i64, reason: &str) -> Result<(), DbErr> {
        let active = entities::channels::ActiveModel {
            id: ActiveValue::Unchanged(channel_id),
            status: ActiveValue::Set("disabled".to_string()),
            error_message: ActiveValue::Set(Some(reason.to_string())),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::Channels::update(active).exec(&self.db).await?;
        Ok(())
    }

    // ---- api keys / projects ----

    pub async fn find_api_key_by_value(
        &self,
        raw: &str,
    ) -> Result<Option<entities::api_keys::Model>, DbErr> {
        entities::ApiKeys::find()
            .filter(entities::api_keys::Column::KeyValue.eq(raw))
            .one(&self.db)
            .await
    }

    /// Incremental refresh: rows updated after `since`, soft-deleted rows
    /// included so caches can evict them.
    pub async fn list_api_keys_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<entities::api_keys::Model>, DbErr> {
        entities::ApiKeys::find()
            .filter(entities::api_keys::Column::UpdatedAt.gt(since))
            .order_by_asc(entities::api_keys::Column::UpdatedAt)
            .all(&self.db)
            .await
    }

    pub async fn find_project(
        &self,
        project_id: i64,
    ) -> Result<Option<entities::projects::Model>, DbErr> {
        entities::Projects::find_by_id(project_id).one(&self.db).await
    }

    // ---- data storages ----

    pub async fn list_active_data_storages(
        &self,
    ) -> Result<Vec<entities::data_storages::Model>, DbErr> {
        entities::DataStorages::find()
            .filter(entities::data_storages::Column::Status.eq("active"))
            .order_by_asc(entities::data_storages::Column::Id)
            .all(&self.db)
            .await
    }

    pub async fn find_data_storage(
        &self,
        id: i64,
    ) -> Result<Option<entities::data_storages::Model>, DbErr> {
        entities::DataStorages::find_by_id(id).one(&self.db).await
    }

    /// The storage new requests write to: the default row, else primary.
    pub async fn default_data_storage(
        &self,
    ) -> Result<Option<entities::data_storages::Model>, DbErr> {
        let default = entities::DataStorages::find()
            .filter(entities::data_storages::Column::Status.eq("active"))
            .filter(entities::data_storages::Column::IsDefault.eq(true))
            .one(&self.db)
            .await?;
        if default.is_some() {
            return Ok(default);
        }
        entities::DataStorages::find()
            .filter(entities::data_storages::Column::IsPrimary.eq(true))
            .one(&self.db)
            .await
    }

    pub async fn newest_data_storage_update(&self) -> Result<Option<OffsetDateTime>, DbErr> {
        let newest = entities::DataStorages::find()
            .order_by_desc(entities::data_storages::Column::UpdatedAt)
            .limit(1)
            .one(&self.db)
            .await?;
        Ok(newest.map(|row| row.updated_at))
    }

    // ---- traces ----

    pub async fn create_trace(&self, project_id: i64) -> Result<entities::traces::Model, DbErr> {
        let active = entities::traces::ActiveModel {
            project_id: ActiveValue::Set(project_id),
            name: ActiveValue::Set(None),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        let result = entities::Traces::insert(active).exec(&self.db).await?;
        entities::Traces::find_by_id(result.last_insert_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound("trace row vanished after insert".to_string()))
    }

    /// Completed requests for a trace in chronological order.
    pub async fn list_trace_requests(
        &self,
        trace_id: i64,
    ) -> Result<Vec<entities::requests::Model>, DbErr> {
        entities::Requests::find()
            .filter(entities::requests::Column::TraceId.eq(trace_id))
            .filter(entities::requests::Column::Status.eq(status::COMPLETED))
            .order_by_asc(entities::requests::Column::CreatedAt)
            .all(&self.db)
            .await
    }

    /// Channel of the most recent completed request in the trace.
    pub async fn last_successful_channel(&self, trace_id: i64) -> Result<Option<i64>, DbErr> {
        let latest = entities::Requests::find()
            .filter(entities::requests::Column::TraceId.eq(trace_id))
            .filter(entities::requests::Column::Status.eq(status::COMPLETED))
            .filter(entities::requests::Column::ChannelId.is_not_null())
            .order_by_desc(entities::requests::Column::CreatedAt)
            .limit(1)
            .one(&self.db)
            .await?;
        Ok(latest.and_then(|row| row.channel_id))
    }

    // ---- requests / executions ----

    pub async fn insert_request(
        &self,
        active: entities::requests::ActiveModel,
    ) -> Result<entities::requests::Model, DbErr> {
        let result = entities::Requests::insert(active).exec(&self.db).await?;
        entities::Requests::find_by_id(result.last_insert_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound("request row vanished after insert".to_string()))
    }

    pub async fn update_request(
        &self,
        active: entities::requests::ActiveModel,
    ) -> Result<(), DbErr> {
        entities::Requests::update(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn find_request(
        &self,
        request_id: i64,
    ) -> Result<Option<entities::requests::Model>, DbErr> {
        entities::Requests::find_by_id(request_id).one(&self.db).await
    }

    pub async fn insert_execution(
        &self,
        active: entities::request_executions::ActiveModel,
    ) -> Result<entities::request_executions::Model, DbErr> {
        let result = entities::RequestExecutions::insert(active)
            .exec(&self.db)
            .await?;
        entities::RequestExecutions::find_by_id(result.last_insert_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| {
                DbErr::RecordNotFound("execution row vanished after insert".to_string())
            })
    }

    pub async fn update_execution(
        &self,
        active: entities::request_executions::ActiveModel,
    ) -> Result<(), DbErr> {
        entities::RequestExecutions::update(active)
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

fn map_db_err(err: DbErr) -> GatewayError {
    GatewayError::InternalStorage(err.to_string())
}

/// Hot-registry loading straight off the channels table.
#[async_trait]
impl ChannelSource for GatewayStorage {
    async fn load_enabled(&self) -> Result<Vec<Channel>, GatewayError> {
        let rows = self.list_enabled_channels().await.map_err(map_db_err)?;
        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            match channel_from_row(row) {
                Ok(channel) => channels.push(channel),
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed channel row");
                }
            }
        }
        Ok(channels)
    }

    async fn disable_channel(&self, channel_id: i64, reason: &str) -> Result<(), GatewayError> {
        self.set_channel_disabled(channel_id, reason)
            .await
            .map_err(map_db_err)
    }
}

pub fn channel_from_row(row: entities::channels::Model) -> Result<Channel, serde_json::Error> {
    let channel_type: ChannelType =
        serde_json::from_value(serde_json::Value::String(row.channel_type))?;
    let status = match row.status.as_str() {
        "enabled" => ChannelStatus::Enabled,
        "archived" => ChannelStatus::Archived,
        _ => ChannelStatus::Disabled,
    };
    let credentials: ChannelCredentials = serde_json::from_value(row.credentials)?;
    let supported_models: Vec<String> = serde_json::from_value(row.supported_models)?;
    let settings: ChannelSettings = serde_json::from_value(row.settings)?;
    Ok(Channel {
        id: row.id,
        name: row.name,
        channel_type,
        status,
        base_url: row.base_url,
        credentials,
        supported_models,
        settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_rows_decode_typed_settings() {
        let row = entities::channels::Model {
            id: 4,
            name: "deepseek".to_string(),
            channel_type: "openai_compatible".to_string(),
            status: "enabled".to_string(),
            base_url: "https://api.deepseek.com/v1".to_string(),
            credentials: serde_json::json!({"api_key": "sk"}),
            supported_models: serde_json::json!(["deepseek-chat"]),
            settings: serde_json::json!({
                "extra_model_prefix": "deepseek",
                "priority": 5
            }),
            error_message: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };
        let channel = channel_from_row(row).unwrap();
        assert_eq!(channel.channel_type, ChannelType::OpenAiCompatible);
        assert_eq!(channel.settings.priority, 5);
        assert_eq!(
            channel.settings.extra_model_prefix.as_deref(),
            Some("deepseek")
        );
    }
}
