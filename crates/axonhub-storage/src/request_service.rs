use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sea_orm::ActiveValue;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use axonhub_common::{GatewayError, GatewayResult};
use axonhub_protocol::ApiFormat;
use axonhub_protocol::unified::{ChatResponse, Usage};

use crate::entities;
use crate::entities::data_storages::storage_type;
use crate::entities::requests::status;
use crate::object::DataStorageManager;
use crate::store::GatewayStorage;

const STICKY_POSITIVE_TTL: Duration = Duration::from_secs(60);
const STICKY_NEGATIVE_TTL: Duration = Duration::from_secs(5);

/// Fallback body persisted when a row save keeps failing (oversized or
/// malformed payloads). The row itself is never lost.
fn invalid_body_placeholder() -> serde_json::Value {
    serde_json::json!({"message": "invalid text"})
}

// ---- external storage key grammar ----

pub fn request_body_key(project_id: i64, request_id: i64) -> String {
    format!("/{project_id}/requests/{request_id}/request_body.json")
}

pub fn response_body_key(project_id: i64, request_id: i64) -> String {
    format!("/{project_id}/requests/{request_id}/response_body.json")
}

pub fn response_chunks_key(project_id: i64, request_id: i64) -> String {
    format!("/{project_id}/requests/{request_id}/response_chunks.json")
}

pub fn execution_key(project_id: i64, request_id: i64, execution_id: i64, file: &str) -> String {
    format!("/{project_id}/requests/{request_id}/executions/{execution_id}/{file}.json")
}

/// One persisted stream event: `{last_event_id?, event?, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: String,
}

impl StoredChunk {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Which artifact classes get persisted. A disabled flag still creates the
/// row; the body is stored as an empty placeholder.
#[derive(Debug, Clone, Copy)]
pub struct StoragePolicy {
    pub store_request_body: bool,
    pub store_response_body: bool,
    pub store_chunks: bool,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            store_request_body: true,
            store_response_body: true,
            store_chunks: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub project_id: i64,
    pub api_key_id: i64,
    pub model_id: String,
    pub format: ApiFormat,
    pub stream: bool,
    /// `api` or `admin`.
    pub source: String,
    pub trace_id: Option<i64>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionMetrics {
    pub duration_ms: i64,
    pub first_token_ms: Option<i64>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy)]
struct StickyEntry {
    channel_id: Option<i64>,
    expires_at: Instant,
}

/// Persists requests and their per-attempt executions, streaming bodies and
/// chunks to the configured data storage.
pub struct RequestService {
    storage: GatewayStorage,
    objects: Arc<DataStorageManager>,
    policy: StoragePolicy,
    sticky: Mutex<HashMap<i64, StickyEntry>>,
}

impl RequestService {
    pub fn new(
        storage: GatewayStorage,
        objects: Arc<DataStorageManager>,
        policy: StoragePolicy,
    ) -> Self {
        Self {
            storage,
            objects,
            policy,
            sticky: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &GatewayStorage {
        &self.storage
    }

    fn map_db(err: sea_orm::DbErr) -> GatewayError {
        GatewayError::InternalStorage(err.to_string())
    }

    /// The storage new artifacts go to. `None` means inline (database).
    async fn active_external_storage(
        &self,
    ) -> GatewayResult<Option<entities::data_storages::Model>> {
        let Some(row) = self
            .storage
            .default_data_storage()
            .await
            .map_err(Self::map_db)?
        else {
            return Ok(None);
        };
        if row.is_primary || row.storage_type == storage_type::DATABASE {
            return Ok(None);
        }
        Ok(Some(row))
    }

    pub async fn create_trace(&self, project_id: i64) -> GatewayResult<entities::traces::Model> {
        self.storage
            .create_trace(project_id)
            .await
            .map_err(Self::map_db)
    }

    pub async fn create_request(
        &self,
        new: NewRequest,
    ) -> GatewayResult<entities::requests::Model> {
        let external = self.active_external_storage().await?;
        let data_storage_id = external.as_ref().map(|row| row.id).unwrap_or(0);
        let inline_body = if !self.policy.store_request_body {
            serde_json::Value::Null
        } else if external.is_some() {
            serde_json::json!({})
        } else {
            new.body.clone()
        };

        let now = OffsetDateTime::now_utc();
        let active = entities::requests::ActiveModel {
            project_id: ActiveValue::Set(new.project_id),
            api_key_id: ActiveValue::Set(new.api_key_id),
            model_id: ActiveValue::Set(new.model_id.clone()),
            format: ActiveValue::Set(new.format.as_str().to_string()),
            status: ActiveValue::Set(status::PROCESSING.to_string()),
            stream: ActiveValue::Set(new.stream),
            source: ActiveValue::Set(new.source.clone()),
            request_body: ActiveValue::Set(inline_body),
            response_body: ActiveValue::Set(None),
            response_chunks: ActiveValue::Set(None),
            data_storage_id: ActiveValue::Set(data_storage_id),
            external_id: ActiveValue::Set(None),
            channel_id: ActiveValue::Set(None),
            trace_id: ActiveValue::Set(new.trace_id),
            duration_ms: ActiveValue::Set(None),
            first_token_ms: ActiveValue::Set(None),
            usage: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let row = match self.storage.insert_request(active.clone()).await {
            Ok(row) => row,
            Err(_) => {
                // Oversized/malformed body: keep the row, placeholder the body.
                let mut retry = active;
                retry.request_body = ActiveValue::Set(invalid_body_placeholder());
                self.storage
                    .insert_request(retry)
                    .await
                    .map_err(Self::map_db)?
            }
        };

        if self.policy.store_request_body
            && let Some(storage_row) = &external
        {
            let key = request_body_key(row.project_id, row.id);
            let payload = serde_json::to_vec(&new.body)
                .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
            self.objects.save_data(storage_row, &key, &payload).await?;
        }
        Ok(row)
    }

    pub async fn create_execution(
        &self,
        request: &entities::requests::Model,
        channel_id: i64,
        resolved_model: &str,
        outbound_format: ApiFormat,
        body: serde_json::Value,
    ) -> GatewayResult<entities::request_executions::Model> {
        let external = self.active_external_storage().await?;
        let data_storage_id = external.as_ref().map(|row| row.id).unwrap_or(0);
        let inline_body = if !self.policy.store_request_body {
            serde_json::Value::Null
        } else if external.is_some() {
            serde_json::json!({})
        } else {
            body.clone()
        };

        let now = OffsetDateTime::now_utc();
        let active = entities::request_executions::ActiveModel {
            request_id: ActiveValue::Set(request.id),
            channel_id: ActiveValue::Set(channel_id),
            project_id: ActiveValue::Set(request.project_id),
            model_id: ActiveValue::Set(resolved_model.to_string()),
            format: ActiveValue::Set(outbound_format.as_str().to_string()),
            status: ActiveValue::Set(status::PROCESSING.to_string()),
            stream: ActiveValue::Set(request.stream),
            request_body: ActiveValue::Set(inline_body),
            response_body: ActiveValue::Set(None),
            response_chunks: ActiveValue::Set(None),
            data_storage_id: ActiveValue::Set(data_storage_id),
            external_id: ActiveValue::Set(None),
            error_message: ActiveValue::Set(None),
            duration_ms: ActiveValue::Set(None),
            first_token_ms: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let row = self
            .storage
            .insert_execution(active)
            .await
            .map_err(Self::map_db)?;

        if self.policy.store_request_body
            && let Some(storage_row) = &external
        {
            let key = execution_key(request.project_id, request.id, row.id, "request_body");
            let payload = serde_json::to_vec(&body)
                .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
            self.objects.save_data(storage_row, &key, &payload).await?;
        }
        Ok(row)
    }

    pub async fn update_request_completed(
        &self,
        request: &entities::requests::Model,
        channel_id: i64,
        external_id: Option<String>,
        response: &ChatResponse,
        metrics: CompletionMetrics,
    ) -> GatewayResult<()> {
        let response_json = serde_json::to_value(response)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let inline = self
            .persist_response_blob(
                request.data_storage_id,
                response_body_key(request.project_id, request.id),
                &response_json,
            )
            .await?;

        let usage_json = metrics
            .usage
            .map(|usage| serde_json::to_value(usage).unwrap_or(serde_json::Value::Null));
        let active = entities::requests::ActiveModel {
            id: ActiveValue::Unchanged(request.id),
            status: ActiveValue::Set(status::COMPLETED.to_string()),
            channel_id: ActiveValue::Set(Some(channel_id)),
            external_id: ActiveValue::Set(external_id),
            response_body: ActiveValue::Set(Some(inline)),
            duration_ms: ActiveValue::Set(Some(metrics.duration_ms)),
            first_token_ms: ActiveValue::Set(metrics.first_token_ms),
            usage: ActiveValue::Set(usage_json),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        match self.storage.update_request(active.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                // Oversized/malformed response body: keep the status update,
                // placeholder the body.
                let mut retry = active;
                retry.response_body = ActiveValue::Set(Some(invalid_body_placeholder()));
                self.storage.update_request(retry).await.map_err(Self::map_db)
            }
        }
    }

    pub async fn update_execution_completed(
        &self,
        request: &entities::requests::Model,
        execution: &entities::request_executions::Model,
        external_id: Option<String>,
        response: &ChatResponse,
        metrics: CompletionMetrics,
    ) -> GatewayResult<()> {
        let response_json = serde_json::to_value(response)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let inline = self
            .persist_response_blob(
                execution.data_storage_id,
                execution_key(request.project_id, request.id, execution.id, "response_body"),
                &response_json,
            )
            .await?;

        let active = entities::request_executions::ActiveModel {
            id: ActiveValue::Unchanged(execution.id),
            status: ActiveValue::Set(status::COMPLETED.to_string()),
            external_id: ActiveValue::Set(external_id),
            response_body: ActiveValue::Set(Some(inline)),
            duration_ms: ActiveValue::Set(Some(metrics.duration_ms)),
            first_token_ms: ActiveValue::Set(metrics.first_token_ms),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        self.storage
            .update_execution(active)
            .await
            .map_err(Self::map_db)
    }

    /// Final status derived from the terminal error: client cancellation
    /// maps to `canceled`, everything else to `failed`.
    pub async fn update_request_status_from_error(
        &self,
        request_id: i64,
        error: &GatewayError,
    ) -> GatewayResult<()> {
        let new_status = if error.is_canceled() {
            status::CANCELED
        } else {
            status::FAILED
        };
        let active = entities::requests::ActiveModel {
            id: ActiveValue::Unchanged(request_id),
            status: ActiveValue::Set(new_status.to_string()),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        self.storage.update_request(active).await.map_err(Self::map_db)
    }

    pub async fn update_execution_status_from_error(
        &self,
        execution_id: i64,
        error: &GatewayError,
    ) -> GatewayResult<()> {
        let new_status = if error.is_canceled() {
            status::CANCELED
        } else {
            status::FAILED
        };
        let active = entities::request_executions::ActiveModel {
            id: ActiveValue::Unchanged(execution_id),
            status: ActiveValue::Set(new_status.to_string()),
            error_message: ActiveValue::Set(Some(error.to_string())),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        self.storage
            .update_execution(active)
            .await
            .map_err(Self::map_db)
    }

    /// Write the chunk sequence once at end of stream. The literal `[DONE]`
    /// marker is never persisted.
    pub async fn save_request_chunks(
        &self,
        request: &entities::requests::Model,
        chunks: &[StoredChunk],
    ) -> GatewayResult<()> {
        if !self.policy.store_chunks {
            return Ok(());
        }
        let kept: Vec<&StoredChunk> = chunks
            .iter()
            .filter(|chunk| !chunk.is_done_marker())
            .collect();
        let chunks_json = serde_json::to_value(&kept)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let inline = self
            .persist_response_blob(
                request.data_storage_id,
                response_chunks_key(request.project_id, request.id),
                &chunks_json,
            )
            .await?;

        let active = entities::requests::ActiveModel {
            id: ActiveValue::Unchanged(request.id),
            response_chunks: ActiveValue::Set(Some(inline)),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        self.storage.update_request(active).await.map_err(Self::map_db)
    }

    pub async fn save_execution_chunks(
        &self,
        request: &entities::requests::Model,
        execution: &entities::request_executions::Model,
        chunks: &[StoredChunk],
    ) -> GatewayResult<()> {
        if !self.policy.store_chunks {
            return Ok(());
        }
        let kept: Vec<&StoredChunk> = chunks
            .iter()
            .filter(|chunk| !chunk.is_done_marker())
            .collect();
        let chunks_json = serde_json::to_value(&kept)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let inline = self
            .persist_response_blob(
                execution.data_storage_id,
                execution_key(request.project_id, request.id, execution.id, "response_chunks"),
                &chunks_json,
            )
            .await?;
        let active = entities::request_executions::ActiveModel {
            id: ActiveValue::Unchanged(execution.id),
            response_chunks: ActiveValue::Set(Some(inline)),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        self.storage
            .update_execution(active)
            .await
            .map_err(Self::map_db)
    }

    /// Write a response-side blob to the row's storage. Returns what should
    /// land inline in the row (the payload, or a placeholder when external
    /// or policied off).
    async fn persist_response_blob(
        &self,
        data_storage_id: i64,
        key: String,
        payload: &serde_json::Value,
    ) -> GatewayResult<serde_json::Value> {
        if !self.policy.store_response_body {
            return Ok(serde_json::Value::Null);
        }
        if data_storage_id == 0 {
            return Ok(payload.clone());
        }
        let row = self
            .storage
            .find_data_storage(data_storage_id)
            .await
            .map_err(Self::map_db)?
            .ok_or_else(|| {
                GatewayError::InternalStorage(format!(
                    "data storage {data_storage_id} disappeared"
                ))
            })?;
        let bytes = serde_json::to_vec(payload)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        self.objects.save_data(&row, &key, &bytes).await?;
        Ok(serde_json::json!({}))
    }

    // ---- loads ----

    pub async fn load_request_body(
        &self,
        request: &entities::requests::Model,
    ) -> GatewayResult<serde_json::Value> {
        self.load_blob(
            request.data_storage_id,
            request_body_key(request.project_id, request.id),
            Some(&request.request_body),
        )
        .await
    }

    pub async fn load_response_body(
        &self,
        request: &entities::requests::Model,
    ) -> GatewayResult<serde_json::Value> {
        self.load_blob(
            request.data_storage_id,
            response_body_key(request.project_id, request.id),
            request.response_body.as_ref(),
        )
        .await
    }

    pub async fn load_response_chunks(
        &self,
        request: &entities::requests::Model,
    ) -> GatewayResult<Vec<StoredChunk>> {
        let value = self
            .load_blob(
                request.data_storage_id,
                response_chunks_key(request.project_id, request.id),
                request.response_chunks.as_ref(),
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))
    }

    /// Prefer external storage when the row points at one; fall back to the
    /// in-row value on miss. The payload must parse as JSON either way.
    async fn load_blob(
        &self,
        data_storage_id: i64,
        key: String,
        inline: Option<&serde_json::Value>,
    ) -> GatewayResult<serde_json::Value> {
        if data_storage_id != 0
            && let Ok(Some(row)) = self.storage.find_data_storage(data_storage_id).await
        {
            match self.objects.load_data(&row, &key).await {
                Ok(bytes) => {
                    return serde_json::from_slice(&bytes)
                        .map_err(|err| GatewayError::InternalStorage(err.to_string()));
                }
                Err(error) => {
                    tracing::debug!(%error, key, "external blob miss; using in-row value");
                }
            }
        }
        inline
            .cloned()
            .filter(|value| !value.is_null())
            .ok_or_else(|| GatewayError::InternalStorage(format!("missing body for {key}")))
    }

    // ---- sticky routing ----

    /// Channel of the last completed request in the trace, cached for one
    /// minute (five seconds for negative answers).
    pub async fn last_successful_channel_id(&self, trace_id: i64) -> Option<i64> {
        let now = Instant::now();
        {
            let sticky = self.sticky.lock().expect("sticky cache lock poisoned");
            if let Some(entry) = sticky.get(&trace_id)
                && entry.expires_at > now
            {
                return entry.channel_id;
            }
        }

        let channel_id = match self.storage.last_successful_channel(trace_id).await {
            Ok(found) => found,
            Err(error) => {
                tracing::debug!(%error, trace_id, "sticky channel lookup failed");
                None
            }
        };
        let ttl = if channel_id.is_some() {
            STICKY_POSITIVE_TTL
        } else {
            STICKY_NEGATIVE_TTL
        };
        self.sticky
            .lock()
            .expect("sticky cache lock poisoned")
            .insert(
                trace_id,
                StickyEntry {
                    channel_id,
                    expires_at: now + ttl,
                },
            );
        channel_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_grammar_is_bit_exact() {
        assert_eq!(
            request_body_key(42, 7),
            "/42/requests/7/request_body.json"
        );
        assert_eq!(
            response_body_key(42, 7),
            "/42/requests/7/response_body.json"
        );
        assert_eq!(
            response_chunks_key(42, 7),
            "/42/requests/7/response_chunks.json"
        );
        assert_eq!(
            execution_key(42, 7, 9, "response_chunks"),
            "/42/requests/7/executions/9/response_chunks.json"
        );
    }

    #[test]
    fn done_marker_chunks_are_detected() {
        let done = StoredChunk {
            last_event_id: None,
            event: None,
            data: "[DONE]".to_string(),
        };
        assert!(done.is_done_marker());
        let normal = StoredChunk {
            last_event_id: Some("1".to_string()),
            event: Some("content_block_delta".to_string()),
            data: "{}".to_string(),
        };
        assert!(!normal.is_done_marker());
        let json = serde_json::to_value(&normal).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "last_event_id": "1",
                "event": "content_block_delta",
                "data": "{}"
            })
        );
    }
}
