use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use axonhub_common::{GatewayError, GatewayResult};

use crate::entities::data_storages::{self, storage_type};
use crate::store::GatewayStorage;

pub mod fs;
pub mod gcs;
pub mod s3;

pub use fs::FsStore;
pub use gcs::GcsStore;
pub use s3::S3Store;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// One external blob backend. `database` rows have no store; their blobs
/// live in the entity row itself.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(&self, key: &str, data: &[u8]) -> GatewayResult<String>;
    async fn load(&self, key: &str) -> GatewayResult<Vec<u8>>;
    /// Idempotent: deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> GatewayResult<()>;
}

/// Pool of ready blob-store handles, one per active data-storage row.
///
/// A minute ticker re-reads the newest `updated_at` and only rebuilds when
/// it advanced; `invalidate` evicts one handle for on-demand rebuild.
pub struct DataStorageManager {
    storage: GatewayStorage,
    handles: RwLock<HashMap<i64, Arc<dyn BlobStore>>>,
    newest: Mutex<Option<OffsetDateTime>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DataStorageManager {
    pub async fn start(storage: GatewayStorage) -> GatewayResult<Arc<Self>> {
        let manager = Arc::new(Self {
            storage,
            handles: RwLock::new(HashMap::new()),
            newest: Mutex::new(None),
            worker: Mutex::new(None),
        });
        manager.rebuild().await?;

        let ticker = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(error) = ticker.refresh_if_changed().await {
                    tracing::warn!(%error, "data storage refresh failed");
                }
            }
        });
        *manager.worker.lock().expect("storage worker lock poisoned") = Some(handle);
        Ok(manager)
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .worker
            .lock()
            .expect("storage worker lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    async fn refresh_if_changed(&self) -> GatewayResult<()> {
        let newest = self
            .storage
            .newest_data_storage_update()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let changed = {
            let guard = self.newest.lock().expect("newest lock poisoned");
            newest > *guard
        };
        if changed {
            self.rebuild().await?;
        }
        Ok(())
    }

    async fn rebuild(&self) -> GatewayResult<()> {
        let rows = self
            .storage
            .list_active_data_storages()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let mut handles: HashMap<i64, Arc<dyn BlobStore>> = HashMap::new();
        let mut newest: Option<OffsetDateTime> = None;
        for row in rows {
            newest = newest.max(Some(row.updated_at));
            match build_store(&row) {
                Ok(Some(store)) => {
                    handles.insert(row.id, store);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(data_storage_id = row.id, %error, "skipping blob backend");
                }
            }
        }
        *self.handles.write().expect("handle map lock poisoned") = handles;
        *self.newest.lock().expect("newest lock poisoned") = newest;
        Ok(())
    }

    pub fn invalidate(&self, data_storage_id: i64) {
        self.handles
            .write()
            .expect("handle map lock poisoned")
            .remove(&data_storage_id);
    }

    /// Ready handle for one row; falls back to an on-demand build and
    /// caches it.
    pub fn store_for(
        &self,
        row: &data_storages::Model,
    ) -> GatewayResult<Option<Arc<dyn BlobStore>>> {
        if row.storage_type == storage_type::DATABASE {
            return Ok(None);
        }
        if let Some(store) = self
            .handles
            .read()
            .expect("handle map lock poisoned")
            .get(&row.id)
        {
            return Ok(Some(Arc::clone(store)));
        }
        let store = build_store(row)?.ok_or_else(|| {
            GatewayError::InternalStorage(format!(
                "data storage {} has no blob backend",
                row.id
            ))
        })?;
        self.handles
            .write()
            .expect("handle map lock poisoned")
            .insert(row.id, Arc::clone(&store));
        Ok(Some(store))
    }

    pub async fn save_data(
        &self,
        row: &data_storages::Model,
        key: &str,
        data: &[u8],
    ) -> GatewayResult<String> {
        match self.store_for(row)? {
            Some(store) => store.save(key, data).await,
            None => Ok(key.to_string()),
        }
    }

    pub async fn load_data(&self, row: &data_storages::Model, key: &str) -> GatewayResult<Vec<u8>> {
        match self.store_for(row)? {
            Some(store) => store.load(key).await,
            None => Err(GatewayError::InternalStorage(
                "database storage keeps blobs in-row".to_string(),
            )),
        }
    }

    pub async fn delete_data(&self, row: &data_storages::Model, key: &str) -> GatewayResult<()> {
        match self.store_for(row)? {
            Some(store) => store.delete(key).await,
            None => Ok(()),
        }
    }
}

fn build_store(row: &data_storages::Model) -> GatewayResult<Option<Arc<dyn BlobStore>>> {
    match row.storage_type.as_str() {
        storage_type::DATABASE => Ok(None),
        storage_type::FS => Ok(Some(Arc::new(FsStore::from_settings(&row.settings)?))),
        storage_type::S3 => Ok(Some(Arc::new(S3Store::from_settings(&row.settings)?))),
        storage_type::GCS => Ok(Some(Arc::new(GcsStore::from_settings(&row.settings)?))),
        other => Err(GatewayError::InternalStorage(format!(
            "unknown data storage type: {other}"
        ))),
    }
}

const SENSITIVE_SETTINGS: &[&str] = &["access_key_id", "secret_access_key", "credentials_json"];

/// Overlay `incoming` settings over `existing`. Sensitive fields left empty
/// keep their prior value; everything else present in the input overwrites.
pub fn merge_storage_settings(
    existing: &serde_json::Value,
    incoming: serde_json::Value,
) -> serde_json::Value {
    let mut merged = existing.clone();
    let serde_json::Value::Object(incoming_map) = incoming else {
        return merged;
    };
    let Some(merged_map) = merged.as_object_mut() else {
        return merged;
    };
    for (key, value) in incoming_map {
        let empty_sensitive = SENSITIVE_SETTINGS.contains(&key.as_str())
            && value.as_str().is_some_and(str::is_empty);
        if empty_sensitive {
            continue;
        }
        merged_map.insert(key, value);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_sensitive_fields_preserve_prior_values() {
        let existing = json!({
            "region": "us-east-1",
            "bucket": "old",
            "access_key_id": "AKIA1",
            "secret_access_key": "s3cr3t"
        });
        let merged = merge_storage_settings(
            &existing,
            json!({
                "bucket": "new",
                "access_key_id": "",
                "secret_access_key": ""
            }),
        );
        assert_eq!(merged["bucket"], "new");
        assert_eq!(merged["access_key_id"], "AKIA1");
        assert_eq!(merged["secret_access_key"], "s3cr3t");
    }

    #[test]
    fn non_empty_sensitive_fields_overwrite() {
        let existing = json!({"credentials_json": "old"});
        let merged = merge_storage_settings(&existing, json!({"credentials_json": "new"}));
        assert_eq!(merged["credentials_json"], "new");
    }
}
