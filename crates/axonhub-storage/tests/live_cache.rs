use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use axonhub_common::GatewayResult;
use axonhub_storage::{
    CacheEvent, CacheLoader, CacheNotifier, LiveCache, LiveCacheConfig, LoadContext,
    ProcessNotifier,
};

#[derive(Clone, Debug, PartialEq)]
struct Row {
    value: String,
    updated_at: OffsetDateTime,
}

/// In-memory stand-in for the api_keys table.
struct TableLoader {
    rows: Mutex<HashMap<String, Option<Row>>>,
    load_one_calls: Mutex<u32>,
}

impl TableLoader {
    fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            load_one_calls: Mutex::new(0),
        }
    }

    fn put(&self, key: &str, value: &str, updated_at: OffsetDateTime) {
        self.rows.lock().unwrap().insert(
            key.to_string(),
            Some(Row {
                value: value.to_string(),
                updated_at,
            }),
        );
    }

    fn soft_delete(&self, key: &str) {
        self.rows.lock().unwrap().insert(key.to_string(), None);
    }

    fn load_one_calls(&self) -> u32 {
        *self.load_one_calls.lock().unwrap()
    }
}

#[async_trait]
impl CacheLoader<String> for TableLoader {
    async fn load_one(&self, cache_key: &str, _ctx: &LoadContext) -> GatewayResult<Option<String>> {
        *self.load_one_calls.lock().unwrap() += 1;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(cache_key)
            .and_then(|row| row.as_ref())
            .map(|row| row.value.clone()))
    }

    async fn load_since(
        &self,
        since: OffsetDateTime,
    ) -> GatewayResult<(Vec<(String, Option<String>)>, OffsetDateTime)> {
        let rows = self.rows.lock().unwrap();
        let mut high_water = since;
        let mut out = Vec::new();
        for (key, row) in rows.iter() {
            match row {
                Some(row) if row.updated_at > since => {
                    high_water = high_water.max(row.updated_at);
                    out.push((key.clone(), Some(row.value.clone())));
                }
                // Soft-deleted rows always surface so caches evict them.
                None => out.push((key.clone(), None)),
                _ => {}
            }
        }
        Ok((out, high_water))
    }
}

fn config() -> LiveCacheConfig {
    LiveCacheConfig {
        ttl: Duration::from_secs(60),
        refresh_interval: Duration::from_secs(30),
        debounce: Duration::from_millis(500),
    }
}

#[tokio::test]
async fn hit_serves_without_reloading() {
    let loader = Arc::new(TableLoader::new());
    loader.put("api_key:1", "alpha", OffsetDateTime::UNIX_EPOCH);
    let cache = LiveCache::new(loader.clone(), config());

    let ctx = LoadContext::default();
    assert_eq!(
        cache.get("api_key:1", &ctx).await.unwrap().as_deref(),
        Some("alpha")
    );
    assert_eq!(
        cache.get("api_key:1", &ctx).await.unwrap().as_deref(),
        Some("alpha")
    );
    assert_eq!(loader.load_one_calls(), 1);
}

#[tokio::test]
async fn miss_within_debounce_window_is_not_retried() {
    let loader = Arc::new(TableLoader::new());
    let cache = LiveCache::new(loader.clone(), config());

    let ctx = LoadContext::default();
    assert!(cache.get("api_key:1", &ctx).await.unwrap().is_none());
    // Row appears immediately after, but the debounce window still absorbs
    // the follow-up lookup.
    loader.put("api_key:1", "alpha", OffsetDateTime::UNIX_EPOCH);
    assert!(cache.get("api_key:1", &ctx).await.unwrap().is_none());
    assert_eq!(loader.load_one_calls(), 1);
}

#[tokio::test]
async fn invalidation_forces_database_truth() {
    let loader = Arc::new(TableLoader::new());
    loader.put("api_key:1", "alpha", OffsetDateTime::UNIX_EPOCH);
    let cache = LiveCache::new(loader.clone(), config());
    let notifier: Arc<dyn CacheNotifier> = Arc::new(ProcessNotifier::new());
    cache.start(Some(Arc::clone(&notifier)));

    let ctx = LoadContext::default();
    assert_eq!(
        cache.get("api_key:1", &ctx).await.unwrap().as_deref(),
        Some("alpha")
    );

    loader.put("api_key:1", "beta", OffsetDateTime::UNIX_EPOCH);
    notifier
        .publish(CacheEvent::invalidate_keys(["api_key:1".to_string()]))
        .await
        .unwrap();
    // Give the subscriber task a beat, then wait out the debounce window so
    // the next get reloads instead of serving the stale value.
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(
        cache.get("api_key:1", &ctx).await.unwrap().as_deref(),
        Some("beta")
    );
    cache.stop();
}

#[tokio::test]
async fn refresh_applies_updates_and_evictions() {
    let loader = Arc::new(TableLoader::new());
    let now = OffsetDateTime::now_utc();
    loader.put("api_key:1", "alpha", now);
    loader.put("api_key:2", "bravo", now);
    let cache = LiveCache::new(loader.clone(), config());

    cache.refresh().await.unwrap();
    assert_eq!(cache.len(), 2);

    loader.soft_delete("api_key:2");
    cache.refresh().await.unwrap();
    assert_eq!(cache.len(), 1);
    let ctx = LoadContext::default();
    // The evicted key misses; the surviving key still answers from cache.
    assert_eq!(
        cache.get("api_key:1", &ctx).await.unwrap().as_deref(),
        Some("alpha")
    );
}
