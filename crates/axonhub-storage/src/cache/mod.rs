use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use axonhub_common::GatewayResult;

pub mod api_keys;
pub mod notifier;

pub use api_keys::{ApiKeyCache, ApiKeyLoader, CachedApiKey, api_key_cache_key};
pub use notifier::{API_KEY_CHANNEL, CacheEvent, CacheNotifier, ProcessNotifier, RedisNotifier};

#[derive(Debug, Clone, Copy)]
pub struct LiveCacheConfig {
    pub ttl: Duration,
    pub refresh_interval: Duration,
    pub debounce: Duration,
}

impl Default for LiveCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(500),
        }
    }
}

/// Context for single-entry loads. The raw secret rides here; it is never
/// stored in the cache and never used as a cache key.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    pub raw_secret: Option<String>,
}

/// Backing loads the cache invokes.
#[async_trait]
pub trait CacheLoader<V>: Send + Sync {
    /// Load one entry. `None` means absent or soft-deleted.
    async fn load_one(&self, cache_key: &str, ctx: &LoadContext) -> GatewayResult<Option<V>>;

    /// Incremental refresh: entries updated after `since` (soft-deleted rows
    /// map to `None` so the cache evicts them) plus the new high-water mark.
    async fn load_since(
        &self,
        since: OffsetDateTime,
    ) -> GatewayResult<(Vec<(String, Option<V>)>, OffsetDateTime)>;
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Process-local typed read cache with TTL, periodic bulk refresh, per-key
/// debounced reload, and notifier-driven invalidation.
pub struct LiveCache<V> {
    loader: Arc<dyn CacheLoader<V>>,
    config: LiveCacheConfig,
    entries: RwLock<HashMap<String, Entry<V>>>,
    reload_stamps: Mutex<HashMap<String, Instant>>,
    high_water: Mutex<OffsetDateTime>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<V> LiveCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(loader: Arc<dyn CacheLoader<V>>, config: LiveCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            loader,
            config,
            entries: RwLock::new(HashMap::new()),
            reload_stamps: Mutex::new(HashMap::new()),
            high_water: Mutex::new(OffsetDateTime::UNIX_EPOCH),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the periodic refresher and, when given, the invalidation
    /// subscriber. Tests drive `refresh`/`invalidate` directly instead.
    pub fn start(self: &Arc<Self>, notifier: Option<Arc<dyn CacheNotifier>>) {
        let mut workers = self.workers.lock().expect("cache worker lock poisoned");

        let refresher = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresher.config.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(error) = refresher.refresh().await {
                    tracing::warn!(%error, "cache refresh failed");
                }
            }
        }));

        if let Some(notifier) = notifier {
            let subscriber = Arc::clone(self);
            let mut rx = notifier.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.is_invalidation() => {
                            subscriber.invalidate(&event.keys);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!(missed, "cache invalidations lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
    }

    pub fn stop(&self) {
        for handle in self
            .workers
            .lock()
            .expect("cache worker lock poisoned")
            .drain(..)
        {
            handle.abort();
        }
    }

    pub async fn get(&self, cache_key: &str, ctx: &LoadContext) -> GatewayResult<Option<V>> {
        let now = Instant::now();
        let stale = {
            let entries = self.entries.read().expect("cache entries lock poisoned");
            match entries.get(cache_key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(entry) => Some(entry.value.clone()),
                None => None,
            }
        };

        // Debounce: a reload for this key within the window means someone
        // just refreshed (or is refreshing) it; serve what we have.
        {
            let mut stamps = self
                .reload_stamps
                .lock()
                .expect("cache stamp lock poisoned");
            if let Some(last) = stamps.get(cache_key)
                && now.duration_since(*last) < self.config.debounce
            {
                return Ok(stale);
            }
            stamps.insert(cache_key.to_string(), now);
        }

        let loaded = self.loader.load_one(cache_key, ctx).await?;
        let mut entries = self.entries.write().expect("cache entries lock poisoned");
        match &loaded {
            Some(value) => {
                entries.insert(
                    cache_key.to_string(),
                    Entry {
                        value: value.clone(),
                        expires_at: now + self.config.ttl,
                    },
                );
            }
            None => {
                entries.remove(cache_key);
            }
        }
        Ok(loaded)
    }

    pub fn invalidate(&self, keys: &[String]) {
        let mut entries = self.entries.write().expect("cache entries lock poisoned");
        for key in keys {
            entries.remove(key);
        }
    }

    /// Bulk refresh from the high-water mark.
    pub async fn refresh(&self) -> GatewayResult<()> {
        let since = *self.high_water.lock().expect("high water lock poisoned");
        let (rows, new_high_water) = self.loader.load_since(since).await?;
        let now = Instant::now();
        let mut entries = self.entries.write().expect("cache entries lock poisoned");
        for (key, value) in rows {
            match value {
                Some(value) => {
                    entries.insert(
                        key,
                        Entry {
                            value,
                            expires_at: now + self.config.ttl,
                        },
                    );
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        drop(entries);
        *self.high_water.lock().expect("high water lock poisoned") = new_high_water;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("cache entries lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
