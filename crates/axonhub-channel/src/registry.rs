use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use axonhub_common::GatewayError;

use crate::channel::{Channel, ChannelStatus, ModelError};

/// Persistence hooks the hot registry needs from the storage layer.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn load_enabled(&self) -> Result<Vec<Channel>, GatewayError>;

    /// Flip a channel to disabled with an operator-visible reason.
    async fn disable_channel(&self, channel_id: i64, reason: &str) -> Result<(), GatewayError>;
}

/// A registry entry: the channel plus its channel-local resolution memo.
pub struct ChannelRuntime {
    pub channel: Channel,
    resolved: Mutex<HashMap<String, Option<String>>>,
}

impl ChannelRuntime {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> i64 {
        self.channel.id
    }

    /// Memoized model resolution; the memo dies with the snapshot on reload.
    pub fn choose_model(&self, requested: &str) -> Result<String, ModelError> {
        if let Some(cached) = self
            .resolved
            .lock()
            .expect("resolution memo lock poisoned")
            .get(requested)
        {
            return cached.clone().ok_or(ModelError);
        }
        let outcome = self.channel.choose_model(requested);
        self.resolved
            .lock()
            .expect("resolution memo lock poisoned")
            .insert(requested.to_string(), outcome.clone().ok());
        outcome
    }

    pub fn is_model_supported(&self, requested: &str) -> bool {
        self.choose_model(requested).is_ok()
    }
}

/// Immutable view of the enabled channel set.
#[derive(Default)]
pub struct ChannelSnapshot {
    channels: HashMap<i64, Arc<ChannelRuntime>>,
}

impl ChannelSnapshot {
    pub fn new(channels: Vec<Channel>) -> Self {
        let channels = channels
            .into_iter()
            .filter(|channel| channel.status == ChannelStatus::Enabled)
            .map(|channel| (channel.id, Arc::new(ChannelRuntime::new(channel))))
            .collect();
        Self { channels }
    }

    pub fn get(&self, channel_id: i64) -> Option<Arc<ChannelRuntime>> {
        self.channels.get(&channel_id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChannelRuntime>> {
        self.channels.values()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.channels.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Hot in-memory registry of enabled channels.
///
/// Readers take the current snapshot without blocking; reloads publish a
/// fresh snapshot. Concurrent reload triggers coalesce into one pass.
pub struct ChannelRegistry {
    snapshot: ArcSwap<ChannelSnapshot>,
    source: Arc<dyn ChannelSource>,
    reload_tx: mpsc::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelRegistry {
    /// Load the initial snapshot and start the reload worker.
    pub async fn start(source: Arc<dyn ChannelSource>) -> Result<Arc<Self>, GatewayError> {
        let initial = source.load_enabled().await?;
        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
        let registry = Arc::new(Self {
            snapshot: ArcSwap::new(Arc::new(ChannelSnapshot::new(initial))),
            source,
            reload_tx,
            worker: Mutex::new(None),
        });

        let worker_registry = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                if let Err(error) = worker_registry.reload().await {
                    tracing::error!(%error, "channel registry reload failed");
                }
            }
        });
        *registry.worker.lock().expect("registry worker lock poisoned") = Some(handle);
        Ok(registry)
    }

    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.load_full()
    }

    /// Queue an asynchronous reload. A trigger arriving while one is queued
    /// is absorbed; the pending pass reads the freshest rows anyway.
    pub fn trigger_reload(&self) {
        let _ = self.reload_tx.try_send(());
    }

    pub async fn reload(&self) -> Result<(), GatewayError> {
        let channels = self.source.load_enabled().await?;
        self.snapshot.store(Arc::new(ChannelSnapshot::new(channels)));
        Ok(())
    }

    /// Persist a disable and schedule the snapshot refresh.
    pub async fn disable_channel(&self, channel_id: i64, reason: &str) -> Result<(), GatewayError> {
        self.source.disable_channel(channel_id, reason).await?;
        self.trigger_reload();
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .worker
            .lock()
            .expect("registry worker lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelCredentials, ChannelSettings, ChannelType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channel(id: i64, status: ChannelStatus) -> Channel {
        Channel {
            id,
            name: format!("ch-{id}"),
            channel_type: ChannelType::OpenAiCompatible,
            status,
            base_url: "https://api.example.com/v1".to_string(),
            credentials: ChannelCredentials::default(),
            supported_models: vec!["gpt-4o".to_string()],
            settings: ChannelSettings::default(),
        }
    }

    struct StaticSource {
        loads: AtomicUsize,
        disabled: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl ChannelSource for StaticSource {
        async fn load_enabled(&self) -> Result<Vec<Channel>, GatewayError> {
            let disabled = self.disabled.lock().unwrap().clone();
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok([1, 2]
                .into_iter()
                .filter(|id| !disabled.contains(id))
                .map(|id| channel(id, ChannelStatus::Enabled))
                .collect())
        }

        async fn disable_channel(&self, channel_id: i64, _reason: &str) -> Result<(), GatewayError> {
            self.disabled.lock().unwrap().push(channel_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn snapshot_excludes_non_enabled_rows() {
        let snapshot = ChannelSnapshot::new(vec![
            channel(1, ChannelStatus::Enabled),
            channel(2, ChannelStatus::Disabled),
            channel(3, ChannelStatus::Archived),
        ]);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(1).is_some());
    }

    #[tokio::test]
    async fn disable_updates_the_next_snapshot() {
        let source = Arc::new(StaticSource {
            loads: AtomicUsize::new(0),
            disabled: Mutex::new(Vec::new()),
        });
        let registry = ChannelRegistry::start(source).await.unwrap();
        assert_eq!(registry.snapshot().len(), 2);
        registry.disable_channel(1, "test").await.unwrap();
        registry.reload().await.unwrap();
        assert!(registry.snapshot().get(1).is_none());
        registry.stop();
    }

    #[test]
    fn resolution_memo_matches_uncached_result() {
        let runtime = ChannelRuntime::new(channel(1, ChannelStatus::Enabled));
        assert_eq!(runtime.choose_model("gpt-4o").unwrap(), "gpt-4o");
        // Second hit answers from the memo.
        assert_eq!(runtime.choose_model("gpt-4o").unwrap(), "gpt-4o");
        assert!(runtime.choose_model("missing").is_err());
        assert!(runtime.choose_model("missing").is_err());
    }
}
