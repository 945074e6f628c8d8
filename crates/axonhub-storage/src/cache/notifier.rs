use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use axonhub_common::{GatewayError, GatewayResult};

/// Pub/sub channel carrying API-key invalidations between nodes.
pub const API_KEY_CHANNEL: &str = "axonhub:cache:api_keys";

const NOTIFY_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub kind: String,
    pub keys: Vec<String>,
}

impl CacheEvent {
    pub fn invalidate_keys(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind: "invalidate_keys".to_string(),
            keys: keys.into_iter().collect(),
        }
    }

    pub fn is_invalidation(&self) -> bool {
        self.kind == "invalidate_keys"
    }
}

/// Fan-out of cache events. Delivery is fire-and-forget; the periodic
/// refresh heals missed events.
#[async_trait]
pub trait CacheNotifier: Send + Sync {
    async fn publish(&self, event: CacheEvent) -> GatewayResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<CacheEvent>;
}

/// In-process notifier for single-node (memory cache) deployments.
pub struct ProcessNotifier {
    tx: broadcast::Sender<CacheEvent>,
}

impl Default for ProcessNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_BUFFER);
        Self { tx }
    }
}

#[async_trait]
impl CacheNotifier for ProcessNotifier {
    async fn publish(&self, event: CacheEvent) -> GatewayResult<()> {
        // No receivers is fine: nothing to invalidate yet.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}

/// Redis pub/sub notifier for multi-node deployments.
pub struct RedisNotifier {
    manager: redis::aio::ConnectionManager,
    channel: String,
    tx: broadcast::Sender<CacheEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RedisNotifier {
    pub async fn connect(url: &str, channel: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let (tx, _) = broadcast::channel(NOTIFY_BUFFER);

        let subscriber_tx = tx.clone();
        let subscribe_channel = channel.to_string();
        let worker = tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(error) => {
                        tracing::warn!(%error, "cache notifier subscribe failed; retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if let Err(error) = pubsub.subscribe(&subscribe_channel).await {
                    tracing::warn!(%error, "cache notifier subscribe failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    match serde_json::from_str::<CacheEvent>(&payload) {
                        Ok(event) => {
                            if subscriber_tx.send(event).is_err() {
                                // Dropped, never fatal; the periodic refresh
                                // brings subscribers back in sync.
                                tracing::debug!("cache event dropped: no subscribers");
                            }
                        }
                        Err(error) => {
                            tracing::debug!(%error, "ignoring malformed cache event");
                        }
                    }
                }
                tracing::warn!("cache notifier connection lost; resubscribing");
            }
        });

        Ok(Self {
            manager,
            channel: channel.to_string(),
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .worker
            .lock()
            .expect("notifier worker lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl CacheNotifier for RedisNotifier {
    async fn publish(&self, event: CacheEvent) -> GatewayResult<()> {
        let payload = serde_json::to_string(&event)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let mut connection = self.manager.clone();
        let _: () = connection
            .publish(&self.channel, payload)
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_notifier_fans_out() {
        let notifier = ProcessNotifier::new();
        let mut rx = notifier.subscribe();
        notifier
            .publish(CacheEvent::invalidate_keys(["api_key:1".to_string()]))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(event.is_invalidation());
        assert_eq!(event.keys, vec!["api_key:1".to_string()]);
    }

    #[test]
    fn event_wire_shape_is_stable() {
        let event = CacheEvent::invalidate_keys(["api_key:42".to_string()]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "invalidate_keys", "keys": ["api_key:42"]})
        );
    }
}
