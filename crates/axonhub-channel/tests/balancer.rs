use std::sync::Arc;

use async_trait::async_trait;

use axonhub_channel::channel::{
    Channel, ChannelCredentials, ChannelSettings, ChannelStatus, ChannelType,
};
use axonhub_channel::{ChannelRegistry, ChannelSource, LoadBalancer, MetricsHub};
use axonhub_common::GatewayError;

fn channel(id: i64, priority: i32) -> Channel {
    Channel {
        id,
        name: format!("ch-{id}"),
        channel_type: ChannelType::OpenAiCompatible,
        status: ChannelStatus::Enabled,
        base_url: "https://api.example.com/v1".to_string(),
        credentials: ChannelCredentials::default(),
        supported_models: vec!["gpt-4o".to_string()],
        settings: ChannelSettings {
            priority,
            ..ChannelSettings::default()
        },
    }
}

struct FixedSource(Vec<Channel>);

#[async_trait]
impl ChannelSource for FixedSource {
    async fn load_enabled(&self) -> Result<Vec<Channel>, GatewayError> {
        Ok(self.0.clone())
    }

    async fn disable_channel(&self, _channel_id: i64, _reason: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

async fn balancer(channels: Vec<Channel>) -> (LoadBalancer, Arc<ChannelRegistry>) {
    let registry = ChannelRegistry::start(Arc::new(FixedSource(channels)))
        .await
        .unwrap();
    let metrics = Arc::new(MetricsHub::default());
    (LoadBalancer::new(Arc::clone(&registry), metrics), registry)
}

#[tokio::test]
async fn higher_priority_wins() {
    let (balancer, registry) = balancer(vec![channel(1, 0), channel(2, 10)]).await;
    for _ in 0..4 {
        let picked = balancer.pick("gpt-4o", &[], 1_000).unwrap();
        assert_eq!(picked.channel_id(), 2);
    }
    registry.stop();
}

#[tokio::test]
async fn equal_tier_spreads_by_live_load() {
    let (balancer, registry) = balancer(vec![channel(1, 0), channel(2, 0)]).await;
    let first = balancer.pick("gpt-4o", &[], 1_000).unwrap().channel_id();
    let second = balancer.pick("gpt-4o", &[], 1_001).unwrap().channel_id();
    assert_ne!(first, second);
    registry.stop();
}

#[tokio::test]
async fn cancellation_returns_the_selection_slot() {
    let (balancer, registry) = balancer(vec![channel(1, 0), channel(2, 0)]).await;
    let first = balancer.pick("gpt-4o", &[], 1_000).unwrap();
    let first_id = first.channel_id();
    // The canceled selection is decremented, so the next pick may reuse the
    // same channel instead of being pushed off it by phantom load.
    balancer.metrics().mark_canceled(first_id);
    assert_eq!(balancer.metrics().snapshot(first_id).request_count, 0);
    registry.stop();
}

#[tokio::test]
async fn excluded_channels_are_skipped() {
    let (balancer, registry) = balancer(vec![channel(1, 10), channel(2, 0)]).await;
    let picked = balancer.pick("gpt-4o", &[1], 1_000).unwrap();
    assert_eq!(picked.channel_id(), 2);
    assert!(balancer.pick("gpt-4o", &[1, 2], 1_001).is_none());
    registry.stop();
}

#[tokio::test]
async fn unknown_model_yields_no_candidates() {
    let (balancer, registry) = balancer(vec![channel(1, 0)]).await;
    assert!(balancer.pick("missing-model", &[], 1_000).is_none());
    assert_eq!(balancer.eligible_count("missing-model"), 0);
    assert_eq!(balancer.eligible_count("gpt-4o"), 1);
    registry.stop();
}

#[tokio::test]
async fn sticky_preference_wins_while_eligible() {
    let (balancer, registry) = balancer(vec![channel(1, 0), channel(2, 50)]).await;
    let picked = balancer
        .pick_preferred("gpt-4o", Some(1), &[], 1_000)
        .unwrap();
    assert_eq!(picked.channel_id(), 1);
    // Preference for a channel that no longer exists falls through to the
    // regular ordering.
    let picked = balancer
        .pick_preferred("gpt-4o", Some(99), &[], 1_001)
        .unwrap();
    assert_eq!(picked.channel_id(), 2);
    registry.stop();
}
