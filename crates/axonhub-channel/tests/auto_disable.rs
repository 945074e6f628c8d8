use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use axonhub_channel::channel::{
    Channel, ChannelCredentials, ChannelSettings, ChannelStatus, ChannelType,
};
use axonhub_channel::{
    AutoDisablePolicy, ChannelRegistry, ChannelSource, ErrorCounters, LoadBalancer, MetricsHub,
    PerformanceRecord, PerformanceRecorder, StatusRule,
};
use axonhub_common::GatewayError;

fn channel(id: i64) -> Channel {
    Channel {
        id,
        name: format!("ch-{id}"),
        channel_type: ChannelType::OpenAiCompatible,
        status: ChannelStatus::Enabled,
        base_url: "https://api.example.com/v1".to_string(),
        credentials: ChannelCredentials::default(),
        supported_models: vec!["gpt-4o".to_string()],
        settings: ChannelSettings::default(),
    }
}

struct DisablingSource {
    disabled: Mutex<Vec<i64>>,
}

#[async_trait]
impl ChannelSource for DisablingSource {
    async fn load_enabled(&self) -> Result<Vec<Channel>, GatewayError> {
        let disabled = self.disabled.lock().unwrap().clone();
        Ok([1, 2]
            .into_iter()
            .filter(|id| !disabled.contains(id))
            .map(channel)
            .collect())
    }

    async fn disable_channel(&self, channel_id: i64, reason: &str) -> Result<(), GatewayError> {
        assert!(reason.contains("401"));
        self.disabled.lock().unwrap().push(channel_id);
        Ok(())
    }
}

fn auth_failure(channel_id: i64, end_ms: i64) -> PerformanceRecord {
    PerformanceRecord {
        channel_id,
        start_time_ms: end_ms - 100,
        end_time_ms: end_ms,
        first_token_time_ms: None,
        stream: false,
        success: false,
        canceled: false,
        token_count: 0,
        error_status_code: Some(401),
        api_key_id: None,
    }
}

#[tokio::test]
async fn repeated_auth_failures_disable_the_channel() {
    let source = Arc::new(DisablingSource {
        disabled: Mutex::new(Vec::new()),
    });
    let registry = ChannelRegistry::start(Arc::clone(&source) as Arc<dyn ChannelSource>)
        .await
        .unwrap();
    let metrics = Arc::new(MetricsHub::default());
    let counters = Arc::new(ErrorCounters::new());
    let policy = AutoDisablePolicy {
        statuses: vec![StatusRule {
            status: 401,
            times: 3,
        }],
    };
    let (sender, recorder) = PerformanceRecorder::start(
        Arc::clone(&metrics),
        counters,
        policy,
        Arc::clone(&registry),
    );
    let balancer = LoadBalancer::new(Arc::clone(&registry), metrics);

    for n in 0..3i64 {
        sender.send(auth_failure(1, 1_000 + n));
    }
    // Recorder drains asynchronously; give it and the reload worker a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(registry.snapshot().get(1).is_none());
    let picked = balancer.pick("gpt-4o", &[], 10_000).unwrap();
    assert_eq!(picked.channel_id(), 2);

    recorder.stop();
    registry.stop();
}

#[tokio::test]
async fn success_resets_the_disable_budget() {
    let source = Arc::new(DisablingSource {
        disabled: Mutex::new(Vec::new()),
    });
    let registry = ChannelRegistry::start(Arc::clone(&source) as Arc<dyn ChannelSource>)
        .await
        .unwrap();
    let metrics = Arc::new(MetricsHub::default());
    let counters = Arc::new(ErrorCounters::new());
    let policy = AutoDisablePolicy {
        statuses: vec![StatusRule {
            status: 401,
            times: 3,
        }],
    };
    let (sender, recorder) = PerformanceRecorder::start(
        Arc::clone(&metrics),
        counters,
        policy,
        Arc::clone(&registry),
    );

    sender.send(auth_failure(1, 1_000));
    sender.send(auth_failure(1, 1_001));
    sender.send(PerformanceRecord {
        success: true,
        error_status_code: None,
        ..auth_failure(1, 1_002)
    });
    sender.send(auth_failure(1, 1_003));
    sender.send(auth_failure(1, 1_004));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(registry.snapshot().get(1).is_some());

    recorder.stop();
    registry.stop();
}
