use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sea_orm::{ColumnTrait, Database, EntityTrait, QueryFilter};

use axonhub_channel::channel::{
    Channel, ChannelCredentials, ChannelSettings, ChannelStatus, ChannelType,
};
use axonhub_channel::{
    ChannelRegistry, ChannelSource, ErrorCounters, LoadBalancer, MetricsHub, PerformanceRecorder,
    RetryPolicy,
};
use axonhub_common::GatewayError;
use axonhub_core::executor::{ClientReply, ExecutionContext, RequestExecutor};
use axonhub_core::upstream_client::{UpstreamBody, UpstreamClient, UpstreamResponse};
use axonhub_protocol::ApiFormat;
use axonhub_storage::entities;
use axonhub_storage::{DataStorageManager, GatewayStorage, RequestService, StoragePolicy};
use axonhub_transform::{HttpRequestSpec, InboundContext};

fn channel(id: i64, host: &str) -> Channel {
    Channel {
        id,
        name: format!("ch-{id}"),
        channel_type: ChannelType::OpenAiCompatible,
        status: ChannelStatus::Enabled,
        base_url: format!("https://{host}/v1"),
        credentials: ChannelCredentials {
            api_key: "sk-test".to_string(),
            ..ChannelCredentials::default()
        },
        supported_models: vec!["gpt-4o".to_string()],
        settings: ChannelSettings::default(),
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

/// Scripted upstream: answers by host name.
struct ScriptedClient;

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        spec: HttpRequestSpec,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            if spec.url.contains("flaky.example.com") {
                return Ok(UpstreamResponse {
                    status: 503,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(
                        b"{\"error\":{\"message\":\"overloaded\",\"type\":\"api_error\"}}",
                    )),
                });
            }
            if spec.url.contains("denied.example.com") {
                return Ok(UpstreamResponse {
                    status: 401,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(
                        b"{\"error\":{\"message\":\"bad key\",\"type\":\"authentication_error\"}}",
                    )),
                });
            }
            let body = serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            });
            Ok(UpstreamResponse {
                status: 200,
                headers: Vec::new(),
                body: UpstreamBody::Bytes(Bytes::from(serde_json::to_vec(&body).unwrap())),
            })
        })
    }
}

struct Harness {
    executor: RequestExecutor,
    storage: GatewayStorage,
    registry: Arc<ChannelRegistry>,
}

async fn harness(db_name: &str, channels: Vec<Channel>) -> Harness {
    let dsn = format!("sqlite:file:{db_name}?mode=memory&cache=shared");
    let connection = Database::connect(dsn.as_str()).await.unwrap();
    let storage = GatewayStorage::from_connection(connection);
    storage.sync().await.unwrap();

    let registry = ChannelRegistry::start(Arc::new(FixedSource(channels)))
        .await
        .unwrap();
    let metrics = Arc::new(MetricsHub::default());
    let policy = RetryPolicy {
        max_attempts: 3,
        retryable_statuses: [502, 503].into_iter().collect(),
        ..RetryPolicy::default()
    };
    let (perf, _recorder) = PerformanceRecorder::start(
        Arc::clone(&metrics),
        Arc::new(ErrorCounters::new()),
        policy.auto_disable.clone(),
        Arc::clone(&registry),
    );
    let balancer = Arc::new(LoadBalancer::new(Arc::clone(&registry), metrics));
    let objects = DataStorageManager::start(storage.clone()).await.unwrap();
    let requests = Arc::new(RequestService::new(
        storage.clone(),
        objects,
        StoragePolicy::default(),
    ));
    let executor = RequestExecutor::new(
        balancer,
        Arc::new(ScriptedClient),
        requests,
        perf,
        policy,
    );
    Harness {
        executor,
        storage,
        registry,
    }
}

fn chat_body() -> Bytes {
    Bytes::from(
        serde_json::to_vec(&serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap(),
    )
}

fn ctx() -> ExecutionContext {
    ExecutionContext {
        project_id: 42,
        api_key_id: 7,
        trace_id: None,
        format: ApiFormat::OpenAiChatCompletions,
        source: "api".to_string(),
    }
}

#[tokio::test]
async fn failover_keeps_one_request_and_two_executions() {
    // Priority forces the flaky channel to go first.
    let mut flaky = channel(1, "flaky.example.com");
    flaky.settings.priority = 10;
    let healthy = channel(2, "ok.example.com");
    let harness = harness("exec_failover", vec![flaky, healthy]).await;

    let reply = harness
        .executor
        .execute(ctx(), InboundContext::default(), chat_body())
        .await;
    let ClientReply::Unary { status, body } = reply else {
        panic!("expected a unary reply");
    };
    assert_eq!(status, 200);
    let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(decoded["choices"][0]["message"]["content"], "hello");

    let request_rows = entities::Requests::find()
        .all(harness.storage.connection())
        .await
        .unwrap();
    assert_eq!(request_rows.len(), 1);
    assert_eq!(request_rows[0].status, "completed");
    assert_eq!(request_rows[0].channel_id, Some(2));
    assert_eq!(request_rows[0].external_id.as_deref(), Some("chatcmpl-1"));

    // Give the guard's async failure persistence a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let executions = entities::RequestExecutions::find()
        .all(harness.storage.connection())
        .await
        .unwrap();
    assert_eq!(executions.len(), 2);
    let failed = executions.iter().find(|row| row.channel_id == 1).unwrap();
    assert_eq!(failed.status, "failed");
    let completed = executions.iter().find(|row| row.channel_id == 2).unwrap();
    assert_eq!(completed.status, "completed");

    harness.registry.stop();
}

#[tokio::test]
async fn non_retryable_status_surfaces_upstream_error() {
    let mut denied = channel(1, "denied.example.com");
    denied.settings.priority = 10;
    let healthy = channel(2, "ok.example.com");
    let harness = harness("exec_fatal", vec![denied, healthy]).await;

    let reply = harness
        .executor
        .execute(ctx(), InboundContext::default(), chat_body())
        .await;
    let ClientReply::Unary { status, body } = reply else {
        panic!("expected a unary reply");
    };
    // 401 is not in the retryable set; the provider error passes through.
    assert_eq!(status, 401);
    let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(decoded["error"]["type"], "authentication_error");

    let request_rows = entities::Requests::find()
        .filter(entities::requests::Column::Status.eq("failed"))
        .all(harness.storage.connection())
        .await
        .unwrap();
    assert_eq!(request_rows.len(), 1);

    harness.registry.stop();
}

#[tokio::test]
async fn unknown_model_maps_to_invalid_model_error() {
    let harness = harness("exec_nomodel", vec![channel(1, "ok.example.com")]).await;

    let body = Bytes::from(
        serde_json::to_vec(&serde_json::json!({
            "model": "missing-model",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap(),
    );
    let reply = harness
        .executor
        .execute(ctx(), InboundContext::default(), body)
        .await;
    let ClientReply::Unary { status, .. } = reply else {
        panic!("expected a unary reply");
    };
    assert_eq!(status, 404);

    harness.registry.stop();
}
