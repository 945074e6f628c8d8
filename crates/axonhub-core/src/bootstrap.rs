use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use axonhub_channel::{
    ChannelRegistry, ErrorCounters, LoadBalancer, MetricsHub, PerformanceRecorder, RetryPolicy,
};
use axonhub_common::{CacheMode, GatewayConfig, GatewayConfigPatch};
use axonhub_storage::cache::api_keys::ApiKeyLoader;
use axonhub_storage::{
    API_KEY_CHANNEL, ApiKeyCache, CacheNotifier, DataStorageManager, GatewayStorage, LiveCache,
    LiveCacheConfig, ProcessNotifier, RedisNotifier, RequestService, StoragePolicy,
};

use crate::auth::AuthService;
use crate::executor::RequestExecutor;
use crate::upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Parser)]
#[command(name = "axonhub", about = "Multi-tenant LLM gateway")]
struct Cli {
    #[arg(long, env = "AXONHUB_HOST")]
    host: Option<String>,
    #[arg(long, env = "AXONHUB_PORT")]
    port: Option<u16>,
    #[arg(long, env = "AXONHUB_DSN")]
    dsn: Option<String>,
    #[arg(long, env = "AXONHUB_PROXY")]
    proxy: Option<String>,
    #[arg(long, env = "AXONHUB_CACHE_MODE", value_parser = parse_cache_mode)]
    cache_mode: Option<CacheMode>,
    #[arg(long, env = "AXONHUB_REDIS_URL")]
    redis_url: Option<String>,
}

fn parse_cache_mode(value: &str) -> Result<CacheMode, String> {
    match value {
        "memory" => Ok(CacheMode::Memory),
        "redis" => Ok(CacheMode::Redis),
        other => Err(format!("unknown cache mode: {other}")),
    }
}

/// Everything a serving process needs, wired and started.
pub struct Bootstrap {
    pub config: GatewayConfig,
    pub storage: GatewayStorage,
    pub registry: Arc<ChannelRegistry>,
    pub executor: Arc<RequestExecutor>,
    pub auth: Arc<AuthService>,
    pub requests: Arc<RequestService>,
    pub api_key_cache: Arc<ApiKeyCache>,
    pub objects: Arc<DataStorageManager>,
    /// Held so invalidations keep flowing and other components can publish.
    pub notifier: Arc<dyn CacheNotifier>,
    recorder: Option<PerformanceRecorder>,
}

impl Bootstrap {
    /// Stop background workers. Safe to skip on process exit.
    pub fn shutdown(mut self) {
        self.registry.stop();
        self.api_key_cache.stop();
        self.objects.stop();
        if let Some(recorder) = self.recorder.take() {
            recorder.stop();
        }
    }
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let cli = Cli::parse();
    let mut patch = GatewayConfigPatch::default();
    patch.overlay(GatewayConfigPatch {
        host: cli.host,
        port: cli.port,
        dsn: cli.dsn,
        proxy: cli.proxy,
        cache_mode: cli.cache_mode,
        redis_url: cli.redis_url,
    });
    let config = patch.into_config().context("incomplete gateway config")?;

    let storage = GatewayStorage::connect(&config.dsn)
        .await
        .context("database connection failed")?;
    storage.sync().await.context("schema sync failed")?;

    let registry = ChannelRegistry::start(Arc::new(storage.clone()))
        .await
        .context("channel registry start failed")?;

    let policy = RetryPolicy::default();
    let metrics = Arc::new(MetricsHub::default());
    let counters = Arc::new(ErrorCounters::new());
    let (perf, recorder) = PerformanceRecorder::start(
        Arc::clone(&metrics),
        counters,
        policy.auto_disable.clone(),
        Arc::clone(&registry),
    );
    let balancer = Arc::new(LoadBalancer::new(Arc::clone(&registry), metrics));

    let objects = DataStorageManager::start(storage.clone())
        .await
        .context("data storage manager start failed")?;
    let requests = Arc::new(RequestService::new(
        storage.clone(),
        Arc::clone(&objects),
        StoragePolicy::default(),
    ));

    let client_config = UpstreamClientConfig {
        proxy: config.proxy.clone(),
        ..UpstreamClientConfig::default()
    };
    let upstream: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(client_config).context("upstream client build failed")?,
    );

    let executor = Arc::new(RequestExecutor::new(
        balancer,
        upstream,
        Arc::clone(&requests),
        perf,
        policy,
    ));

    let notifier: Arc<dyn CacheNotifier> = match config.cache_mode {
        CacheMode::Memory => Arc::new(ProcessNotifier::new()),
        CacheMode::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("redis cache mode requires a redis url")?;
            Arc::new(
                RedisNotifier::connect(url, API_KEY_CHANNEL)
                    .await
                    .context("redis notifier connect failed")?,
            )
        }
    };
    let api_key_cache = LiveCache::new(
        Arc::new(ApiKeyLoader::new(storage.clone())),
        LiveCacheConfig::default(),
    );
    api_key_cache.start(Some(Arc::clone(&notifier)));

    let auth = Arc::new(AuthService::new(
        Arc::clone(&api_key_cache),
        storage.clone(),
    ));

    Ok(Bootstrap {
        config,
        storage,
        registry,
        executor,
        auth,
        requests,
        api_key_cache,
        objects,
        notifier,
        recorder: Some(recorder),
    })
}
