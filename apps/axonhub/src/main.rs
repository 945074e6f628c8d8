use anyhow::Result;

use axonhub_router::GatewayState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let boot = axonhub_core::bootstrap::bootstrap_from_env().await?;
    let bind = format!("{}:{}", boot.config.host, boot.config.port);

    let app = axonhub_router::proxy_router(GatewayState {
        executor: boot.executor.clone(),
        auth: boot.auth.clone(),
        registry: boot.registry.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "axonhub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    boot.shutdown();
    Ok(())
}
