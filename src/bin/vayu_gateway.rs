//! Gateway server entrypoint.
//!
//! ```sh
//! ADMIN_TOKEN=... VORTEX_APPLICATION_ID=... VORTEX_API_KEY=... \
//! DATABASE_URL=postgres://... REDIS_URL=redis://127.0.0.1:6379 \
//! vayu-gateway
//! ```

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use vayu_gateway::config::Settings;
use vayu_gateway::{App, http};

#[tokio::main]
async fn main() -> vayu_gateway::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let bind_addr = settings.bind_addr;
    let app = App::bootstrap(settings).await?;
    let router = http::router(app.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| {
            vayu_gateway::GatewayError::Internal(format!("bind {bind_addr} failed: {e}"))
        })?;
    tracing::info!(%bind_addr, instance = %app.instance_id, "gateway listening");

    let shutdown_app = app.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
        // Teardown order: the graceful shutdown already stops accepting new
        // connections; close the upstream feed, then give the audit queue a
        // beat to flush before the server drops.
        tracing::info!("shutdown signal received");
        shutdown_app.stop_streaming().await;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    })
    .await
    .map_err(|e| vayu_gateway::GatewayError::Internal(format!("server error: {e}")))?;

    tracing::info!("gateway stopped");
    Ok(())
}
