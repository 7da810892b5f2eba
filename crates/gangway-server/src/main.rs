use std::net::SocketAddr;
use std::sync::Arc;

use gangway_tunnel::{PodmanCli, Supervisor, TunnelConfig};
use tracing_subscriber::prelude::*;

mod routes;

fn listen_addr() -> SocketAddr {
    std::env::var("GANGWAY_LISTEN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| ([0, 0, 0, 0], 8750).into())
}

fn log_dir() -> std::path::PathBuf {
    std::env::var("GANGWAY_LOG_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("./logs"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Persist server logs next to the data while keeping stdout logs for
    // docker/dev.
    let log_dir = log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "gangway.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    let _file_guard = file_guard;

    let config = TunnelConfig::from_env();
    let runtime = Arc::new(PodmanCli::new(config.runtime_call_deadline));
    let supervisor = Supervisor::new(runtime, config);

    // Re-attach monitors to containers that survived a server restart. A
    // missing podman binary is not fatal here; the HTTP surface reports it
    // per request instead.
    if let Err(e) = supervisor.reconcile().await {
        tracing::warn!(error = %e, "tunnel reconciliation failed at startup");
    }

    let addr = listen_addr();
    tracing::info!(%addr, "gangway-server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = routes::router(supervisor.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await?;

    Ok(())
}

async fn shutdown_signal(supervisor: Supervisor) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
    supervisor.shutdown();
}
