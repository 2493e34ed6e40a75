//! Provider binary.
//!
//! Connects to the attestation node, starts the polling bridge and the
//! attester loop, and serves the Provider transport with graceful shutdown on
//! SIGTERM/SIGINT.

use attest_node::HttpNodeClient;
use attest_server::background::start_pruning_task;
use attest_server::{config, Provider};
use attest_services::SystemClock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("ATTEST_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the provider cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let node = Arc::new(
        HttpNodeClient::with_timeout(
            config.node.url.clone(),
            Duration::from_millis(config.node.request_timeout_ms),
        )
        .expect("failed to build the node HTTP client"),
    );
    let provider = Provider::from_config(node, Arc::new(SystemClock), &config)
        .expect("invalid procedure configuration");
    tracing::info!(
        node = %config.node.url,
        procedures = ?provider.procedures.ids(),
        "loaded procedures"
    );

    let handle = provider.start();
    tokio::spawn(start_pruning_task(
        provider.engine.clone(),
        config.attestation.transaction_retention_seconds,
    ));

    let app = provider.router();
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting attest provider");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    handle.stop();
    tracing::info!("attest provider shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
