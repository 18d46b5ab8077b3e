//! Keygate dispatcher - signature checks for GitHub pull requests
//!
//! Receives pull request webhooks, runs the trust search on each head
//! commit and reports the verdict as a commit status.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use keygate_engine::api::create_router;
use keygate_engine::config::AppConfig;
use keygate_engine::dispatcher::{CheckQueue, Dispatcher, GitHubCheckRunner};
use keygate_engine::logging::init_logging;
use keygate_engine::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;
    config.validate_dispatcher()?;

    // Initialize logging
    init_logging(&config.log_level, config.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Keygate dispatcher"
    );

    // Initialize metrics system
    keygate_engine::metrics::init_metrics()?;
    info!("Prometheus metrics initialized");

    if config.github.token.is_none() {
        warn!("github.token is not set; commit statuses cannot be published");
    }
    match &config.gpg.keyring {
        Some(path) => info!(keyring = %path.display(), "Using persistent keyring"),
        None => info!(
            keyserver = %config.gpg.keyserver,
            allow_key_download = config.gpg.allow_key_download,
            "Using a temporary keyring per check"
        ),
    }

    // Start the check dispatcher
    let (queue, receiver) = CheckQueue::new(config.dispatcher.queue_capacity);
    let runner = Arc::new(GitHubCheckRunner::new(config.clone()));
    let dispatcher = Dispatcher::new(receiver, runner, config.github.status_context.clone());
    let worker = tokio::spawn(dispatcher.run());

    // Create shared application state
    let state = Arc::new(AppState {
        config: config.clone(),
        queue,
    });

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::new(x_request_id)),
    );

    // Bind to address
    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.bind_addr()))?;
    info!(%addr, "Listening on");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and with it the queue sender) is gone; let queued checks finish
    info!("Shutting down, waiting for queued checks...");
    if let Err(err) = worker.await {
        warn!(error = %err, "Dispatcher task ended abnormally");
    }

    info!("Keygate dispatcher stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
