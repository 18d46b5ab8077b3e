//! API module for the Keygate dispatcher
//!
//! Provides HTTP endpoints for:
//! - GitHub webhook deliveries
//! - Health checks
//! - Prometheus metrics

mod auth;
mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::AppState;

pub use auth::{sign, verify_signature, VerifiedWebhook};
pub use error::ApiError;

/// Largest webhook payload accepted (GitHub caps deliveries at 25 MB)
const WEBHOOK_BODY_LIMIT: usize = 25 * 1024 * 1024;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))
        // Prometheus metrics
        .route("/metrics", get(crate::metrics::metrics_handler))
        // GitHub webhooks
        .route(
            "/webhook",
            post(handlers::webhook::receive_webhook).layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        )
        .with_state(state)
}
