//! GitHub webhook handler

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::{ApiError, VerifiedWebhook};
use crate::dispatcher::CheckRequest;
use crate::git::validate_commit_id;
use crate::github::validate_repository_name;
use crate::models::WebhookResponse;
use crate::AppState;

const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

/// The parts of a `pull_request` event needed to schedule a check
#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    number: u64,
    pull_request: PullRequestPayload,
    repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    head: HeadPayload,
}

#[derive(Debug, Deserialize)]
struct HeadPayload {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Receive a webhook delivery.
///
/// Only the repository name and head commit are taken from the payload; every
/// URL the dispatcher contacts is derived from the GitHub configuration.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    VerifiedWebhook { headers, body }: VerifiedWebhook,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    let event = header(&headers, EVENT_HEADER)
        .ok_or_else(|| ApiError::BadRequest("Missing X-GitHub-Event header".into()))?;
    let delivery_id = header(&headers, DELIVERY_HEADER)
        .and_then(|id| Uuid::parse_str(id).ok())
        .unwrap_or_else(Uuid::new_v4);

    match event {
        "ping" => Ok((StatusCode::OK, Json(WebhookResponse::ignored("pong")))),
        "pull_request" => {
            let event: PullRequestEvent = serde_json::from_slice(&body)
                .map_err(|e| ApiError::BadRequest(format!("Invalid pull_request payload: {}", e)))?;

            if !state.config.dispatcher.triggers(&event.action) {
                debug!(action = %event.action, number = event.number, "Ignoring pull request action");
                return Ok((
                    StatusCode::ACCEPTED,
                    Json(WebhookResponse::ignored(format!("Action {} ignored", event.action))),
                ));
            }

            let repository = event.repository.full_name;
            let head_sha = event.pull_request.head.sha;
            validate_repository_name(&repository)
                .and_then(|()| validate_commit_id(&head_sha))
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;

            let github = &state.config.github;
            let request = CheckRequest {
                delivery_id,
                clone_url: github.clone_url(&repository),
                statuses_url: github.statuses_url(&repository, &head_sha),
                pull_request_url: github.pull_request_url(&repository, event.number),
                head_sha,
                number: event.number,
                received_at: Utc::now(),
            };
            info!(
                delivery_id = %delivery_id,
                repository = %repository,
                number = request.number,
                head_sha = %request.head_sha,
                "Queueing pull request check"
            );
            state.queue.enqueue(request)?;

            Ok((StatusCode::ACCEPTED, Json(WebhookResponse::queued(delivery_id))))
        }
        other => {
            debug!(event = %other, "Ignoring webhook event");
            Ok((
                StatusCode::ACCEPTED,
                Json(WebhookResponse::ignored(format!("Event {} ignored", other))),
            ))
        }
    }
}
