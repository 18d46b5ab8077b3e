//! Webhook delivery authentication

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request},
    http::HeaderMap,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::AppState;

use super::ApiError;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

/// A webhook body whose `X-Hub-Signature-256` matched the configured secret
#[derive(Debug, Clone)]
pub struct VerifiedWebhook {
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
impl FromRequest<Arc<AppState>> for VerifiedWebhook {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let headers = req.headers().clone();
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read webhook body: {}", e)))?;

        let Some(secret) = state.config.dispatcher.webhook_secret.as_deref() else {
            tracing::error!("dispatcher.webhook_secret is not set; rejecting webhook delivery");
            return Err(ApiError::Unauthorized);
        };

        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        verify_signature(secret, &body, signature)?;

        Ok(VerifiedWebhook { headers, body })
    }
}

/// Check a `sha256=<hex>` signature of `body` in constant time
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), ApiError> {
    let expected = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|digest| hex::decode(digest).ok())
        .ok_or(ApiError::Unauthorized)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Internal(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| {
        tracing::debug!("Webhook signature mismatch");
        ApiError::Unauthorized
    })
}

/// `X-Hub-Signature-256` value for `body`
pub fn sign(secret: &str, body: &[u8]) -> Result<String, ApiError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Internal(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes())))
}
