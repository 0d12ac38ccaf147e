//! Inbound payment webhook.
//!
//! The body is taken raw: the HMAC covers the exact bytes on the wire, so
//! this handler must not let axum deserialize before verification. Valid
//! events are always acknowledged 200, even when they reference nothing we
//! know, so the gateway's retry policy is the only redelivery mechanism.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use tracing::instrument;

use crate::{errors::ServiceError, AppState};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[instrument(skip(state, headers, body))]
pub async fn handle_payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let verifier = state.webhook_verifier.as_ref().ok_or_else(|| {
        ServiceError::InternalError("Payment webhook secret is not configured".to_string())
    })?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ServiceError::InvalidWebhookSignature("Missing signature header".to_string())
        })?;

    let event = verifier.verify_and_parse(&body, signature)?;
    state.services.orders.apply_payment_event(&event).await?;

    Ok(Json(serde_json::json!({ "received": true })))
}
