//! Payment provider webhooks.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Serialize;
use workflow::{WebhookHeaders, WebhookProvider};

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct WebhookReceived {
    pub received: bool,
}

/// POST /payments/{provider}/webhook
///
/// Takes the raw body, since the signature covers the exact bytes sent.
/// Anything other than a bad signature or a failed write is acknowledged
/// with 200, including signed payloads we cannot use.
#[tracing::instrument(skip(state, headers, body), fields(bytes = body.len()))]
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReceived>, ApiError> {
    let provider: WebhookProvider = provider.parse()?;
    let headers: WebhookHeaders = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect();

    let ack = state
        .reconciler
        .handle_webhook(provider, &body, &headers)
        .await
        .map_err(ApiError::webhook)?;
    tracing::debug!(
        event_id = %ack.event_id,
        outcome = ack.outcome.as_str(),
        "webhook acknowledged"
    );
    Ok(Json(WebhookReceived { received: true }))
}
