//! Caller identity from the `Authorization` header.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use workflow::Actor;

use crate::AppState;
use crate::error::ApiError;

/// The acting user. Requests without a bearer token act anonymously; a
/// token the auth service does not know is rejected.
pub struct CurrentActor(pub Actor);

fn bearer_token(parts: &Parts) -> Result<Option<&str>, ApiError> {
    let Some(header) = parts.headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let header = header
        .to_str()
        .map_err(|_| ApiError::Unauthorized("invalid authorization header".to_string()))?;
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(Some)
        .ok_or_else(|| ApiError::Unauthorized("expected a bearer token".to_string()))
}

impl FromRequestParts<Arc<AppState>> for CurrentActor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts)? else {
            return Ok(CurrentActor(Actor::Anonymous));
        };
        match state.auth.authenticate(token).await? {
            Some(caller) => Ok(CurrentActor(Actor::from(Some(caller)))),
            None => {
                tracing::warn!(uri = %parts.uri, "unknown bearer token");
                Err(ApiError::Unauthorized("invalid token".to_string()))
            }
        }
    }
}
