pub mod auth;
mod routes;

pub use routes::create_router;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use reliquary_core::{Reliquary, ReliquaryError};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub reliquary: Arc<Reliquary>,
    /// Cancelled on shutdown so request-driven syncs stop at a checkpoint.
    pub shutdown: CancellationToken,
    pub start_time: std::time::Instant,
}

/// Router with request tracing and, when a token is set, bearer auth.
pub fn app(state: AppState, auth_token: Option<Arc<str>>) -> Router {
    create_router(state)
        .layer(axum::middleware::from_fn(move |req, next| {
            let token = auth_token.clone();
            async move { auth::check(req, next, token).await }
        }))
        .layer(TraceLayer::new_for_http())
}

/// JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Custom error type for HTTP handlers
pub struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        let Some(err) = self.0.downcast_ref::<ReliquaryError>() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match err {
            ReliquaryError::NotFound(_) => StatusCode::NOT_FOUND,
            ReliquaryError::InvalidAddressFormat { .. }
            | ReliquaryError::Validation(_)
            | ReliquaryError::UnsupportedNetwork(_) => StatusCode::BAD_REQUEST,
            ReliquaryError::ConflictingMerge { .. } => StatusCode::CONFLICT,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(JsonResponse::<()>::err(self.0.to_string()))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ReliquaryError) -> StatusCode {
        AppError::from(err).status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(ReliquaryError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(ReliquaryError::InvalidAddressFormat {
                address: "0x1".into(),
                reason: "too short".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ReliquaryError::UnsupportedNetwork("solana".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ReliquaryError::ConflictingMerge {
                record: "r".into(),
                reason: "2 distinct chain identities".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ReliquaryError::AllProvidersExhausted {
                kind: "rpc:ethereum".into(),
                attempted: 2,
                in_backoff: 1
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
