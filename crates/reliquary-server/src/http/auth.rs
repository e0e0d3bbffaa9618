use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

use super::JsonResponse;

/// Bearer token auth middleware. Skips `/health`. Passes everything through
/// when no token is configured.
pub async fn check(req: Request, next: Next, token: Option<Arc<str>>) -> Response {
    let Some(expected) = token else {
        return next.run(req).await;
    };
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(t) if t == &*expected => next.run(req).await,
        Some(_) => (StatusCode::UNAUTHORIZED, Json(JsonResponse::<()>::err("Invalid token"))).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(JsonResponse::<()>::err("Missing Authorization header")),
        )
            .into_response(),
    }
}
