//! API Middleware (Auth, Logging)

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::handlers::AppState;
use super::types::{elapsed_ms, ApiError, ApiResponse};

pub const API_KEY_HEADER: &str = "X-API-Key";

fn is_public(path: &str) -> bool {
    path == "/health" || path == "/v1/health"
}

/// API key authentication middleware. A no-op when no key is configured.
pub async fn auth_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(ref expected) = state.api_key else {
        return next.run(request).await;
    };
    if is_public(request.uri().path()) {
        return next.run(request).await;
    }

    let start = Instant::now();
    let authorized = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| key == expected.as_str());

    if authorized {
        return next.run(request).await;
    }

    warn!(uri = %request.uri(), "Rejected request without a valid API key");
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::error(ApiError::unauthorized(), elapsed_ms(start))),
    )
        .into_response()
}

/// Request logging middleware
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    info!(
        method = %method,
        uri = %uri,
        status = %response.status().as_u16(),
        latency_ms = %start.elapsed().as_millis(),
        "Request completed"
    );

    response
}
