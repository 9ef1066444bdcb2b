//! The gateway-specific middlewares from §4.9: security headers, request
//! metrics (`X-Request-ID`/`X-Response-Time`), and bearer authentication.
//! Generic concerns (CORS, timeout, body limit) are plain `tower_http`
//! layers applied in `lib.rs`.

use std::time::Instant;

use attestgate_core::error::GatewayError;
use attestgate_core::message::new_request_id;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::error::ApiError;
use crate::SharedState;

pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-XSS-Protection", HeaderValue::from_static("1; mode=block"));
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert("Permissions-Policy", HeaderValue::from_static("geolocation=(), microphone=(), camera=()"));
    response
}

pub async fn request_metrics_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(new_request_id);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert("X-Request-ID", value.clone());
    }

    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut response = next.run(req).await;

    let elapsed_ms = started.elapsed().as_millis();
    if let Ok(id_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", id_value);
    }
    if let Ok(timing_value) = HeaderValue::from_str(&format!("{elapsed_ms}ms")) {
        response.headers_mut().insert("X-Response-Time", timing_value);
    }

    tracing::debug!(%method, %path, status = response.status().as_u16(), elapsed_ms, "request completed");
    response
}

/// Authenticates the bearer credential against the configured
/// [`attestgate_auth::AuthStrategy`] and attaches the resulting
/// [`attestgate_auth::AuthenticationInfo`] as a request extension for
/// handlers to read.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credential = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer credential".to_string()))?;

    let auth_info = state.auth.authenticate(credential).await.map_err(|e| {
        warn!(error = %e, "authentication failed");
        GatewayError::from(e)
    })?;

    req.extensions_mut().insert(auth_info);
    Ok(next.run(req).await)
}
