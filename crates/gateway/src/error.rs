//! Maps the aggregate [`GatewayError`] onto an HTTP response: status code,
//! `{"detail": ...}` body, and `Retry-After`/`WWW-Authenticate` headers where
//! the taxonomy calls for them (§7).

use attestgate_core::error::GatewayError;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

/// Newtype so this crate can implement `IntoResponse` for the
/// core-crate-owned `GatewayError` without violating the orphan rule.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = self.0.to_string();
        let mut response = (status, Json(ErrorBody { detail })).into_response();

        if let GatewayError::TooManyRequests { retry_after_ms } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_ms.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        if matches!(self.0, GatewayError::Unauthorized(_)) {
            response
                .headers_mut()
                .insert(axum::http::header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
