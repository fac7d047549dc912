use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{error, warn};
use serde_json::json;

use crate::browse::BrowseError;
use crate::error::ProxyError;

/// Failure of a boundary handler.  Input errors found before routing are
/// 4xx; every routing or proxy failure is a 503 whose body names the kind.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Proxy(ProxyError),
    Browse(BrowseError),
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        ApiError::Proxy(e)
    }
}

impl From<BrowseError> for ApiError {
    fn from(e: BrowseError) -> Self {
        ApiError::Browse(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg.clone()),
            ApiError::Proxy(e) => (StatusCode::SERVICE_UNAVAILABLE, e.kind(), e.to_string()),
            ApiError::Browse(e) => {
                let (status, kind) = match e {
                    BrowseError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "invalid_path"),
                    BrowseError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    BrowseError::Runtime(_) => (StatusCode::INTERNAL_SERVER_ERROR, "runtime"),
                    BrowseError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io"),
                };
                (status, kind, e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, details) = self.parts();
        if status.is_server_error() {
            error!("Request failed ({}): {}", kind, details);
        } else {
            warn!("Request rejected ({}): {}", kind, details);
        }
        (status, Json(json!({ "error": kind, "details": details }))).into_response()
    }
}
