//! Mapping of pipeline and session errors onto HTTP responses
//!
//! Every error body has the same shape:
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use session_pipeline::Error;

/// Fresh `req_<uuid>` identifier for correlating logs and error bodies.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// HTTP status and error `type` for a pipeline failure.
///
/// `Unauthorized` is listed for completeness; the proxy hands the upstream
/// 401 back verbatim instead.
pub fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::AuthExpired => (StatusCode::UNAUTHORIZED, "session_expired"),
        Error::NotAuthenticated => (StatusCode::UNAUTHORIZED, "not_authenticated"),
        Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        Error::Login(_) => (StatusCode::UNAUTHORIZED, "login_failed"),
        Error::Transport(e) if e.is_timeout() => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
        Error::Transport(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
    }
}

/// JSON error response.
pub fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Error response for a pipeline failure.
pub fn pipeline_error_response(err: &Error, request_id: &str) -> Response {
    let (status, error_type) = classify(err);
    error_response(status, error_type, &err.to_string(), request_id)
}
