//! HTTP forwarding through the authenticated pipeline
//!
//! Receives inbound requests, strips hop-by-hop headers and any client
//! credential, and sends them upstream through `RequestPipeline`, which
//! attaches the session's bearer token and handles refresh-and-retry.
//! Upstream responses (including error statuses) are returned verbatim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use session_pipeline::{Error, RequestPipeline};
use tracing::{error, instrument, warn};

use crate::error::{classify, error_response, pipeline_error_response};
use crate::metrics::{record_request, record_upstream_error};

/// Largest inbound body the proxy buffers.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub pipeline: Arc<RequestPipeline>,
    pub timeout: Duration,
}

/// Forward an inbound request upstream with the session credential.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = header::HeaderMap::new();
    for (name, value) in request.headers() {
        if forwardable(name.as_str()) {
            headers.insert(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            record_request(StatusCode::BAD_REQUEST.as_u16(), method.as_str(), started.elapsed().as_secs_f64());
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let upstream_request = transport::Request::new(method.clone(), path)
        .with_headers(headers)
        .with_body(body)
        .with_timeout(state.timeout);

    let response = match state.pipeline.send_with_id(upstream_request, &request_id).await {
        Ok(upstream) => forward_response(upstream, &request_id),
        // The upstream's own 401 is the most useful thing to hand back
        Err(Error::Unauthorized(upstream)) => {
            warn!("upstream rejected credential after refresh");
            forward_response(*upstream, &request_id)
        }
        Err(e) => {
            let (_, error_type) = classify(&e);
            error!(error = %e, error_type, "request failed");
            record_upstream_error(error_type);
            pipeline_error_response(&e, &request_id)
        }
    };

    record_request(response.status().as_u16(), method.as_str(), started.elapsed().as_secs_f64());
    response
}

fn forward_response(upstream: transport::Response, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
        .into_response()
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Inbound headers that travel upstream. The session supplies its own
/// Authorization; Host and Content-Length are recomputed by the client.
fn forwardable(name: &str) -> bool {
    !is_hop_by_hop(name)
        && !name.eq_ignore_ascii_case(header::AUTHORIZATION.as_str())
        && !name.eq_ignore_ascii_case(header::HOST.as_str())
        && !name.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn client_credentials_are_not_forwarded() {
        assert!(!forwardable("authorization"));
        assert!(!forwardable("Host"));
        assert!(!forwardable("keep-alive"));
        assert!(forwardable("content-type"));
        assert!(forwardable("x-custom-header"));
    }

    #[test]
    fn forward_response_strips_hop_by_hop() {
        let mut upstream = transport::Response::new(StatusCode::CREATED, "made");
        upstream
            .headers
            .insert(header::CONNECTION, header::HeaderValue::from_static("close"));
        upstream
            .headers
            .insert("x-upstream", header::HeaderValue::from_static("yes"));

        let response = forward_response(upstream, "req_1");

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(header::CONNECTION).is_none());
        assert_eq!(response.headers()["x-upstream"], "yes");
    }
}
