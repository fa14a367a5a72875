//! reqwest-backed transport
//!
//! Resolves each request path against a fixed base URL and buffers the whole
//! response body. Every call carries an upstream timeout: the request's own
//! timeout if set, otherwise the transport default.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{Request, Response, Result, Transport, TransportError};

/// HTTP transport sending requests to a single upstream base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// Map a reqwest failure onto the transport taxonomy.
pub fn classify_reqwest_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: Request) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + '_>> {
        Box::pin(async move {
            let url = self.url_for(&request.path);
            let timeout = request.timeout.unwrap_or(self.timeout);

            let upstream = self
                .client
                .request(request.method.clone(), &url)
                .headers(request.headers)
                .timeout(timeout)
                .body(request.body)
                .send()
                .await
                .map_err(|e| {
                    let err = classify_reqwest_error(&e);
                    warn!(url = %url, error = %err, "upstream call failed");
                    err
                })?;

            let status = upstream.status();
            let headers = upstream.headers().clone();
            let body = upstream.bytes().await.map_err(|e| {
                let err = classify_reqwest_error(&e);
                warn!(url = %url, error = %err, "failed to read upstream response body");
                err
            })?;

            debug!(url = %url, status = status.as_u16(), bytes = body.len(), "upstream call completed");
            Ok(Response {
                status,
                headers,
                body,
            })
        })
    }
}
