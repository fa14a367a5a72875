//! Transport abstraction for outbound API calls
//!
//! Defines the `Transport` trait that decouples the request pipeline from the
//! mechanism that actually performs a network call. The pipeline only needs
//! "send this request, give me a response or a transport failure". The
//! reqwest-backed `HttpTransport` is the production implementation; tests
//! substitute scripted fakes.

pub mod http;

pub use http::HttpTransport;
pub use reqwest::header;
pub use reqwest::{Method, StatusCode};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

/// Transport-level failures. A response with any status code, including
/// 401, is not an error at this layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Descriptor for a single outbound call.
///
/// `path` is resolved against the transport's base URL and may carry a query
/// string. `refresh_exempt` marks calls that must never trigger a credential
/// refresh when they come back unauthorized.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
    pub refresh_exempt: bool,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            refresh_exempt: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Upstream timeout for this call, overriding the transport default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Never refresh credentials when this call returns 401.
    pub fn exempt_from_refresh(mut self) -> Self {
        self.refresh_exempt = true;
        self
    }

    /// Replace any Authorization header with the given bearer token.
    pub fn set_bearer(&mut self, token: &str) -> Result<()> {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::InvalidHeader(format!("authorization: {e}")))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// Response returned by a transport, fully buffered.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 401 is the only status treated as "credential rejected". A 403 means
    /// the credential was accepted but lacks permission; refreshing won't help.
    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs a single network call.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + '_>>;
}
