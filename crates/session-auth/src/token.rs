//! Login, refresh, and revoke against the credential-issuing service
//!
//! `AuthEndpoint` is the capability the session layer consumes. The HTTP
//! implementation POSTs JSON to three paths under a base URL and accepts both
//! snake_case and camelCase token responses.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
use crate::error::{Error, Result};

/// Response from the login and refresh endpoints.
///
/// The lifetime arrives in one of two shapes: snake_case `expires_in` in
/// seconds, or camelCase `expiresIn` in milliseconds. `lifetime_millis`
/// normalizes both. `refresh_token` may be omitted by servers that keep it
/// stable across refreshes. `user` is the opaque profile some servers return
/// alongside the tokens.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, rename = "expiresIn", skip_serializing_if = "Option::is_none")]
    pub expires_in_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,
}

impl TokenResponse {
    /// Token lifetime in milliseconds. Seconds win when both are present.
    ///
    /// Errors with `TokenExchange` when neither field is set or the value
    /// does not fit in a u64 millisecond count.
    pub fn lifetime_millis(&self) -> Result<u64> {
        match (self.expires_in, self.expires_in_ms) {
            (Some(secs), _) => secs
                .checked_mul(1000)
                .ok_or_else(|| Error::TokenExchange(format!("expires_in out of range: {secs}"))),
            (None, Some(ms)) => Ok(ms),
            (None, None) => Err(Error::TokenExchange("token response carried no expiry".into())),
        }
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("expires_in_ms", &self.expires_in_ms)
            .field("user", &self.user)
            .finish()
    }
}

/// User credentials for the login endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: Secret<String>,
}

impl LoginCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: Secret::new(password.into()),
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// The external credential-issuing service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn AuthEndpoint>`).
/// A rejected credential comes back as `Error::InvalidCredentials`.
pub trait AuthEndpoint: Send + Sync {
    fn login<'a>(
        &'a self,
        credentials: &'a LoginCredentials,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;

    /// Server-side invalidation of an access token.
    fn revoke<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON-over-HTTP auth endpoint.
#[derive(Debug, Clone)]
pub struct HttpAuthEndpoint {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpAuthEndpoint {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn post_token<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<TokenResponse> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{path} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the submitted credential is revoked or invalid
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "{path} rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!("{path} returned {status}: {body}")));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {path} response: {e}")))
    }
}

impl AuthEndpoint for HttpAuthEndpoint {
    fn login<'a>(
        &'a self,
        credentials: &'a LoginCredentials,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            debug!(email = %credentials.email, "calling login endpoint");
            self.post_token(LOGIN_PATH, credentials).await
        })
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            debug!("calling refresh endpoint");
            self.post_token(REFRESH_PATH, &RefreshRequest { refresh_token })
                .await
        })
    }

    fn revoke<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url(LOGOUT_PATH))
                .timeout(self.timeout)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                warn!(status = status.as_u16(), "logout endpoint returned non-success");
                return Err(Error::TokenExchange(format!("logout returned {status}")));
            }
            Ok(())
        })
    }
}
