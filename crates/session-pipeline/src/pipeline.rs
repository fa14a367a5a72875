//! Authenticated request pipeline
//!
//! Every outbound call goes through `RequestPipeline::send`, which attaches
//! the current bearer credential, refreshes ahead of sending when the stored
//! pair is already stale, and on a 401 refreshes through the coordinator and
//! resends exactly once. The second answer is final whatever it is.

use std::sync::Arc;
use std::time::Duration;

use session_auth::{Clock, CredentialPair, CredentialStore};
use tracing::{debug, instrument, warn};
use transport::{Request, Response, Transport};

use crate::attempt::{Attempt, classify};
use crate::error::{Error, Result};
use crate::refresh::RefreshCoordinator;

pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    clock: Arc<dyn Clock>,
    skew: Duration,
}

impl RequestPipeline {
    /// Build a pipeline sharing the coordinator's store, clock and skew.
    pub fn new(transport: Arc<dyn Transport>, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            transport,
            store: coordinator.store().clone(),
            clock: coordinator.clock().clone(),
            skew: coordinator.skew(),
            coordinator,
        }
    }

    /// Send an authenticated request under a freshly generated request id.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        self.send_with_id(request, &request_id).await
    }

    /// Send an authenticated request.
    ///
    /// Errors:
    /// - `NotAuthenticated`: no credential stored
    /// - `AuthExpired`: the credential could not be refreshed
    /// - `Unauthorized`: 401 after the single retry, or on an exempt request
    /// - `Transport`: the network call itself failed
    /// - `Storage`: the credential store could not be read or written
    #[instrument(skip_all, fields(request_id = %request_id, method = %request.method, path = %request.path))]
    pub async fn send_with_id(&self, request: Request, request_id: &str) -> Result<Response> {
        let result = self.run(request).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(Error::Transport(_)) => "transport_error",
            Err(Error::Unauthorized(_)) => "unauthorized",
            Err(Error::AuthExpired | Error::NotAuthenticated) => "auth_expired",
            Err(Error::Storage(_)) => "storage_error",
            Err(Error::Login(_)) => "login_error",
        };
        metrics::counter!("pipeline_requests_total", "outcome" => outcome).increment(1);
        result
    }

    async fn run(&self, request: Request) -> Result<Response> {
        let mut pair = self
            .store
            .get()
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotAuthenticated)?;

        if pair.is_stale(self.clock.now_millis(), self.skew) {
            debug!(expires_at = pair.expires_at, "credential stale, refreshing before send");
            pair = self.coordinator.request_refresh(&pair).await?;
        }

        let response = self.attempt(&request, &pair).await?;
        match classify(&request, &response, false) {
            Attempt::Complete => return Ok(response),
            Attempt::Unauthorized => return Err(Error::Unauthorized(Box::new(response))),
            Attempt::RefreshAndRetry => {}
        }

        debug!("unauthorized, refreshing credential and retrying once");
        let pair = self.coordinator.request_refresh(&pair).await?;
        metrics::counter!("pipeline_retries_total").increment(1);

        let response = self.attempt(&request, &pair).await?;
        match classify(&request, &response, true) {
            Attempt::Complete => Ok(response),
            _ => {
                warn!(status = %response.status, "still unauthorized after refresh");
                Err(Error::Unauthorized(Box::new(response)))
            }
        }
    }

    async fn attempt(&self, request: &Request, pair: &CredentialPair) -> Result<Response> {
        let mut request = request.clone();
        request.set_bearer(pair.access_token.expose())?;
        Ok(self.transport.send(request).await?)
    }
}
