//! Single-flight credential refresh
//!
//! Any number of callers may discover at once that the access token is dead.
//! The first one flips the coordinator from `Idle` to `Refreshing` and spawns
//! the one refresh call; everyone after that parks a oneshot sender in the
//! waiter queue. When the call settles, the queue is drained in registration
//! order with the same outcome.
//!
//! The refresh runs in its own task, so dropping the caller that started it
//! never strands the others. A supervising task awaits it and rejects the
//! queue if the refresh task dies without settling.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use session_auth::{AuthEndpoint, Clock, CredentialPair, CredentialStore};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

type Waiter = oneshot::Sender<Result<CredentialPair>>;

/// Coordinator state. The only transition out of `Idle` happens under the
/// mutex with no await between the check and the set.
enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

struct Inner {
    state: RefreshState,
    /// Bumped by `invalidate()` and by every refresh start. A refresh whose
    /// generation is no longer current has its result thrown away.
    generation: u64,
}

/// Notified after a refresh settles, outside the coordinator lock.
pub trait RefreshObserver: Send + Sync {
    /// A refreshed pair was persisted.
    fn refreshed(&self, coordinator: &Arc<RefreshCoordinator>, pair: &CredentialPair);

    /// The refresh was rejected or failed; the store has been cleared.
    fn expired(&self);
}

pub struct RefreshCoordinator {
    inner: Mutex<Inner>,
    endpoint: Arc<dyn AuthEndpoint>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    skew: Duration,
    timeout: Duration,
    observer: Option<Arc<dyn RefreshObserver>>,
}

impl RefreshCoordinator {
    pub fn new(
        endpoint: Arc<dyn AuthEndpoint>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        skew: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RefreshState::Idle,
                generation: 0,
            }),
            endpoint,
            store,
            clock,
            skew,
            timeout,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RefreshObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn skew(&self) -> Duration {
        self.skew
    }

    /// Obtain a credential to replace `failed`.
    ///
    /// Joins the in-flight refresh if there is one, otherwise starts it. If
    /// the store already holds a fresh pair other than `failed` (a refresh
    /// completed after the caller read its credential), that pair is returned
    /// without another network call.
    ///
    /// Errors: `AuthExpired` when the refresh fails, the session was
    /// invalidated, or there is nothing left to refresh; `Storage` when the
    /// new pair could not be persisted.
    pub async fn request_refresh(self: &Arc<Self>, failed: &CredentialPair) -> Result<CredentialPair> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;

        if let RefreshState::Refreshing { waiters } = &mut inner.state {
            waiters.push(tx);
            metrics::counter!("session_refresh_joined_total").increment(1);
            debug!(waiters = waiters.len(), "joined in-flight refresh");
            drop(inner);
            return rx.await.unwrap_or(Err(Error::AuthExpired));
        }

        let Some(current) = self.store.get().await.map_err(Error::storage)? else {
            debug!("no credential to refresh");
            return Err(Error::AuthExpired);
        };
        if current.access_token != failed.access_token && !current.is_stale(self.clock.now_millis(), self.skew) {
            debug!("newer credential already stored, skipping refresh");
            return Ok(current);
        }

        inner.state = RefreshState::Refreshing { waiters: vec![tx] };
        inner.generation += 1;
        let generation = inner.generation;
        debug!(generation, "starting credential refresh");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let run = tokio::spawn(Arc::clone(&this).run_refresh(generation, current.refresh_token));
            if let Err(e) = run.await {
                error!(error = %e, generation, "refresh task died before settling");
                this.abandon(generation).await;
            }
        });
        drop(inner);

        // A dropped sender means the waiter was discarded without an outcome
        rx.await.unwrap_or(Err(Error::AuthExpired))
    }

    async fn run_refresh(self: Arc<Self>, generation: u64, refresh_token: Secret<String>) {
        let outcome = match tokio::time::timeout(self.timeout, self.endpoint.refresh(refresh_token.expose())).await {
            Ok(Ok(response)) => {
                CredentialPair::from_token_response(&response, Some(&refresh_token), self.clock.now_millis())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(session_auth::Error::Http(format!(
                "refresh timed out after {}s",
                self.timeout.as_secs()
            ))),
        };

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!(generation, current = inner.generation, "discarding refresh result from invalidated session");
            return;
        }
        let waiters = match std::mem::replace(&mut inner.state, RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        };

        match outcome {
            Ok(pair) => {
                if let Err(e) = self.store.set(pair.clone()).await {
                    warn!(error = %e, waiters = waiters.len(), "failed to persist refreshed credential");
                    metrics::counter!("session_refresh_total", "outcome" => "storage_error").increment(1);
                    settle(waiters, Err(Error::storage(e)));
                    return;
                }
                info!(expires_at = pair.expires_at, waiters = waiters.len(), "credential refreshed");
                metrics::counter!("session_refresh_total", "outcome" => "success").increment(1);
                settle(waiters, Ok(pair.clone()));
                drop(inner);

                if let Some(observer) = &self.observer {
                    observer.refreshed(&self, &pair);
                }
            }
            Err(e) => {
                warn!(error = %e, waiters = waiters.len(), "credential refresh failed, session expired");
                self.clear_rejected().await;
                metrics::counter!("session_refresh_total", "outcome" => "failure").increment(1);
                settle(waiters, Err(Error::AuthExpired));
                drop(inner);

                if let Some(observer) = &self.observer {
                    observer.expired();
                }
            }
        }
    }

    /// Drop the rejected pair from the store, retrying once.
    async fn clear_rejected(&self) {
        let Err(first) = self.store.clear().await else {
            return;
        };
        warn!(error = %first, "failed to clear credential store, retrying");
        if let Err(e) = self.store.clear().await {
            error!(error = %e, "rejected credential left in store");
            metrics::counter!("session_refresh_total", "outcome" => "storage_error").increment(1);
        }
    }

    /// Settle a refresh whose task ended without doing so.
    async fn abandon(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        if let RefreshState::Refreshing { waiters } = std::mem::replace(&mut inner.state, RefreshState::Idle) {
            metrics::counter!("session_refresh_total", "outcome" => "failure").increment(1);
            settle(waiters, Err(Error::AuthExpired));
        }
    }

    /// Reject every current waiter with `AuthExpired` and return to `Idle`.
    ///
    /// An in-flight refresh call is left to finish; its result is discarded.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        if let RefreshState::Refreshing { waiters } = std::mem::replace(&mut inner.state, RefreshState::Idle) {
            debug!(waiters = waiters.len(), "rejecting waiters of invalidated refresh");
            settle(waiters, Err(Error::AuthExpired));
        }
    }

    pub async fn is_refreshing(&self) -> bool {
        matches!(self.inner.lock().await.state, RefreshState::Refreshing { .. })
    }

    #[cfg(test)]
    async fn waiter_count(&self) -> usize {
        match &self.inner.lock().await.state {
            RefreshState::Refreshing { waiters } => waiters.len(),
            RefreshState::Idle => 0,
        }
    }
}

/// Resolve waiters in registration order. A waiter whose caller has gone
/// away is skipped.
fn settle(waiters: Vec<Waiter>, outcome: Result<CredentialPair>) {
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}
