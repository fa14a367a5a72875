//! Session lifecycle: login, logout, forced logout, proactive refresh
//!
//! The session is derived state. It is authenticated while the store holds a
//! fresh pair or a refresh is in flight. `SessionManager` drives the
//! transitions and publishes them on a broadcast channel:
//!
//! - Idle → Active (`login` or `restore`)
//! - Active → Active (coordinator refreshed the pair; timer re-armed)
//! - Active → Ended(UserLogout) (`logout`)
//! - Active → Ended(Expired) (refresh failed, or `on_force_logout`)
//!
//! The proactive timer is a spawned task sleeping until `lead` before
//! expiry. It is replaced on every refresh and aborted when the session ends.

use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use session_auth::{
    AuthEndpoint, Clock, CredentialPair, CredentialStore, DEFAULT_ENDPOINT_TIMEOUT, DEFAULT_REFRESH_LEAD,
    DEFAULT_STALE_SKEW, LoginCredentials,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport::Transport;

use crate::error::{Error, Result};
use crate::pipeline::RequestPipeline;
use crate::refresh::{RefreshCoordinator, RefreshObserver};

/// Shortest delay the proactive timer is armed with, so an already-stale
/// credential does not spin.
const MIN_TIMER_DELAY: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Staleness margin before `expires_at`.
    pub stale_skew: Duration,
    /// How long before expiry the proactive refresh fires.
    pub refresh_lead: Duration,
    /// Bound on a single refresh call.
    pub refresh_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stale_skew: DEFAULT_STALE_SKEW,
            refresh_lead: DEFAULT_REFRESH_LEAD,
            refresh_timeout: DEFAULT_ENDPOINT_TIMEOUT,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserLogout,
    Expired,
}

impl EndReason {
    /// Message suitable for showing to the user.
    pub fn message(&self) -> &'static str {
        match self {
            EndReason::UserLogout => "signed out",
            EndReason::Expired => "session expired, please sign in again",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    Refreshed { expires_at: u64 },
    Ended(EndReason),
}

/// Point-in-time view of the session for health and admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub authenticated: bool,
    pub refreshing: bool,
    pub expires_at: Option<u64>,
    pub user: Option<serde_json::Value>,
    pub ended: Option<EndReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active,
    Ended(EndReason),
}

struct SharedState {
    phase: Phase,
    user: Option<serde_json::Value>,
    timer: Option<JoinHandle<()>>,
}

/// The part of the session the coordinator calls back into.
struct SessionShared {
    clock: Arc<dyn Clock>,
    lead: Duration,
    state: std::sync::Mutex<SharedState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    fn state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn activate(&self, user: Option<serde_json::Value>) {
        let mut state = self.state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.phase = Phase::Active;
        state.user = user;
    }

    /// End an active session. Returns false if it was not active, so callers
    /// emit the `Ended` event exactly once.
    fn end(&self, reason: EndReason) -> bool {
        let mut state = self.state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.phase != Phase::Active {
            return false;
        }
        state.phase = Phase::Ended(reason);
        state.user = None;
        true
    }

    /// Replace the proactive timer with one for `pair`. No-op unless active.
    fn arm_timer(&self, coordinator: &Arc<RefreshCoordinator>, pair: CredentialPair) -> bool {
        let mut state = self.state();
        if state.phase != Phase::Active {
            return false;
        }

        let delay = timer_delay(pair.remaining(self.clock.now_millis()), self.lead);
        debug!(delay_secs = delay.as_secs(), expires_at = pair.expires_at, "arming proactive refresh");

        let coordinator = Arc::clone(coordinator);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("proactive refresh timer fired");
            if let Err(e) = coordinator.request_refresh(&pair).await {
                debug!(error = %e, "proactive refresh did not complete");
            }
        });
        if let Some(previous) = state.timer.replace(timer) {
            previous.abort();
        }
        true
    }
}

impl RefreshObserver for SessionShared {
    fn refreshed(&self, coordinator: &Arc<RefreshCoordinator>, pair: &CredentialPair) {
        if self.arm_timer(coordinator, pair.clone()) {
            self.emit(SessionEvent::Refreshed {
                expires_at: pair.expires_at,
            });
        }
    }

    fn expired(&self) {
        if self.end(EndReason::Expired) {
            info!("session expired after failed refresh");
            self.emit(SessionEvent::Ended(EndReason::Expired));
        }
    }
}

/// Delay until the proactive refresh: `lead` before expiry, or halfway to
/// expiry when less than `lead` remains.
fn timer_delay(remaining: Duration, lead: Duration) -> Duration {
    let delay = if remaining > lead {
        remaining - lead
    } else {
        remaining / 2
    };
    delay.max(MIN_TIMER_DELAY)
}

pub struct SessionManager {
    shared: Arc<SessionShared>,
    coordinator: Arc<RefreshCoordinator>,
    endpoint: Arc<dyn AuthEndpoint>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    skew: Duration,
}

impl SessionManager {
    pub fn new(
        endpoint: Arc<dyn AuthEndpoint>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(SessionShared {
            clock: clock.clone(),
            lead: settings.refresh_lead,
            state: std::sync::Mutex::new(SharedState {
                phase: Phase::Idle,
                user: None,
                timer: None,
            }),
            events,
        });
        let coordinator = Arc::new(
            RefreshCoordinator::new(
                endpoint.clone(),
                store.clone(),
                clock.clone(),
                settings.stale_skew,
                settings.refresh_timeout,
            )
            .with_observer(shared.clone()),
        );
        Self {
            shared,
            coordinator,
            endpoint,
            store,
            clock,
            skew: settings.stale_skew,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// A request pipeline over `transport` that shares this session's credentials.
    pub fn pipeline(&self, transport: Arc<dyn Transport>) -> RequestPipeline {
        RequestPipeline::new(transport, self.coordinator.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Exchange user credentials for a pair and start the session.
    ///
    /// Any refresh still in flight from a previous session is invalidated.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<SessionInfo> {
        let response = self
            .endpoint
            .login(credentials)
            .await
            .map_err(|e| Error::Login(e.to_string()))?;
        let pair = CredentialPair::from_token_response(&response, None, self.clock.now_millis())
            .map_err(|e| Error::Login(e.to_string()))?;

        self.coordinator.invalidate().await;
        self.store.set(pair.clone()).await.map_err(Error::storage)?;
        self.shared.activate(response.user.clone());
        self.schedule_proactive_refresh().await?;

        info!(email = %credentials.email, expires_at = pair.expires_at, "logged in");
        self.shared.emit(SessionEvent::LoggedIn);
        self.session().await
    }

    /// Adopt a pair left in a persistent store by an earlier run.
    ///
    /// Returns false when the store is empty.
    pub async fn restore(&self) -> Result<bool> {
        let Some(pair) = self.store.get().await.map_err(Error::storage)? else {
            debug!("no stored credential to restore");
            return Ok(false);
        };
        self.shared.activate(None);
        self.schedule_proactive_refresh().await?;
        info!(expires_at = pair.expires_at, "restored stored session");
        Ok(true)
    }

    /// Re-arm the proactive refresh timer from the stored pair.
    ///
    /// No-op when the store is empty or the session is not active.
    pub async fn schedule_proactive_refresh(&self) -> Result<()> {
        match self.store.get().await.map_err(Error::storage)? {
            Some(pair) => {
                self.shared.arm_timer(&self.coordinator, pair);
            }
            None => debug!("no credential, proactive refresh not scheduled"),
        }
        Ok(())
    }

    /// End the session at the user's request. Safe to call repeatedly; only
    /// the first call emits `Ended(UserLogout)` and revokes the token.
    pub async fn logout(&self) -> Result<()> {
        let first = self.shared.end(EndReason::UserLogout);
        self.coordinator.invalidate().await;

        let pair = match self.store.get().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "could not read credential before logout");
                None
            }
        };
        let cleared = self.store.clear().await;

        if first {
            info!("logged out");
            self.shared.emit(SessionEvent::Ended(EndReason::UserLogout));
            if let Some(pair) = pair {
                if let Err(e) = self.endpoint.revoke(pair.access_token.expose()).await {
                    warn!(error = %e, "token revocation failed");
                }
            }
        }
        cleared.map_err(Error::storage)
    }

    /// End the session because its credential can no longer be renewed.
    pub async fn on_force_logout(&self) -> Result<()> {
        let first = self.shared.end(EndReason::Expired);
        self.coordinator.invalidate().await;
        let cleared = self.store.clear().await;

        if first {
            warn!("session force-ended");
            self.shared.emit(SessionEvent::Ended(EndReason::Expired));
        }
        cleared.map_err(Error::storage)
    }

    pub async fn session(&self) -> Result<SessionInfo> {
        let pair = self.store.get().await.map_err(Error::storage)?;
        let refreshing = self.coordinator.is_refreshing().await;
        let fresh = pair
            .as_ref()
            .is_some_and(|p| !p.is_stale(self.clock.now_millis(), self.skew));

        let state = self.shared.state();
        let ended = match state.phase {
            Phase::Ended(reason) => Some(reason),
            Phase::Idle | Phase::Active => None,
        };
        Ok(SessionInfo {
            authenticated: fresh || refreshing,
            refreshing,
            expires_at: pair.map(|p| p.expires_at),
            user: state.user.clone(),
            ended,
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.state().timer.take() {
            timer.abort();
        }
    }
}
