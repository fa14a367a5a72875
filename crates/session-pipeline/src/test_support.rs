//! Scripted auth server and transport for unit tests
//!
//! `FakeAuthServer` issues tokens against a shared clock and remembers which
//! access tokens are valid; `FakeTransport` answers 401 for anything the
//! server would reject and 200 (body = the bearer token) otherwise.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use session_auth::{
    AuthEndpoint, Clock, CredentialPair, Error as AuthError, LoginCredentials, MonotonicClock,
    TokenResponse,
};
use transport::{Request, Response, StatusCode, Transport, TransportError};

/// Unix-millisecond anchor for test clocks.
pub const T0: u64 = 1_700_000_000_000;

pub fn test_clock() -> Arc<MonotonicClock> {
    Arc::new(MonotonicClock::starting_at(T0))
}

#[derive(Default)]
struct Issued {
    access: HashMap<String, u64>,
    refresh: HashSet<String>,
}

pub struct FakeAuthServer {
    clock: Arc<dyn Clock>,
    lifetime: Duration,
    issued: Mutex<Issued>,
    serial: AtomicUsize,
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    pub refresh_fails: AtomicBool,
    pub refresh_delay: Mutex<Duration>,
}

impl FakeAuthServer {
    pub fn new(clock: Arc<dyn Clock>, lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            lifetime,
            issued: Mutex::new(Issued::default()),
            serial: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            refresh_fails: AtomicBool::new(false),
            refresh_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn issue_token(&self, expires_at: u64) -> TokenResponse {
        let n = self.serial.fetch_add(1, Ordering::SeqCst);
        let access = format!("at_{n}");
        let refresh = format!("rt_{n}");
        let mut issued = self.issued.lock().unwrap();
        issued.access.insert(access.clone(), expires_at);
        issued.refresh.insert(refresh.clone());
        let now = self.clock.now_millis();
        TokenResponse {
            access_token: access,
            refresh_token: Some(refresh),
            expires_in: None,
            expires_in_ms: Some(expires_at.saturating_sub(now)),
            user: Some(serde_json::json!({"email": "user@example.com"})),
        }
    }

    /// Issue a pair expiring `valid_for` from now, as if from an earlier login.
    pub fn issue(&self, valid_for: Duration) -> CredentialPair {
        let now = self.clock.now_millis();
        let response = self.issue_token(now + valid_for.as_millis() as u64);
        CredentialPair::from_token_response(&response, None, now).unwrap()
    }

    /// Server-side revocation: the token keeps its local expiry but gets 401s.
    pub fn revoke_access(&self, pair: &CredentialPair) {
        self.issued
            .lock()
            .unwrap()
            .access
            .remove(pair.access_token.expose());
    }

    pub fn accepts(&self, access: &str) -> bool {
        let now = self.clock.now_millis();
        self.issued
            .lock()
            .unwrap()
            .access
            .get(access)
            .is_some_and(|expires_at| now < *expires_at)
    }
}

impl AuthEndpoint for FakeAuthServer {
    fn login<'a>(
        &'a self,
        credentials: &'a LoginCredentials,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            if credentials.password.expose() != "good" {
                return Err(AuthError::InvalidCredentials("bad password".into()));
            }
            let now = self.clock.now_millis();
            Ok(self.issue_token(now + self.lifetime.as_millis() as u64))
        })
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.refresh_fails.load(Ordering::SeqCst) {
                return Err(AuthError::InvalidCredentials("refresh token revoked".into()));
            }
            // Rotation: a refresh token is single-use
            if !self.issued.lock().unwrap().refresh.remove(refresh_token) {
                return Err(AuthError::InvalidCredentials("unknown refresh token".into()));
            }
            let now = self.clock.now_millis();
            Ok(self.issue_token(now + self.lifetime.as_millis() as u64))
        })
    }

    fn revoke<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.revoke_calls.fetch_add(1, Ordering::SeqCst);
            self.issued.lock().unwrap().access.remove(access_token);
            Ok(())
        })
    }
}

/// Transport answering on behalf of `FakeAuthServer`.
pub struct FakeTransport {
    server: Arc<FakeAuthServer>,
    pub calls: AtomicUsize,
    pub unauthorized_calls: AtomicUsize,
    pub always_unauthorized: AtomicBool,
    pub fail_with: Mutex<Option<TransportError>>,
    pub latency: Duration,
}

impl FakeTransport {
    pub fn with_latency(server: Arc<FakeAuthServer>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            server,
            calls: AtomicUsize::new(0),
            unauthorized_calls: AtomicUsize::new(0),
            always_unauthorized: AtomicBool::new(false),
            fail_with: Mutex::new(None),
            latency,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn unauthorized_count(&self) -> usize {
        self.unauthorized_calls.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    fn send(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = transport::Result<Response>> + Send + '_>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            let token = request
                .headers
                .get(transport::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .unwrap_or("")
                .to_string();

            if self.always_unauthorized.load(Ordering::SeqCst) || !self.server.accepts(&token) {
                self.unauthorized_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(Response::new(StatusCode::UNAUTHORIZED, "token rejected"));
            }
            Ok(Response::new(StatusCode::OK, token))
        })
    }
}
