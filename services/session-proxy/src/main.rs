//! Session Proxy
//!
//! Single-binary service that:
//! 1. Restores a persisted session or logs in with the configured account
//! 2. Listens for local requests
//! 3. Forwards them upstream through the authenticated request pipeline,
//!    which refreshes the bearer credential once per expiry however many
//!    requests hit it at the same moment
//! 4. Serves session admin endpoints, health, and Prometheus metrics

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::{CredentialStore, FileStore, HttpAuthEndpoint, MemoryStore, SystemClock};
use session_pipeline::{SessionEvent, SessionManager};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::HttpTransport;

use crate::admin::AdminState;
use crate::config::{AuthConfig, Config};
use crate::proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    session: Arc<SessionManager>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router: health, metrics, session admin, and the
/// forwarding fallback, under a concurrency limit of `max_connections`.
fn build_router(state: AppState, admin: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .merge(admin::build_admin_router(admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

async fn build_store(auth: &AuthConfig) -> Result<Arc<dyn CredentialStore>> {
    match &auth.credential_file {
        Some(path) => {
            let store = FileStore::load(path.clone())
                .await
                .with_context(|| format!("failed to load credential file {}", path.display()))?;
            info!(path = %path.display(), "using file credential store");
            Ok(Arc::new(store))
        }
        None => {
            info!("using in-memory credential store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        auth_url = %config.auth.base_url,
        "configuration loaded"
    );

    let client = reqwest::Client::new();
    let endpoint = Arc::new(HttpAuthEndpoint::new(
        client.clone(),
        config.auth.base_url.clone(),
        Duration::from_secs(config.auth.timeout_secs),
    ));
    let store = build_store(&config.auth).await?;
    let session = Arc::new(SessionManager::new(
        endpoint,
        store,
        Arc::new(SystemClock),
        config.auth.settings(),
    ));
    tokio::spawn(log_session_events(session.subscribe()));

    let credentials = config.auth.credentials();
    if session.restore().await.context("failed to read credential store")? {
        info!("session restored from credential file");
    } else if let Some(credentials) = &credentials {
        // A failed login is not fatal: the admin API can log in later
        match session.login(credentials).await {
            Ok(info) => info!(expires_at = ?info.expires_at, "logged in at start-up"),
            Err(e) => warn!(error = %e, "start-up login failed, waiting for POST /session/login"),
        }
    } else {
        info!("no credentials configured, waiting for POST /session/login");
    }

    let timeout = Duration::from_secs(config.proxy.timeout_secs);
    let transport = Arc::new(HttpTransport::new(client, config.proxy.upstream_url.clone(), timeout));

    let app_state = AppState {
        proxy: ProxyState {
            pipeline: Arc::new(session.pipeline(transport)),
            timeout,
        },
        session: session.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let admin_state = AdminState::new(session, credentials);

    let app = build_router(app_state, admin_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Log session transitions until the manager goes away.
async fn log_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::LoggedIn) => info!("session started"),
            Ok(SessionEvent::Refreshed { expires_at }) => info!(expires_at, "session credential renewed"),
            Ok(SessionEvent::Ended(reason)) => warn!(?reason, message = reason.message(), "session ended"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "session event log lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Health endpoint: 200 while the session is authenticated, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    let (status_code, body) = match state.session.session().await {
        Ok(info) if info.authenticated => (
            axum::http::StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "session": info,
                "uptime_seconds": uptime,
            }),
        ),
        Ok(info) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "session": info,
                "uptime_seconds": uptime,
            }),
        ),
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "error": e.to_string(),
                "uptime_seconds": uptime,
            }),
        ),
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that forwards everything else upstream.
async fn proxy_handler(State(state): State<AppState>, request: axum::http::Request<axum::body::Body>) -> Response {
    proxy::proxy_request(&state.proxy, request, error::new_request_id()).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use axum::routing::post;
    use session_auth::LoginCredentials;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    #[derive(Default)]
    struct MockAuth {
        refreshes: AtomicUsize,
        issued: AtomicUsize,
        revokes: AtomicUsize,
    }

    /// Mock credential-issuing service. Login hands out `at_0`; every refresh
    /// hands out the next `at_N` and keeps the refresh token.
    async fn start_auth_server(auth: Arc<MockAuth>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let app = Router::new()
            .route(
                "/auth/login",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["password"] != "good" {
                        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
                    }
                    Json(serde_json::json!({
                        "accessToken": "at_0",
                        "refreshToken": "rt_0",
                        "expiresIn": 300_000,
                        "user": { "email": body["email"] },
                    }))
                    .into_response()
                }),
            )
            .route(
                "/auth/refresh",
                post(
                    |State(auth): State<Arc<MockAuth>>, Json(body): Json<serde_json::Value>| async move {
                        auth.refreshes.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(body["refresh_token"], "rt_0");
                        // Hold the call open so concurrent 401s pile up behind it
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let n = auth.issued.fetch_add(1, Ordering::SeqCst) + 1;
                        Json(serde_json::json!({
                            "access_token": format!("at_{n}"),
                            "expires_in": 300,
                        }))
                    },
                ),
            )
            .route(
                "/auth/logout",
                post(|State(auth): State<Arc<MockAuth>>| async move {
                    auth.revokes.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }),
            )
            .with_state(auth);

        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        url
    }

    /// Mock upstream: rejects `at_0`, echoes the credential it saw otherwise.
    async fn start_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let app = Router::new().fallback(|request: Request<Body>| async move {
            let auth = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if auth.is_empty() || auth == "Bearer at_0" {
                return (StatusCode::UNAUTHORIZED, "token expired").into_response();
            }
            Json(serde_json::json!({
                "authorization": auth,
                "path": request.uri().path(),
                "query": request.uri().query().unwrap_or(""),
            }))
            .into_response()
        });

        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        url
    }

    struct TestApp {
        router: Router,
        auth: Arc<MockAuth>,
    }

    async fn test_app(default_credentials: Option<LoginCredentials>) -> TestApp {
        let auth = Arc::new(MockAuth::default());
        let auth_url = start_auth_server(auth.clone()).await;
        let upstream_url = start_upstream().await;

        let client = reqwest::Client::new();
        let endpoint = Arc::new(HttpAuthEndpoint::new(client.clone(), auth_url, Duration::from_secs(5)));
        let session = Arc::new(SessionManager::new(
            endpoint,
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            session_pipeline::SessionSettings::default(),
        ));
        let transport = Arc::new(HttpTransport::new(client, upstream_url, Duration::from_secs(5)));

        let state = AppState {
            proxy: ProxyState {
                pipeline: Arc::new(session.pipeline(transport)),
                timeout: Duration::from_secs(5),
            },
            session: session.clone(),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        let router = build_router(state, AdminState::new(session, default_credentials), 100);
        TestApp { router, auth }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn login_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/session/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_degraded_without_session() {
        let app = test_app(None).await;

        let response = app
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["session"]["authenticated"], false);
    }

    #[tokio::test]
    async fn proxy_without_session_is_not_authenticated() {
        let app = test_app(None).await;

        let response = app
            .router
            .oneshot(Request::get("/v1/items").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "not_authenticated");
        let request_id = json["error"]["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"), "got: {request_id}");
    }

    #[tokio::test]
    async fn bad_login_is_rejected() {
        let app = test_app(None).await;

        let response = app
            .router
            .oneshot(login_request(r#"{"email":"user@example.com","password":"nope"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["type"], "login_failed");
    }

    #[tokio::test]
    async fn empty_login_body_without_configured_credentials_is_bad_request() {
        let app = test_app(None).await;

        let response = app.router.oneshot(login_request("")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_refresh() {
        let app = test_app(Some(LoginCredentials::new("user@example.com", "good"))).await;

        // Empty body: configured credentials
        let response = app.router.clone().oneshot(login_request("")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authenticated"], true);
        assert_eq!(json["user"]["email"], "user@example.com");

        // Upstream rejects at_0, so every request hits 401 and needs the refresh
        let mut handles = Vec::new();
        for i in 0..5 {
            let router = app.router.clone();
            handles.push(tokio::spawn(async move {
                let request = Request::get(format!("/v1/items/{i}?verbose=1"))
                    .header(header::AUTHORIZATION, "Bearer client-supplied")
                    .body(Body::empty())
                    .unwrap();
                router.oneshot(request).await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["authorization"], "Bearer at_1");
            assert_eq!(json["path"], format!("/v1/items/{i}"));
            assert_eq!(json["query"], "verbose=1");
        }

        assert_eq!(app.auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn logout_ends_session() {
        let app = test_app(None).await;
        let response = app
            .router
            .clone()
            .oneshot(login_request(r#"{"email":"user@example.com","password":"good"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..2 {
            let response = app
                .router
                .clone()
                .oneshot(Request::post("/session/logout").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        // Revoke only on the first logout
        assert_eq!(app.auth.revokes.load(Ordering::SeqCst), 1);

        let response = app
            .router
            .oneshot(Request::get("/session").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["authenticated"], false);
        assert_eq!(json["ended"], "user_logout");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let app = test_app(None).await;

        let response = app
            .router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
