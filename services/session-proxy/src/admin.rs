//! Session admin API
//!
//! Endpoints:
//! - `POST /session/login`: log in with the body's credentials, or the configured ones
//! - `POST /session/logout`: end the session (idempotent)
//! - `GET /session`: current session snapshot

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use serde::Deserialize;
use session_auth::LoginCredentials;
use session_pipeline::SessionManager;
use tracing::{info, warn};

use crate::error::{error_response, new_request_id, pipeline_error_response};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    session: Arc<SessionManager>,
    default_credentials: Option<Arc<LoginCredentials>>,
}

impl AdminState {
    pub fn new(session: Arc<SessionManager>, default_credentials: Option<LoginCredentials>) -> Self {
        Self {
            session,
            default_credentials: default_credentials.map(Arc::new),
        }
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/session", get(session_status))
        .route("/session/login", post(login))
        .route("/session/logout", post(logout))
        .with_state(state)
}

fn json_ok(body: impl serde::Serialize) -> Response {
    match serde_json::to_string(&body) {
        Ok(body) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", &e.to_string(), &new_request_id()),
    }
}

/// POST /session/login
///
/// An empty body uses the credentials from the config file.
async fn login(State(state): State<AdminState>, body: Bytes) -> Response {
    let credentials = if body.is_empty() {
        match &state.default_credentials {
            Some(credentials) => credentials.as_ref().clone(),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "no credentials in request body and none configured",
                    &new_request_id(),
                );
            }
        }
    } else {
        match serde_json::from_slice::<LoginRequest>(&body) {
            Ok(req) => LoginCredentials::new(req.email, req.password),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid JSON: {e}"),
                    &new_request_id(),
                );
            }
        }
    };

    match state.session.login(&credentials).await {
        Ok(info) => {
            info!(email = %credentials.email, "login via admin API");
            json_ok(info)
        }
        Err(e) => {
            warn!(error = %e, "login via admin API failed");
            pipeline_error_response(&e, &new_request_id())
        }
    }
}

/// POST /session/logout
async fn logout(State(state): State<AdminState>) -> Response {
    match state.session.logout().await {
        Ok(()) => json_ok(serde_json::json!({ "status": "logged_out" })),
        Err(e) => pipeline_error_response(&e, &new_request_id()),
    }
}

/// GET /session
async fn session_status(State(state): State<AdminState>) -> Response {
    match state.session.session().await {
        Ok(info) => json_ok(info),
        Err(e) => pipeline_error_response(&e, &new_request_id()),
    }
}
