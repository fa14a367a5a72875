//! Error types for pipeline and session operations

use transport::{Response, TransportError};

/// Errors surfaced to callers of the pipeline and session manager.
///
/// `Clone` because one refresh outcome is handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Final 401: the request was already retried once, or is exempt from refresh.
    #[error("unauthorized ({})", .0.status)]
    Unauthorized(Box<Response>),

    #[error("session expired, please sign in again")]
    AuthExpired,

    #[error("credential storage error: {0}")]
    Storage(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("login failed: {0}")]
    Login(String),
}

impl Error {
    /// Map a credential store failure. Never conflated with `AuthExpired`.
    pub fn storage(e: session_auth::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
