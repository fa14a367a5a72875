//! Error types for credential storage and auth endpoint calls

/// Errors from credential storage and auth endpoint operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Storage-layer failure, as opposed to an endpoint failure.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Io(_) | Error::CredentialParse(_))
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
