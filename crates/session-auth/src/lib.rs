//! Credential data and auth endpoint access
//!
//! Holds everything the refresh machinery consumes but does not decide:
//! the credential pair and its staleness rule, the credential store
//! capability (memory and JSON-file implementations), a clock, and the
//! login/refresh/revoke endpoint capability with its HTTP implementation.
//!
//! Credential flow:
//! 1. Session calls `AuthEndpoint::login()` with the user's credentials
//! 2. The `TokenResponse` becomes a `CredentialPair` via `CredentialPair::from_token_response()`
//! 3. The pair is written through `CredentialStore::set()`
//! 4. The coordinator calls `AuthEndpoint::refresh()` when the pair goes stale
//! 5. Logout calls `CredentialStore::clear()` and, best effort, `AuthEndpoint::revoke()`

pub mod clock;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use clock::{Clock, MonotonicClock, SystemClock};
pub use constants::*;
pub use credentials::{CredentialPair, CredentialStore, FileStore, MemoryStore, is_stale};
pub use error::{Error, Result};
pub use token::{AuthEndpoint, HttpAuthEndpoint, LoginCredentials, TokenResponse};
