//! Authenticated request pipeline with single-flight credential refresh
//!
//! Wraps a `Transport` so every outbound call carries the current bearer
//! credential, and a 401 triggers at most one refresh no matter how many
//! calls hit it at once. The session manager owns login/logout and keeps a
//! proactive refresh timer armed ahead of expiry.
//!
//! Request lifecycle:
//! 1. `RequestPipeline::send()` reads the pair from the `CredentialStore`
//! 2. Stale pair → `RefreshCoordinator::request_refresh()` before sending
//! 3. Transport returns 401 → `request_refresh()`, resend once, result is final
//! 4. Refresh fails → every waiter gets `AuthExpired`, store cleared,
//!    `SessionManager` ends the session with `EndReason::Expired`
//! 5. Timer fires `lead` before expiry → same `request_refresh()` path

pub mod attempt;
pub mod error;
pub mod pipeline;
pub mod refresh;
pub mod session;

#[cfg(test)]
mod test_support;

pub use attempt::{Attempt, classify};
pub use error::{Error, Result};
pub use pipeline::RequestPipeline;
pub use refresh::{RefreshCoordinator, RefreshObserver};
pub use session::{EndReason, SessionEvent, SessionInfo, SessionManager, SessionSettings};
