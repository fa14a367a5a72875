//! Retry eligibility for a completed transport attempt
//!
//! The pipeline decides what to do with a response by classifying it once,
//! explicitly, instead of inspecting error identity. Only a 401 on a first
//! attempt of a refresh-eligible request earns a refresh and one resend.

use transport::{Request, Response};

/// What the pipeline does with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Hand the response to the caller as-is (any status other than 401).
    Complete,
    /// Refresh the credential, then resend exactly once.
    RefreshAndRetry,
    /// 401 that must not be retried: surface it as a final error.
    Unauthorized,
}

/// Classify a response. `retried` is true when this response answers the
/// resend that followed a refresh.
pub fn classify(request: &Request, response: &Response, retried: bool) -> Attempt {
    if !response.is_unauthorized() {
        return Attempt::Complete;
    }
    if retried || request.refresh_exempt {
        return Attempt::Unauthorized;
    }
    Attempt::RefreshAndRetry
}
