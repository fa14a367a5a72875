//! Defaults for credential timing and the auth endpoint paths

use std::time::Duration;

/// Safety margin subtracted from `expires_at` when deciding staleness, so a
/// credential that is valid at check time is still valid when it reaches
/// the server.
pub const DEFAULT_STALE_SKEW: Duration = Duration::from_secs(30);

/// How far ahead of expiry the proactive refresh timer fires.
pub const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(60);

/// Upper bound on a single login or refresh call.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(15);

/// Login endpoint, relative to the auth base URL.
pub const LOGIN_PATH: &str = "/auth/login";

/// Refresh endpoint, relative to the auth base URL.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Server-side logout (token revocation), relative to the auth base URL.
pub const LOGOUT_PATH: &str = "/auth/logout";
