//! Credential pair and the store that owns it
//!
//! The store is the only owner of the current pair. Everything else reads a
//! clone and writes back through `set`/`clear`. Two implementations:
//! `MemoryStore` for processes that re-login on start, and `FileStore`, a
//! JSON file written with atomic temp-file + rename so a crash mid-write
//! never leaves a truncated credential behind.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// Access/refresh credentials plus their absolute expiry.
///
/// `expires_at` is a unix timestamp in milliseconds. Tokens are wrapped in
/// `Secret` so a stray `{:?}` never leaks them into logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: u64,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>, expires_at: u64) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
            expires_at,
        }
    }

    /// Build a pair from a token endpoint response received at `now_millis`.
    ///
    /// The response lifetime is a delta from `now_millis`. When the response
    /// omits the refresh token (servers that keep the refresh token stable
    /// across refreshes), `previous_refresh` is carried over. A lifetime that
    /// overflows the absolute timestamp is a `TokenExchange` error.
    pub fn from_token_response(
        response: &TokenResponse,
        previous_refresh: Option<&Secret<String>>,
        now_millis: u64,
    ) -> Result<Self> {
        let refresh_token = match (&response.refresh_token, previous_refresh) {
            (Some(fresh), _) if !fresh.is_empty() => Secret::new(fresh.clone()),
            (_, Some(previous)) => previous.clone(),
            _ => {
                return Err(Error::TokenExchange(
                    "token response carried no refresh token".into(),
                ));
            }
        };
        if response.access_token.is_empty() {
            return Err(Error::TokenExchange(
                "token response carried an empty access token".into(),
            ));
        }
        let lifetime = response.lifetime_millis()?;
        let expires_at = now_millis
            .checked_add(lifetime)
            .ok_or_else(|| Error::TokenExchange(format!("token lifetime out of range: {lifetime}ms")))?;
        Ok(Self {
            access_token: Secret::new(response.access_token.clone()),
            refresh_token,
            expires_at,
        })
    }

    pub fn is_stale(&self, now_millis: u64, skew: Duration) -> bool {
        is_stale(self, now_millis, skew)
    }

    /// Time left before `expires_at`, zero once passed.
    pub fn remaining(&self, now_millis: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_millis))
    }
}

/// True when `now >= expires_at - skew`.
pub fn is_stale(pair: &CredentialPair, now_millis: u64, skew: Duration) -> bool {
    now_millis >= pair.expires_at.saturating_sub(skew.as_millis() as u64)
}

/// Get/set/clear capability over the single current credential pair.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn CredentialStore>`).
/// Persistence failures come back as `Error::Io` / `Error::CredentialParse`.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>>;

    /// Atomically replace the current pair.
    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<CredentialPair>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            state: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>> {
        Box::pin(async move { Ok(self.state.lock().await.clone()) })
    }

    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.lock().await = Some(pair);
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.state.lock().await.take();
            Ok(())
        })
    }
}

/// JSON-file store with an in-memory copy.
///
/// The Mutex serializes writes; reads clone the in-memory copy so they never
/// touch the disk. A missing file is an empty store.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<Option<CredentialPair>>,
}

impl FileStore {
    /// Load the credential file if it exists.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let pair: CredentialPair = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), expires_at = pair.expires_at, "loaded stored credential");
            Some(pair)
        } else {
            info!(path = %path.display(), "credential file not found, starting unauthenticated");
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>> {
        Box::pin(async move { Ok(self.state.lock().await.clone()) })
    }

    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            // Disk first: a failed write leaves the previous pair in place
            write_atomic(&self.path, &pair).await?;
            *state = Some(pair);
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.take();
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!(path = %self.path.display(), "removed credential file");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
            }
        })
    }
}

/// Write the credential pair atomically with 0600 permissions.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target.
async fn write_atomic(path: &Path, pair: &CredentialPair) -> Result<()> {
    let json = serde_json::to_string_pretty(pair)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}
