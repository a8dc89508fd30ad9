//! Cache for exchanged OAuth bearer tokens.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use switchboard_types::Result;
use tokio::sync::RwLock;

/// Tokens this close to expiry are treated as already expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub token: String,
    pub obtained_at: DateTime<Utc>,
    /// `None` when the issuer did not report a lifetime.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    pub fn new(token: impl Into<String>, expires_in_secs: Option<i64>) -> Self {
        Self::obtained(token, Utc::now(), expires_in_secs)
    }

    pub fn obtained(
        token: impl Into<String>,
        obtained_at: DateTime<Utc>,
        expires_in_secs: Option<i64>,
    ) -> Self {
        Self {
            token: token.into(),
            obtained_at,
            expires_at: expires_in_secs
                .filter(|s| *s > 0)
                .map(|s| obtained_at + Duration::seconds(s)),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now + Duration::seconds(EXPIRY_MARGIN_SECS) >= at,
            None => false,
        }
    }
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("token", &"***")
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Holds at most one live token. Safe to share across concurrent calls;
/// two callers racing on an empty cache may both fetch, and the later
/// store wins.
#[derive(Debug, Default)]
pub struct CredentialCache {
    slot: RwLock<Option<CachedToken>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token, unless it is missing or expired.
    pub async fn get(&self) -> Option<String> {
        let now = Utc::now();
        self.slot
            .read()
            .await
            .as_ref()
            .filter(|t| !t.is_expired_at(now))
            .map(|t| t.token.clone())
    }

    pub async fn store(&self, token: CachedToken) {
        tracing::debug!(expires_at = ?token.expires_at, "caching access token");
        *self.slot.write().await = Some(token);
    }

    pub async fn invalidate(&self) {
        if self.slot.write().await.take().is_some() {
            tracing::debug!("access token invalidated");
        }
    }

    /// Return the cached token or run `fetch` and cache its result.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken>>,
    {
        if let Some(token) = self.get().await {
            return Ok(token);
        }
        let fresh = fetch().await?;
        let token = fresh.token.clone();
        self.store(fresh).await;
        Ok(token)
    }
}
