//! Durable access/refresh token storage.
//!
//! [`CredentialStore`] owns the credential triple (access token, refresh
//! token, absolute access-token expiry) on top of any [`SecretStore`]
//! backend. Reads never fail: a backend error is logged and reported as an
//! absent value, so a broken keyring degrades into an unauthenticated
//! request instead of an error.
//!
//! Writes of the triple happen under an exclusive lock, and readers take the
//! shared side of the same lock, so no reader in this process can observe a
//! half-written triple.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::store::{Secret, SecretStore, StoreError};

/// Default lead time used by [`CredentialStore::should_proactively_refresh`].
pub const DEFAULT_PROACTIVE_MARGIN_SECS: i64 = 60;

/// Default namespace for credential keys.
pub const DEFAULT_KEY_PREFIX: &str = "tokenrelay";

/// A point-in-time view of the stored credentials.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    pub access_token: Option<Secret>,
    pub refresh_token: Option<Secret>,
    /// Absolute expiry of the access token.
    pub access_expires_at: Option<DateTime<Utc>>,
}

/// Storage keys for the credential triple.
#[derive(Debug, Clone)]
struct CredentialKeys {
    access: String,
    refresh: String,
    expires_at: String,
}

impl CredentialKeys {
    fn new(prefix: &str) -> Self {
        Self {
            access: format!("{}/access_token", prefix),
            refresh: format!("{}/refresh_token", prefix),
            expires_at: format!("{}/access_expires_at", prefix),
        }
    }

    fn all(&self) -> [&str; 3] {
        [&self.access, &self.refresh, &self.expires_at]
    }
}

/// Access token, refresh token and expiry, persisted through a [`SecretStore`].
pub struct CredentialStore {
    backend: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    keys: CredentialKeys,
    proactive_margin: Duration,
    triple: RwLock<()>,
}

impl CredentialStore {
    /// Create a credential store over `backend` using the system clock.
    pub fn new(backend: Arc<dyn SecretStore>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            keys: CredentialKeys::new(DEFAULT_KEY_PREFIX),
            proactive_margin: Duration::seconds(DEFAULT_PROACTIVE_MARGIN_SECS),
            triple: RwLock::new(()),
        }
    }

    /// Use a different clock (tests inject a [`ManualClock`](crate::ManualClock)).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Namespace the storage keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.keys = CredentialKeys::new(prefix);
        self
    }

    /// Set the lead time for [`should_proactively_refresh`](Self::should_proactively_refresh).
    pub fn with_proactive_margin(mut self, margin: Duration) -> Self {
        self.proactive_margin = margin;
        self
    }

    /// The current access token, or `None` if absent or unreadable.
    pub async fn get_access_token(&self) -> Option<Secret> {
        let _guard = self.triple.read().await;
        self.read(&self.keys.access).await
    }

    /// The current refresh token, or `None` if absent or unreadable.
    pub async fn get_refresh_token(&self) -> Option<Secret> {
        let _guard = self.triple.read().await;
        self.read(&self.keys.refresh).await
    }

    /// The absolute access-token expiry, or `None` if absent or unparseable.
    pub async fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        let _guard = self.triple.read().await;
        self.read_expiry().await
    }

    /// Read the whole triple under a single lock.
    pub async fn snapshot(&self) -> Credentials {
        let _guard = self.triple.read().await;
        Credentials {
            access_token: self.read(&self.keys.access).await,
            refresh_token: self.read(&self.keys.refresh).await,
            access_expires_at: self.read_expiry().await,
        }
    }

    /// Persist a freshly issued token pair.
    ///
    /// The expiry is stored as the absolute time `now + max(0, expires_in_secs)`.
    /// A lifetime that overflows the calendar is rejected before anything is
    /// written. If any write fails the triple is removed again so readers
    /// never see a mix of old and new values.
    pub async fn store_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: i64,
    ) -> Result<(), StoreError> {
        let expires_at = Duration::try_seconds(expires_in_secs.max(0))
            .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
            .ok_or_else(|| StoreError::InvalidValue {
                message: format!("token lifetime of {}s is out of range", expires_in_secs),
            })?;
        let expires_at_millis = Secret::new(expires_at.timestamp_millis().to_string());

        let _guard = self.triple.write().await;
        let written = async {
            self.backend
                .set(&self.keys.access, &Secret::new(access_token))
                .await?;
            self.backend
                .set(&self.keys.refresh, &Secret::new(refresh_token))
                .await?;
            self.backend
                .set(&self.keys.expires_at, &expires_at_millis)
                .await
        }
        .await;

        if let Err(e) = written {
            tracing::error!("Failed to persist tokens, discarding partial write: {}", e);
            self.remove_all().await;
            return Err(e);
        }

        tracing::debug!("Stored tokens expiring at {}", expires_at);
        Ok(())
    }

    /// Remove the whole triple. Backend errors are logged and swallowed.
    pub async fn clear_tokens(&self) {
        let _guard = self.triple.write().await;
        self.remove_all().await;
        tracing::debug!("Cleared stored tokens");
    }

    /// `true` if no expiry is stored or it has passed.
    pub async fn is_expired(&self) -> bool {
        match self.access_expires_at().await {
            Some(expires_at) => self.clock.now() >= expires_at,
            None => true,
        }
    }

    /// `true` if the access token expires within the proactive margin.
    ///
    /// Advisory: callers can use this to refresh before dispatching a request
    /// that would otherwise be answered with a 401.
    pub async fn should_proactively_refresh(&self) -> bool {
        match self.access_expires_at().await {
            Some(expires_at) => self.clock.now() >= expires_at - self.proactive_margin,
            None => true,
        }
    }

    async fn read(&self, key: &str) -> Option<Secret> {
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", key, e);
                None
            }
        }
    }

    async fn read_expiry(&self) -> Option<DateTime<Utc>> {
        let raw = self.read(&self.keys.expires_at).await?;
        let millis = raw.expose().parse::<i64>().ok()?;
        DateTime::from_timestamp_millis(millis)
    }

    async fn remove_all(&self) {
        for key in self.keys.all() {
            if let Err(e) = self.backend.delete(key).await {
                tracing::warn!("Failed to remove {}: {}", key, e);
            }
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("keys", &self.keys)
            .field("proactive_margin", &self.proactive_margin)
            .finish()
    }
}
