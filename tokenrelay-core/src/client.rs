//! Authenticated API client.
//!
//! [`ApiClient`] is the only surface callers need: hand it an
//! [`ApiRequest`] and it attaches the stored bearer token, sends the request
//! and, on a refreshable 401, refreshes the session once and replays the
//! request with the new token.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), tokenrelay_core::ClientError> {
//! use std::sync::Arc;
//! use tokenrelay_core::{ApiClient, ApiRequest, ClientConfig, MemoryStore};
//!
//! let config = ClientConfig::new("https://api.example.com".parse().unwrap());
//! let client = ApiClient::new(config, Arc::new(MemoryStore::new()))?;
//!
//! client.set_tokens("access", "refresh", 3600).await?;
//! let profile = client.request(ApiRequest::get("/profile")).await?;
//! println!("{}", profile.body);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::ClientError;
use crate::pipeline::{Disposition, RequestPipeline, ResponsePipeline};
use crate::refresh::{parse_token_response, RefreshCoordinator, RefreshSettings, SessionEvent};
use crate::request::{ApiRequest, ApiResponse};
use crate::store::{MemoryStore, SecretStore};
use crate::transport::{ReqwestTransport, Transport};

/// Bearer-token API client with single-flight refresh.
///
/// Clone is cheap and clones share tokens, refresh state and connections.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    credentials: Arc<CredentialStore>,
    requests: RequestPipeline,
    responses: ResponsePipeline,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    /// Client over `backend` using the reqwest transport and the system clock.
    pub fn new(config: ClientConfig, backend: Arc<dyn SecretStore>) -> Result<Self, ClientError> {
        Self::builder(config).store(backend).build()
    }

    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            store: None,
            transport: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Direct access to the stored credentials.
    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    /// Receive [`SessionEvent`]s, e.g. to route the user to sign-in on expiry.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.coordinator.subscribe()
    }

    /// Send `request` with the stored access token.
    ///
    /// A 401 from a non-auth endpoint triggers one refresh (shared with any
    /// other request failing at the same time) and one replay. A second 401
    /// is returned as [`ClientError::Http`]; a failed refresh as
    /// [`ClientError::SessionExpired`].
    pub async fn request(&self, mut request: ApiRequest) -> Result<ApiResponse, ClientError> {
        request.url = self.inner.config.resolve(&request.url)?;

        if self.inner.config.proactive_refresh {
            self.refresh_if_expiring().await?;
        }

        let mut request = self.inner.requests.prepare(request).await;
        loop {
            let outcome = self.inner.requests.send(&request).await;
            match self.inner.responses.classify(&mut request, outcome) {
                Disposition::Deliver(response) => return Ok(response),
                Disposition::Fail(e) => return Err(e),
                Disposition::Refresh => {
                    tracing::debug!("401 for {} {}, refreshing", request.method, request.url);
                    request = self.inner.coordinator.refresh_and_retry(request).await?;
                }
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ClientError> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse, ClientError> {
        self.request(ApiRequest::post(path).json(body)).await
    }

    /// Post `credentials` to the sign-in endpoint and store the issued tokens.
    ///
    /// The response must carry a token set in one of the shapes accepted by
    /// [`parse_token_response`]. It is returned so callers can read any
    /// profile data alongside the tokens.
    pub async fn sign_in(&self, credentials: Value) -> Result<ApiResponse, ClientError> {
        let request = ApiRequest::post(self.inner.config.login_url()?).json(credentials);
        let response = self.inner.requests.send(&request).await?;

        if !response.is_success() {
            return Err(ClientError::Http {
                status: response.status,
                body: response.body,
            });
        }

        let body: Value = response.json().map_err(|e| ClientError::InvalidResponse {
            message: format!("sign-in response is not JSON: {}", e),
        })?;
        let tokens = parse_token_response(&body).map_err(|e| ClientError::InvalidResponse {
            message: e.to_string(),
        })?;

        self.inner
            .credentials
            .store_tokens(
                tokens.access_token.expose(),
                tokens.refresh_token.expose(),
                tokens.expires_in_secs,
            )
            .await?;

        tracing::info!("Signed in");
        self.inner.coordinator.publish(SessionEvent::SignedIn);
        Ok(response)
    }

    /// Store tokens obtained elsewhere.
    pub async fn set_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: i64,
    ) -> Result<(), ClientError> {
        self.inner
            .credentials
            .store_tokens(access_token, refresh_token, expires_in_secs)
            .await?;
        self.inner.coordinator.publish(SessionEvent::SignedIn);
        Ok(())
    }

    /// Forget all tokens.
    pub async fn sign_out(&self) {
        self.inner.credentials.clear_tokens().await;
        tracing::info!("Signed out");
        self.inner.coordinator.publish(SessionEvent::SignedOut);
    }

    /// Refresh the session now, joining any refresh already in flight.
    pub async fn refresh_now(&self) -> Result<(), ClientError> {
        let current = self.inner.credentials.get_access_token().await;
        self.inner.coordinator.refresh(current).await?;
        Ok(())
    }

    async fn refresh_if_expiring(&self) -> Result<(), ClientError> {
        let credentials = &self.inner.credentials;
        if !credentials.should_proactively_refresh().await {
            return Ok(());
        }
        // Signed-out callers go out unauthenticated rather than failing here.
        if credentials.get_refresh_token().await.is_none() {
            return Ok(());
        }

        tracing::debug!("Access token about to expire, refreshing before dispatch");
        self.refresh_now().await
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.config.base_url.as_str())
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

/// Builder for [`ApiClient`] with swappable store, transport and clock.
pub struct ApiClientBuilder {
    config: ClientConfig,
    store: Option<Arc<dyn SecretStore>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ApiClientBuilder {
    /// Credential backend. Defaults to a [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// HTTP transport. Defaults to [`ReqwestTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Clock used for token expiry. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<ApiClient, ClientError> {
        let config = self.config;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(config.request_timeout())?),
        };
        let store: Arc<dyn SecretStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        let credentials = Arc::new(
            CredentialStore::new(store)
                .with_clock(clock)
                .with_key_prefix(&config.key_prefix)
                .with_proactive_margin(config.proactive_margin()?),
        );

        let coordinator = RefreshCoordinator::new(
            credentials.clone(),
            transport.clone(),
            RefreshSettings {
                refresh_url: config.refresh_url()?,
                timeout: config.refresh_timeout(),
                send_access_token: config.send_access_token_on_refresh,
            },
        );

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                requests: RequestPipeline::new(credentials.clone(), transport),
                responses: ResponsePipeline::new(config.refresh_exclusions()),
                credentials,
                coordinator,
                config,
            }),
        })
    }
}
