//! Single-flight token refresh.
//!
//! When many requests are rejected with a 401 at the same time, exactly one
//! of them (the leader) calls the refresh endpoint. The rest join a FIFO
//! queue and are released with the leader's outcome once it settles, so a
//! rotating refresh token is spent only once per expiry event.
//!
//! ```text
//!            first refreshable 401
//!   Idle ─────────────────────────────▶ Refreshing
//!    ▲                                      │
//!    └──── settle (success or failure) ─────┘
//!          drains the queue in FIFO order
//! ```
//!
//! The `refreshing` flag and the queue live behind one mutex and are only
//! touched in short synchronous sections, never across an `.await`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

use crate::credentials::CredentialStore;
use crate::error::ClientError;
use crate::request::ApiRequest;
use crate::store::Secret;
use crate::transport::Transport;

/// Maximum number of body bytes kept in a [`RefreshError::Rejected`].
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Why a refresh cycle failed.
///
/// Cloneable so one failure can be handed to every queued request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// No refresh token is stored.
    #[error("no refresh token available")]
    MissingRefreshToken,

    /// The refresh call did not get a response.
    #[error("refresh request failed: {message}")]
    Network { message: String },

    /// The refresh endpoint answered with a non-success status.
    #[error("refresh rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The refresh endpoint answered without a complete token set.
    #[error("malformed refresh response: {message}")]
    MalformedResponse { message: String },

    /// The refresh call exceeded its deadline.
    #[error("refresh timed out after {after:?}")]
    TimedOut { after: Duration },

    /// The new tokens could not be persisted.
    #[error("failed to store refreshed tokens: {message}")]
    Storage { message: String },

    /// The task driving the refresh was dropped before it finished.
    #[error("refresh abandoned before completion")]
    Abandoned,
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Tokens were stored after a sign-in.
    SignedIn,
    /// A refresh succeeded and new tokens are stored.
    Refreshed,
    /// A refresh failed; tokens are cleared and the user must sign in again.
    Expired(RefreshError),
    /// Tokens were cleared on request.
    SignedOut,
}

/// A validated token set from an auth endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedTokens {
    pub access_token: Secret,
    pub refresh_token: Secret,
    /// Access-token lifetime in seconds, relative to receipt.
    pub expires_in_secs: i64,
}

/// The places a token set may appear in an auth response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenShape {
    /// `{ data: { tokens: { .. } } }`
    Nested,
    /// `{ accessToken, refreshToken, accessTokenExpiresIn }`
    Flat,
    /// `{ data: { accessToken, .. } }`
    DataWrapped,
}

impl TokenShape {
    const PREFERENCE: [TokenShape; 3] = [TokenShape::Nested, TokenShape::Flat, TokenShape::DataWrapped];

    fn locate(self, body: &Value) -> Option<&Value> {
        match self {
            TokenShape::Nested => body.pointer("/data/tokens"),
            TokenShape::Flat => Some(body),
            TokenShape::DataWrapped => body.get("data"),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenFields {
    access_token: Option<String>,
    refresh_token: Option<String>,
    access_token_expires_in: Option<Value>,
}

impl TokenFields {
    fn complete(self) -> Option<IssuedTokens> {
        let access_token = self.access_token.filter(|t| !t.is_empty())?;
        let refresh_token = self.refresh_token.filter(|t| !t.is_empty())?;
        let expires_in_secs = seconds(self.access_token_expires_in.as_ref()?)?;
        Some(IssuedTokens {
            access_token: Secret::new(access_token),
            refresh_token: Secret::new(refresh_token),
            expires_in_secs,
        })
    }
}

/// Accept JSON integers and finite floats that fit a `chrono::Duration`.
fn seconds(value: &Value) -> Option<i64> {
    let secs = match value.as_i64() {
        Some(secs) => secs,
        None => value
            .as_f64()
            .filter(|secs| secs.is_finite())
            .map(|secs| secs.trunc() as i64)?,
    };
    chrono::Duration::try_seconds(secs).map(|_| secs)
}

/// Extract a complete token set from an auth response body.
///
/// Shapes are tried in order: nested under `data.tokens`, flat on the body,
/// then flat under `data`. The first shape carrying a non-empty access token,
/// a non-empty refresh token and a numeric `accessTokenExpiresIn` wins.
/// Lifetimes too large for a `chrono::Duration` do not count as numeric.
pub fn parse_token_response(body: &Value) -> Result<IssuedTokens, RefreshError> {
    for shape in TokenShape::PREFERENCE {
        let Some(candidate) = shape.locate(body) else {
            continue;
        };
        let Ok(fields) = TokenFields::deserialize(candidate) else {
            continue;
        };
        if let Some(tokens) = fields.complete() {
            tracing::debug!("Parsed token response using {:?} shape", shape);
            return Ok(tokens);
        }
    }

    Err(RefreshError::MalformedResponse {
        message: "expected accessToken, refreshToken and numeric accessTokenExpiresIn".to_string(),
    })
}

/// Where and how to refresh.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Absolute URL of the refresh endpoint.
    pub refresh_url: String,
    /// Deadline for the refresh call.
    pub timeout: Duration,
    /// Attach the current (possibly expired) access token as a bearer header.
    pub send_access_token: bool,
}

type RefreshOutcome = Result<Secret, RefreshError>;

/// How a successful leader cycle obtained its token.
enum Cycle {
    /// The refresh endpoint issued new tokens.
    Refreshed(Secret),
    /// An earlier cycle already rotated the token the caller saw rejected.
    AlreadyRotated(Secret),
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

enum Role {
    Leader,
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

/// Coordinates token refreshes so at most one is in flight.
///
/// Each instance owns its own state; separate clients never share a queue.
pub struct RefreshCoordinator {
    credentials: Arc<CredentialStore>,
    transport: Arc<dyn Transport>,
    settings: RefreshSettings,
    state: Mutex<RefreshState>,
    events: broadcast::Sender<SessionEvent>,
}

impl RefreshCoordinator {
    pub fn new(
        credentials: Arc<CredentialStore>,
        transport: Arc<dyn Transport>,
        settings: RefreshSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            credentials,
            transport,
            settings,
            state: Mutex::new(RefreshState::default()),
            events,
        }
    }

    /// Receive session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.state.lock().refreshing
    }

    /// Number of requests waiting on the in-flight refresh.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Wait for a fresh access token and re-arm `request` with it.
    ///
    /// Joins the in-flight refresh if there is one, otherwise leads a new
    /// cycle. On failure the stored tokens are gone and the error is
    /// [`ClientError::SessionExpired`].
    pub async fn refresh_and_retry(&self, mut request: ApiRequest) -> Result<ApiRequest, ClientError> {
        let stale = request.sent_with().cloned();
        let token = self.refresh(stale).await?;
        request.authorize(Some(&token));
        Ok(request)
    }

    /// Obtain an access token newer than `stale`.
    ///
    /// `stale` is the token the caller saw rejected. If the stored token
    /// already differs from it, some earlier cycle rotated it and the stored
    /// token is returned without calling the refresh endpoint.
    pub async fn refresh(&self, stale: Option<Secret>) -> Result<Secret, RefreshError> {
        match self.join() {
            Role::Waiter(receiver) => {
                tracing::debug!("Refresh in flight, queueing request");
                receiver.await.unwrap_or(Err(RefreshError::Abandoned))
            }
            Role::Leader => {
                let guard = SettleGuard {
                    coordinator: self,
                    settled: false,
                };
                let cycle = self.run_cycle(stale.as_ref()).await;
                let event = match &cycle {
                    Ok(Cycle::Refreshed(_)) => Some(SessionEvent::Refreshed),
                    Ok(Cycle::AlreadyRotated(_)) => None,
                    Err(e) => Some(SessionEvent::Expired(e.clone())),
                };
                let outcome = cycle.map(|cycle| match cycle {
                    Cycle::Refreshed(token) | Cycle::AlreadyRotated(token) => token,
                });
                guard.settle(&outcome, event);
                outcome
            }
        }
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn join(&self) -> Role {
        let mut state = self.state.lock();
        if state.refreshing {
            let (sender, receiver) = oneshot::channel();
            state.queue.push_back(sender);
            Role::Waiter(receiver)
        } else {
            state.refreshing = true;
            Role::Leader
        }
    }

    fn settle(&self, outcome: &RefreshOutcome, event: Option<SessionEvent>) {
        let waiters = {
            let mut state = self.state.lock();
            state.refreshing = false;
            std::mem::take(&mut state.queue)
        };

        if !waiters.is_empty() {
            tracing::debug!("Releasing {} queued requests", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        if let Some(event) = event {
            self.publish(event);
        }
    }

    async fn run_cycle(&self, stale: Option<&Secret>) -> Result<Cycle, RefreshError> {
        let current = self.credentials.get_access_token().await;
        if let Some(current) = &current {
            if stale != Some(current) {
                tracing::debug!("Access token already rotated, skipping refresh");
                return Ok(Cycle::AlreadyRotated(current.clone()));
            }
        }

        let Some(refresh_token) = self.credentials.get_refresh_token().await else {
            tracing::warn!("No refresh token stored, ending session");
            self.credentials.clear_tokens().await;
            return Err(RefreshError::MissingRefreshToken);
        };

        tracing::info!("Refreshing access token");
        let issued = match tokio::time::timeout(
            self.settings.timeout,
            self.request_tokens(&refresh_token, current.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshError::TimedOut {
                after: self.settings.timeout,
            }),
        };

        let stored = match issued {
            Ok(IssuedTokens {
                access_token,
                refresh_token,
                expires_in_secs,
            }) => match self
                .credentials
                .store_tokens(access_token.expose(), refresh_token.expose(), expires_in_secs)
                .await
            {
                Ok(()) => Ok(access_token),
                Err(e) => Err(RefreshError::Storage {
                    message: e.to_string(),
                }),
            },
            Err(e) => Err(e),
        };

        match stored {
            Ok(access_token) => {
                tracing::info!("Access token refreshed");
                Ok(Cycle::Refreshed(access_token))
            }
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.credentials.clear_tokens().await;
                Err(e)
            }
        }
    }

    async fn request_tokens(
        &self,
        refresh_token: &Secret,
        access_token: Option<&Secret>,
    ) -> Result<IssuedTokens, RefreshError> {
        let mut request = ApiRequest::post(self.settings.refresh_url.clone())
            .json(json!({ "refreshToken": refresh_token.expose() }));
        if self.settings.send_access_token {
            request.authorize(access_token);
        }

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| RefreshError::Network { message: e.message })?;

        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
                body: truncate(&response.body),
            });
        }

        let body: Value = response
            .json()
            .map_err(|e| RefreshError::MalformedResponse {
                message: format!("body is not JSON: {}", e),
            })?;
        parse_token_response(&body)
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("settings", &self.settings)
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

/// Settles the cycle with [`RefreshError::Abandoned`] if the leader is
/// dropped mid-refresh, so no queued request waits forever.
struct SettleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl SettleGuard<'_> {
    fn settle(mut self, outcome: &RefreshOutcome, event: Option<SessionEvent>) {
        self.settled = true;
        self.coordinator.settle(outcome, event);
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Refresh leader dropped, failing queued requests");
            self.coordinator.settle(&Err(RefreshError::Abandoned), None);
        }
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}
