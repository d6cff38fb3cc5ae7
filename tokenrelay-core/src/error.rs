//! Errors surfaced to callers of [`ApiClient`](crate::ApiClient).

use reqwest::StatusCode;
use thiserror::Error;

use crate::refresh::RefreshError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Error type for authorized requests.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No response was received. Never retried.
    #[error("network error: {message}")]
    Network { message: String },

    /// The server answered with a non-success status.
    ///
    /// Also covers a 401 from an excluded endpoint and a 401 on a request
    /// that was already replayed once.
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    /// The token refresh failed and stored tokens were cleared.
    ///
    /// Terminal for the session: callers should send the user back to sign in.
    #[error("session expired: {0}")]
    SessionExpired(#[from] RefreshError),

    /// The server answered successfully but the body was not what the
    /// operation needed.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Tokens could not be written to the credential store.
    #[error("credential storage error: {0}")]
    Store(#[from] StoreError),

    /// The request could not be built (for example an unparseable URL).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl ClientError {
    /// Whether the caller should treat this as a lost session.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ClientError::SessionExpired(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        ClientError::Network { message: e.message }
    }
}
