//! Outbound token injection and inbound failure classification.

use std::sync::Arc;

use reqwest::StatusCode;
use url::Url;

use crate::credentials::CredentialStore;
use crate::error::ClientError;
use crate::request::{ApiRequest, ApiResponse};
use crate::transport::{Transport, TransportError};

/// Attaches the stored access token and hands requests to the transport.
pub struct RequestPipeline {
    credentials: Arc<CredentialStore>,
    transport: Arc<dyn Transport>,
}

impl RequestPipeline {
    pub fn new(credentials: Arc<CredentialStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            credentials,
            transport,
        }
    }

    /// Authorize `request` with the current access token.
    ///
    /// With no stored token the request goes out unauthenticated.
    pub async fn prepare(&self, mut request: ApiRequest) -> ApiRequest {
        let token = self.credentials.get_access_token().await;
        if token.is_none() {
            tracing::debug!("No access token stored, sending {} unauthenticated", request.url);
        }
        request.authorize(token.as_ref());
        request
    }

    /// Dispatch without any retry.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.transport.send(request).await
    }
}

/// What to do with a completed exchange.
#[derive(Debug)]
pub enum Disposition {
    /// Hand the response to the caller.
    Deliver(ApiResponse),
    /// Fail the call with this error.
    Fail(ClientError),
    /// Refreshable 401: refresh the session and replay the request.
    Refresh,
}

/// Decides whether a failed exchange is eligible for refresh-and-retry.
#[derive(Debug, Clone)]
pub struct ResponsePipeline {
    excluded_endpoints: Vec<String>,
}

impl ResponsePipeline {
    /// `excluded_endpoints` are URL path substrings whose 401s are never refreshed.
    pub fn new(excluded_endpoints: Vec<String>) -> Self {
        Self { excluded_endpoints }
    }

    /// Whether `url` belongs to an authentication endpoint.
    ///
    /// Only the path is matched, so a host or query string that happens to
    /// contain `login` does not disable refresh.
    pub fn is_excluded(&self, url: &str) -> bool {
        let path = request_path(url);
        self.excluded_endpoints
            .iter()
            .any(|endpoint| !endpoint.is_empty() && path.contains(endpoint.as_str()))
    }

    /// Classify the outcome of sending `request`.
    ///
    /// A refreshable 401 marks the request as retried before returning
    /// [`Disposition::Refresh`], so the same request is never refreshed twice.
    pub fn classify(
        &self,
        request: &mut ApiRequest,
        outcome: Result<ApiResponse, TransportError>,
    ) -> Disposition {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => return Disposition::Fail(e.into()),
        };

        if response.is_success() {
            return Disposition::Deliver(response);
        }

        if response.status != StatusCode::UNAUTHORIZED {
            return Disposition::Fail(http_error(response));
        }

        if self.is_excluded(&request.url) {
            tracing::debug!("401 from auth endpoint {}, not refreshing", request.url);
            return Disposition::Fail(http_error(response));
        }

        if request.is_retried() {
            tracing::warn!("401 again after refresh for {}, giving up", request.url);
            return Disposition::Fail(http_error(response));
        }

        request.mark_retried();
        Disposition::Refresh
    }
}

/// Path component of an absolute URL, or of a relative reference.
fn request_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    }
}

fn http_error(response: ApiResponse) -> ClientError {
    ClientError::Http {
        status: response.status,
        body: response.body,
    }
}
