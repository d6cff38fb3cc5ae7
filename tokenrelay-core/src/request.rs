//! Request and response values passed through the client pipelines.

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::store::Secret;

/// An outbound HTTP call that can be replayed.
///
/// Besides the wire fields it tracks whether it has already been retried
/// after a token refresh, and which access token it was last sent with.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute URL or a path relative to the configured base URL.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    retried: bool,
    sent_with: Option<Secret>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
            sent_with: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Attach a JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a header. Invalid names or values are ignored with a warning.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::warn!("Ignoring invalid header {:?}", name),
        }
        self
    }

    /// Whether this request has already been replayed after a refresh.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// The access token this request was last authorized with.
    pub fn sent_with(&self) -> Option<&Secret> {
        self.sent_with.as_ref()
    }

    /// Set `Authorization: Bearer <token>`, or strip it when `token` is `None`.
    pub(crate) fn authorize(&mut self, token: Option<&Secret>) {
        match token.and_then(bearer_value) {
            Some(value) => {
                self.headers.insert(header::AUTHORIZATION, value);
                self.sent_with = token.cloned();
            }
            None => {
                self.headers.remove(header::AUTHORIZATION);
                self.sent_with = None;
            }
        }
    }
}

/// Build a sensitive `Bearer` header value.
pub(crate) fn bearer_value(token: &Secret) -> Option<HeaderValue> {
    match HeaderValue::from_str(&format!("Bearer {}", token.expose())) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(_) => {
            tracing::warn!("Access token contains characters not allowed in a header");
            None
        }
    }
}

/// A completed HTTP exchange, whatever its status.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Response with a JSON body.
    pub fn json_body(status: StatusCode, body: &Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize_sets_and_strips_bearer() {
        let mut request = ApiRequest::get("/profile");
        let token = Secret::new("abc");

        request.authorize(Some(&token));
        assert_eq!(
            request.headers.get(header::AUTHORIZATION).unwrap(),
            "Bearer abc"
        );
        assert_eq!(request.sent_with(), Some(&token));

        request.authorize(None);
        assert!(request.headers.get(header::AUTHORIZATION).is_none());
        assert!(request.sent_with().is_none());
    }

    #[test]
    fn test_bearer_header_is_sensitive() {
        let value = bearer_value(&Secret::new("abc")).unwrap();
        assert!(value.is_sensitive());
    }

    #[test]
    fn test_invalid_token_is_not_sent() {
        let mut request = ApiRequest::get("/profile");
        request.authorize(Some(&Secret::new("bad\ntoken")));
        assert!(request.headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_header_builder_ignores_invalid_names() {
        let request = ApiRequest::get("/x")
            .header("X-Trace", "1")
            .header("bad header", "2");
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn test_response_json() {
        let response = ApiResponse::json_body(StatusCode::OK, &serde_json::json!({"id": 7}));
        let value: Value = response.json().unwrap();
        assert_eq!(value["id"], 7);
        assert!(response.is_success());
    }
}
