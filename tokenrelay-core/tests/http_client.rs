//! End-to-end tests for ApiClient over the reqwest transport.
//!
//! A wiremock server stands in for the backend so these exercise real HTTP:
//! bearer headers on the wire, the refresh request body, and the response
//! shapes the backend may use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokenrelay_core::{
    ApiClient, ApiRequest, ClientConfig, ClientError, MemoryStore, RefreshError, StatusCode,
};
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn client_for(server: &MockServer) -> ApiClient {
    let config = ClientConfig::new(server.uri().parse().unwrap());
    ApiClient::new(config, Arc::new(MemoryStore::new())).unwrap()
}

async fn mount_profile(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("authorization", "Bearer new-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "Ada" })))
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(401).set_body_string("jwt expired"))
        .with_priority(2)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_three_simultaneous_401s_refresh_once() {
    let server = MockServer::start().await;
    mount_profile(&server).await;

    Mock::given(method("POST"))
        .and(path("/token/refresh"))
        .and(header("authorization", "Bearer old-access"))
        .and(body_json(json!({ "refreshToken": "old-refresh" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "tokens": {
                    "accessToken": "new-access",
                    "refreshToken": "new-refresh",
                    "accessTokenExpiresIn": 900
                }}}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_tokens("old-access", "old-refresh", 900).await.unwrap();

    let (a, b, c) = tokio::join!(
        client.get("/profile"),
        client.get("/profile"),
        client.get("/profile"),
    );

    for response in [a, b, c] {
        let response = response.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["name"], "Ada");
    }

    let credentials = client.credentials();
    assert_eq!(credentials.get_access_token().await.unwrap().expose(), "new-access");
    assert_eq!(credentials.get_refresh_token().await.unwrap().expose(), "new-refresh");
    assert!(!credentials.is_expired().await);
}

#[tokio::test]
async fn test_flat_refresh_response_is_accepted() {
    let server = MockServer::start().await;
    mount_profile(&server).await;

    Mock::given(method("POST"))
        .and(path("/token/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": "new-access",
            "refreshToken": "new-refresh",
            "accessTokenExpiresIn": 900
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_tokens("old-access", "old-refresh", 900).await.unwrap();

    let response = client.get("/profile").await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_refresh_rejection_clears_session() {
    let server = MockServer::start().await;
    mount_profile(&server).await;

    Mock::given(method("POST"))
        .and(path("/token/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_string("refresh token revoked"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_tokens("old-access", "old-refresh", 900).await.unwrap();

    let (a, b) = tokio::join!(client.get("/profile"), client.get("/profile"));

    for result in [a, b] {
        match result {
            Err(ClientError::SessionExpired(RefreshError::Rejected { status, body })) => {
                assert_eq!(status, 401);
                assert_eq!(body, "refresh token revoked");
            }
            other => panic!("expected SessionExpired, got {:?}", other.map(|r| r.status)),
        }
    }
    assert!(client.credentials().get_access_token().await.is_none());
}

#[tokio::test]
async fn test_hung_refresh_times_out() {
    let server = MockServer::start().await;
    mount_profile(&server).await;

    Mock::given(method("POST"))
        .and(path("/token/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "accessToken": "late", "refreshToken": "late", "accessTokenExpiresIn": 900
                }))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let mut config = ClientConfig::new(server.uri().parse().unwrap());
    config.refresh_timeout_secs = 1;
    let client = ApiClient::new(config, Arc::new(MemoryStore::new())).unwrap();
    client.set_tokens("old-access", "old-refresh", 900).await.unwrap();

    let err = client.get("/profile").await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::SessionExpired(RefreshError::TimedOut { .. })
    ));
    assert!(client.credentials().get_refresh_token().await.is_none());
}

#[tokio::test]
async fn test_sign_in_stores_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({ "email": "ada@example.com", "password": "hunter2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "user": { "id": 1 },
                "tokens": {
                    "accessToken": "new-access",
                    "refreshToken": "new-refresh",
                    "accessTokenExpiresIn": 900
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_profile(&server).await;

    let client = client_for(&server);
    let response = client
        .sign_in(json!({ "email": "ada@example.com", "password": "hunter2" }))
        .await
        .unwrap();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["data"]["user"]["id"], 1);

    let profile = client.get("/profile").await.unwrap();
    assert_eq!(profile.status, StatusCode::OK);
}

#[tokio::test]
async fn test_failed_sign_in_does_not_refresh() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token/refresh"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_tokens("old-access", "old-refresh", 900).await.unwrap();

    let err = client
        .request(ApiRequest::post("/auth/login").json(json!({ "email": "x" })))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));

    let err = client.sign_in(json!({ "email": "x" })).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
}

#[tokio::test]
async fn test_sign_in_without_tokens_is_invalid_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.sign_in(json!({})).await.unwrap_err();

    assert!(matches!(err, ClientError::InvalidResponse { .. }));
    assert!(client.credentials().get_access_token().await.is_none());
}
