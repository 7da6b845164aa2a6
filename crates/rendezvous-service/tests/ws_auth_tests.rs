//! Connection authentication on the `/ws` route.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use chrono::Duration;
use http_body_util::BodyExt;
use rendezvous_service::dispatch::ws::ws_router;
use rendezvous_test_utils::{TestHarness, TestTokens, TestUser};
use tower::ServiceExt;

async fn get(harness: &TestHarness, request: Request<Body>) -> Response {
    ws_router(harness.ws_state()).oneshot(request).await.unwrap()
}

fn with_query_token(token: &str) -> Request<Body> {
    Request::builder()
        .uri(format!("/ws?token={token}"))
        .body(Body::empty())
        .unwrap()
}

async fn error_code(response: Response) -> String {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    body["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_valid_token_passes_authentication() {
    let harness = TestHarness::new();
    harness.user("alice");

    let response = get(&harness, with_query_token(&harness.tokens.mint("alice"))).await;

    // No upgrade headers, so axum refuses the upgrade itself.
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    assert_ne!(response.status(), StatusCode::FORBIDDEN);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_bearer_header_is_accepted() {
    let harness = TestHarness::new();
    harness.user("alice");
    let request = Request::builder()
        .uri("/ws")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", harness.tokens.mint("alice")),
        )
        .body(Body::empty())
        .unwrap();

    let response = get(&harness, request).await;

    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_expired_and_foreign_tokens_are_unauthorized() {
    let harness = TestHarness::new();
    harness.user("alice");
    let foreign = TestTokens::new("some-other-secret-0123456789abcdef").mint("alice");

    for token in [harness.tokens.expired("alice"), foreign] {
        let response = get(&harness, with_query_token(&token)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await, "UNAUTHORIZED");
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn test_unknown_user_is_unauthorized() {
    let harness = TestHarness::new();

    let response = get(&harness, with_query_token(&harness.tokens.mint("ghost"))).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_banned_user_is_forbidden() {
    let harness = TestHarness::new();
    harness.insert(TestUser::new("mallory").banned_for(Duration::hours(1)));

    let response = get(&harness, with_query_token(&harness.tokens.mint("mallory"))).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "FORBIDDEN");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_expired_ban_allows_connection() {
    let harness = TestHarness::new();
    harness.insert(TestUser::new("reformed").banned_for(Duration::hours(-1)));

    let response = get(&harness, with_query_token(&harness.tokens.mint("reformed"))).await;

    assert_ne!(response.status(), StatusCode::FORBIDDEN);
    harness.shutdown().await;
}
