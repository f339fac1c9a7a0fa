//! `/ws` endpoint tests: credentials are checked before any upgrade.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use rc_test_utils::{TestRig, TestTokenBuilder, TEST_JWT_SECRET};
use tower::ServiceExt;

async fn get(rig: &TestRig, uri: &str, bearer: Option<&str>) -> (StatusCode, String) {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let response = rig
        .router()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let rig = TestRig::builder().build();
    let (status, _) = get(&rig, "/ws", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(rig.metrics().connection_count(), 0);
}

#[tokio::test]
async fn test_bad_tokens_share_one_message() {
    let rig = TestRig::builder().build();

    let wrong_key = TestTokenBuilder::new("alice").sign("some-other-secret");
    let expired = TestTokenBuilder::new("alice")
        .expires_in(-600)
        .sign(TEST_JWT_SECRET);
    let from_the_future = TestTokenBuilder::new("alice")
        .issued_in(3600)
        .sign(TEST_JWT_SECRET);

    let mut bodies = Vec::new();
    for token in [wrong_key.as_str(), expired.as_str(), from_the_future.as_str(), "garbage"] {
        let (status, body) = get(&rig, "/ws", Some(token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "token {token}");
        bodies.push(body);
    }
    bodies.dedup();
    assert_eq!(bodies, vec!["Invalid or expired token".to_string()]);
}

#[tokio::test]
async fn test_valid_token_without_upgrade() {
    let rig = TestRig::builder().build();
    let token = TestTokenBuilder::new("alice").named("Alice").sign(TEST_JWT_SECRET);

    let (status, _) = get(&rig, "/ws", Some(&token)).await;
    assert_eq!(status, StatusCode::UPGRADE_REQUIRED);

    let (status, _) = get(&rig, &format!("/ws?token={token}"), None).await;
    assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let rig = TestRig::builder().build();
    let (status, _) = get(&rig, "/rooms", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
