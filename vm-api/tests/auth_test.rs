//! Integration tests for authentication middleware
//!
//! Tests that the auth middleware turns proxy headers into an account and
//! enforces authentication.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use tower::ServiceExt; // for `oneshot`
use vm_api::auth::{auth_middleware, AuthenticatedUser};

// Simple handler that returns the authenticated account
async fn test_handler(
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "account": user.account.to_string(),
        "email": user.email,
    }))
}

fn create_test_app() -> Router {
    Router::new()
        .route("/protected", get(test_handler))
        .layer(middleware::from_fn(auth_middleware))
}

async fn send(headers: &[(&str, &str)]) -> (StatusCode, Option<serde_json::Value>) {
    let mut builder = Request::builder().uri("/protected");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = create_test_app()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).ok())
}

#[tokio::test]
async fn test_x_user_header_defaults_to_client() {
    let (status, json) = send(&[("x-user", "alice")]).await;

    assert_eq!(status, StatusCode::OK);
    let json = json.unwrap();
    assert_eq!(json["account"], "client:alice");
    assert!(json["email"].is_null());
}

#[tokio::test]
async fn test_account_kind_header_selects_administrator() {
    let (status, json) =
        send(&[("x-vm-user", "root"), ("x-vm-account-kind", "administrator")]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.unwrap()["account"], "administrator:root");
}

#[tokio::test]
async fn test_unknown_account_kind_is_rejected() {
    let (status, _) = send(&[("x-user", "alice"), ("x-vm-account-kind", "auditor")]).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_header_priority() {
    let (status, json) = send(&[
        ("x-vm-user", "vmuser"),
        ("x-forwarded-user", "forwardeduser"),
        ("x-user", "fallbackuser"),
    ])
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.unwrap()["account"], "client:vmuser");
}

#[tokio::test]
async fn test_x_forwarded_headers_work() {
    let (status, json) = send(&[
        ("x-forwarded-user", "forwardeduser"),
        ("x-forwarded-email", "forwarded@example.com"),
    ])
    .await;

    assert_eq!(status, StatusCode::OK);
    let json = json.unwrap();
    assert_eq!(json["account"], "client:forwardeduser");
    assert_eq!(json["email"], "forwarded@example.com");
}

#[tokio::test]
async fn test_missing_user_header_returns_401() {
    let (status, _) = send(&[]).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empty_user_header_returns_401() {
    let (status, _) = send(&[("x-user", "")]).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_utf8_header_returns_401() {
    let request = Request::builder()
        .uri("/protected")
        .header("x-user", &b"\xFF\xFE"[..]) // Invalid UTF-8
        .body(Body::empty())
        .unwrap();

    let response = create_test_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
