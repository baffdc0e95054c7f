// Integration tests for federation handshake auth.
//
// The verifier runs as a route layer before the WebSocket upgrade is
// extracted, so a rejected handshake gets a plain 401.
//
// Note: Tests use tower::ServiceExt::oneshot. When auth passes, requests reach
// the WebSocketUpgrade extractor, which rejects them (no hyper OnUpgrade
// extension in test requests). The tests verify the auth decision (401 vs
// non-401), not the upgrade itself.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use fedbus::auth::SecretVerifier;
use fedbus::{Bus, BusConfig, MemoryStore};
use std::sync::Arc;
use tower::ServiceExt;

fn make_router(verifier: SecretVerifier) -> Router {
    let bus = Bus::new(BusConfig::default(), Arc::new(MemoryStore::new()));
    bus.federation_router(verifier)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn bearer_request(uri: &str, secret: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", secret))
        .body(Body::empty())
        .unwrap()
}

// ── missing or wrong secret → 401 ────────────────────────────────────────────

#[tokio::test]
async fn test_missing_secret_returns_401() {
    let app = make_router(SecretVerifier::secret("s3cret"));
    let resp = app.oneshot(get_request("/federate")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_bearer_secret_returns_401() {
    let app = make_router(SecretVerifier::secret("s3cret"));
    let resp = app
        .oneshot(bearer_request("/federate", "guess"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_authorization_returns_401() {
    let app = make_router(SecretVerifier::secret("s3cret"));
    let req = Request::builder()
        .uri("/federate")
        .header(header::AUTHORIZATION, "s3cret")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── matching secret → auth passes ────────────────────────────────────────────

#[tokio::test]
async fn test_bearer_secret_not_rejected() {
    let app = make_router(SecretVerifier::secret("s3cret"));
    let resp = app
        .oneshot(bearer_request("/federate", "s3cret"))
        .await
        .unwrap();
    // Auth ok; the upgrade extractor rejects the plain request (test artifact)
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_query_secret_not_rejected() {
    let app = make_router(SecretVerifier::secret("s3cret"));
    let resp = app
        .oneshot(get_request("/federate?secret=s3cret"))
        .await
        .unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empty_query_secret_returns_401() {
    let app = make_router(SecretVerifier::secret("s3cret"));
    let resp = app
        .oneshot(get_request("/federate?secret="))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── custom verifier ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_custom_verifier_decides() {
    let verifier = SecretVerifier::custom(|handshake| {
        handshake
            .headers
            .get("x-federation-peer")
            .map_or(false, |peer| peer == "trusted")
    });

    let app = make_router(verifier.clone());
    let resp = app.oneshot(get_request("/federate")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let app = make_router(verifier);
    let req = Request::builder()
        .uri("/federate")
        .header("x-federation-peer", "trusted")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_other_paths_are_not_routed() {
    let app = make_router(SecretVerifier::secret("s3cret"));
    let resp = app
        .oneshot(bearer_request("/elsewhere", "s3cret"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
