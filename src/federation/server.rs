use super::session::FederationSession;
use crate::auth::{Handshake, SecretVerifier};
use crate::bus::Bus;
use axum::{
    extract::{ws::WebSocketUpgrade, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state of the federation endpoint
pub struct FederationState {
    pub bus: Bus,
    pub verifier: SecretVerifier,
}

/// Auth middleware: verifies the handshake before the upgrade is extracted,
/// so a rejected client gets a plain 401 response.
async fn federation_auth(
    State(state): State<Arc<FederationState>>,
    req: Request,
    next: Next,
) -> Response {
    let handshake = Handshake::from_parts(req.headers(), req.uri());
    if !state.verifier.verify(&handshake) {
        warn!(
            path = %req.uri().path(),
            secret_present = handshake.secret.is_some(),
            "Federation handshake rejected"
        );
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(req).await
}

/// GET <path> - federation tunnel upgrade (auth handled by federation_auth)
pub async fn federation_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<FederationState>>,
) -> Response {
    info!("Federation upgrade request received");
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| FederationSession::new(bus).handle(socket))
}

/// Federation router with the auth middleware applied
pub fn create_federation_router(state: Arc<FederationState>, path: &str) -> Router {
    Router::new()
        .route(path, get(federation_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), federation_auth))
        .with_state(state)
}
