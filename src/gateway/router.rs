//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer, cors::CorsLayer, limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::debug;

use super::auth::{Gatekeeper, auth_middleware};
use super::pipeline::{Relay, RelayResponse};
use crate::Result;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared application state
pub struct AppState {
    /// Request orchestrator (owns the credential cache and forwarder)
    pub relay: Arc<Relay>,
    /// Caller authentication
    pub gatekeeper: Arc<Gatekeeper>,
    /// Deadline for a whole inbound request
    pub request_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let gatekeeper = Arc::clone(&state.gatekeeper);
    let request_timeout = state.request_timeout;

    // Authentication runs before the body is read
    let secured = Router::new()
        .route("/secure-request", post(secure_request_handler))
        .route_layer(middleware::from_fn_with_state(gatekeeper, auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .merge(secured)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "auth_mode": state.gatekeeper.mode().to_string(),
        "cache": state.relay.cache().stats(),
    }))
}

/// POST /secure-request
async fn secure_request_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<RelayResponse>> {
    let raw: Value = serde_json::from_slice(&body)?;
    debug!(bytes = body.len(), "Secure request received");
    let response = state.relay.handle(raw).await?;
    Ok(Json(response))
}
