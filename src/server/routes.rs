//! Route handlers for the sync server.
//!
//! - `GET /health`: liveness and a few gauges, as JSON
//! - `GET /ws/:document_id?token=<token>`: WebSocket upgrade into a sync session
//!
//! The session token may also be sent as `Authorization: Bearer <token>`.

use axum::{
    Router,
    extract::{Path, Query, State, ws::WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::websocket::WebSocketSession;
use crate::access::TokenVerifier;
use crate::engine::SyncEngine;
use crate::ids::DocumentId;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub tokens: Arc<TokenVerifier>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, tokens: TokenVerifier) -> Self {
        Self {
            engine,
            tokens: Arc::new(tokens),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub resident_documents: usize,
    pub active_rooms: usize,
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Basic health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        resident_documents: state.engine.registry().resident_count(),
        active_rooms: state.engine.rooms().room_count(),
    })
}

/// WebSocket upgrade into a sync session for one document
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(raw_id): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let document_id = match DocumentId::parse(raw_id) {
        Ok(id) => id,
        Err(e) => {
            debug!("Rejecting connection: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let token = params.token.or_else(|| bearer_token(&headers));
    let Some(user) = token.as_deref().and_then(|t| state.tokens.verify(t)) else {
        warn!("Rejecting unauthenticated connection to {document_id}");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let engine = state.engine;
    ws.on_upgrade(move |socket| WebSocketSession::new(socket, engine, document_id, user).handle())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

/// Creates and configures the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/:document_id", get(ws_handler))
        .with_state(state)
}
