//! HTTP + WebSocket entry point: wires the Queue, State
//! Machine, Scheduler, Sandbox Pool, Billing Ledger, and Collaboration
//! Gateway behind the wire surface, and exposes [`build_router`] so the
//! binary in `main.rs` and integration tests share the exact same route
//! table.

pub mod auth;
pub mod dev_adapters;
pub mod dto;
pub mod error;
pub mod http;
pub mod state;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// The full route table: the `/runs`/`/subtasks` REST resources, the
/// WebSocket upgrade endpoint, and a liveness probe, all bound to
/// `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ws", get(ws::ws_handler))
        .merge(http::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
