//! The HTTP surface: RESTful CRUD over runs, subtasks,
//! messages, artifacts, and logs, plus the `events`/`stream` endpoint.

pub mod artifacts;
pub mod events;
pub mod logs;
pub mod messages;
pub mod runs;
pub mod subtasks;

use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

/// Builds the `/runs/...` resource tree bound to `state`. Split out of
/// [`crate::build_router`] so the WebSocket route (which carries its own
/// auth extraction) can live alongside it without this module needing to
/// know about `ws.rs`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs", post(runs::create_run))
        .route("/runs/{run_id}", get(runs::get_run).delete(runs::cancel_run))
        .route("/runs/{run_id}/subtasks", get(subtasks::list_subtasks).post(subtasks::ingest_subtasks))
        .route("/runs/{run_id}/messages", get(messages::list_messages))
        .route("/runs/{run_id}/artifacts", get(artifacts::list_artifacts))
        .route("/runs/{run_id}/logs", get(logs::list_logs))
        .route("/runs/{run_id}/events", get(events::list_events))
        .route("/runs/{run_id}/events/stream", get(events::stream_events))
        .route("/subtasks/{subtask_id}", get(subtasks::get_subtask))
        .route("/subtasks/{subtask_id}/complete", post(subtasks::complete_subtask))
        .route("/subtasks/{subtask_id}/fail", post(subtasks::fail_subtask))
}
