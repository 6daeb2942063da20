//! The `events`/`stream` resource: the same domain events
//! (the run's audit trail) exposed either as polling JSON keyed by a
//! `since` cursor, or as a Server-Sent-Events stream with a heartbeat
//! every ~15s and a terminal `complete` event once the run reaches a
//! terminal state.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use cp_base::RunId;
use cp_store::{AuditEvent, DurableStore};
use futures_util::stream::{self, Stream};

use crate::dto::SinceQuery;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Polling mode: `GET /runs/{id}/events?since=<cursor>`.
pub async fn list_events(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    let events = state
        .store
        .list_audit_events_for_run(run_id, query.since)
        .await
        .map_err(ApiError::Store)?;
    Ok(Json(events))
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(15);

struct StreamState {
    store: Arc<dyn DurableStore>,
    since: Option<DateTime<Utc>>,
    idle: Duration,
    closed: bool,
    /// Events fetched in the last poll but not yet yielded as frames.
    /// `since` only advances once every buffered event has been sent, so a
    /// poll that returns several rows at once doesn't silently drop all
    /// but the first.
    pending: VecDeque<AuditEvent>,
}

/// SSE mode: `GET /runs/{id}/events/stream`. Polls the audit trail,
/// emitting one frame per new row (`event: <audit event kind>`), a
/// `heartbeat` frame roughly every 15s while idle, and a terminal
/// `complete` frame once the run reaches a terminal state.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Fail fast if the run doesn't exist rather than opening a stream
    // that can never produce anything.
    state.store.get_run(run_id).await.map_err(ApiError::Store)?.ok_or(ApiError::NotFound)?;

    let initial = StreamState {
        store: state.store.clone(),
        since: None,
        idle: Duration::ZERO,
        closed: false,
        pending: VecDeque::new(),
    };

    let stream = stream::unfold(initial, move |mut s| async move {
        if s.closed {
            return None;
        }
        if let Some(next) = s.pending.pop_front() {
            s.idle = Duration::ZERO;
            s.since = Some(next.created_at);
            let frame = sse_json(&next.event.clone(), &next);
            return Some((Ok(frame), s));
        }
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            s.idle += POLL_INTERVAL;

            let events = match s.store.list_audit_events_for_run(run_id, s.since).await {
                Ok(events) => events,
                Err(err) => {
                    s.closed = true;
                    let frame = sse_json("error", &serde_json::json!({ "message": err.to_string() }));
                    return Some((Ok(frame), s));
                }
            };

            s.pending = events.into();
            if let Some(next) = s.pending.pop_front() {
                s.idle = Duration::ZERO;
                s.since = Some(next.created_at);
                let frame = sse_json(&next.event.clone(), &next);
                return Some((Ok(frame), s));
            }

            let run_terminal = s
                .store
                .get_run(run_id)
                .await
                .ok()
                .flatten()
                .map(|run| run.state.is_terminal())
                .unwrap_or(true);
            if run_terminal {
                s.closed = true;
                return Some((Ok(Event::default().event("complete").data("{}")), s));
            }

            if s.idle >= HEARTBEAT_EVERY {
                s.idle = Duration::ZERO;
                return Some((Ok(Event::default().event("heartbeat").data("{}")), s));
            }
            // Neither a new event, completion, nor a due heartbeat: keep
            // polling without yielding a frame yet.
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_EVERY).text("keep-alive")))
}

fn sse_json(event_name: &str, payload: &impl serde::Serialize) -> Event {
    Event::default()
        .event(event_name.to_string())
        .json_data(payload)
        .unwrap_or_else(|_| Event::default().event("error").data("serialization failed"))
}
