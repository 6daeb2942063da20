//! The `logs` resource: the append-only audit trail (`audit_events`)
//! touching a run or any of its subtasks.

use axum::Json;
use axum::extract::{Path, Query, State};
use cp_base::RunId;
use cp_store::AuditEvent;

use crate::dto::SinceQuery;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_logs(
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
