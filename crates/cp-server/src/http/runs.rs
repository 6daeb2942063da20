use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use cp_base::RunId;
use cp_store::{Run, RunState};

use crate::auth::Principal;
use crate::dto::CreateRunRequest;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn create_run(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<CreateRunRequest>,
) -> ApiResult<Json<Run>> {
    let now = Utc::now();
    let run = Run {
        id: RunId::new(),
        user_id: principal.user_id,
        org_id: principal.org_id,
        created_at: now,
        updated_at: now,
        state: RunState::Created,
        state_version: 0,
        fencing_token: None,
        token_expires_at: None,
        plan: body.plan(),
        current_phase_number: 0,
        error: None,
        completed_at: None,
        worker_id: None,
        deadline_at: body.deadline_at,
        priority: body.priority.unwrap_or(5),
    };
    let created = state.driver.submit_run(run).await.map_err(ApiError::Orchestrator)?;
    Ok(Json(created))
}

pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<RunId>) -> ApiResult<Json<Run>> {
    let run = state.store.get_run(run_id).await.map_err(ApiError::Store)?.ok_or(ApiError::NotFound)?;
    Ok(Json(run))
}

pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<RunId>) -> ApiResult<()> {
    state.driver.cancel_run(run_id).await.map_err(ApiError::Orchestrator)?;
    Ok(())
}
