use axum::Json;
use axum::extract::{Path, Query, State};
use cp_base::{RunId, SubtaskId};
use cp_orchestrator::{NewSubtask, TokenUsage};
use cp_store::Subtask;
use serde::{Deserialize, Serialize};

use crate::dto::{CompleteSubtaskRequest, FailSubtaskRequest, IngestSubtasksRequest};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IngestedCount {
    pub ingested: usize,
}

pub async fn ingest_subtasks(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    Json(body): Json<IngestSubtasksRequest>,
) -> ApiResult<Json<IngestedCount>> {
    let subtasks = body
        .subtasks
        .into_iter()
        .map(|s| NewSubtask {
            subtask_index: s.subtask_index,
            task_type: s.task_type,
            dependencies: s.dependencies,
            input: s.input,
        })
        .collect();
    let ingested = state.driver.ingest_subtasks(run_id, subtasks).await.map_err(ApiError::Orchestrator)?;
    Ok(Json(IngestedCount { ingested }))
}

#[derive(Debug, Deserialize)]
pub struct SubtaskListQuery {
    pub state: Option<cp_store::SubtaskState>,
}

pub async fn list_subtasks(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    Query(query): Query<SubtaskListQuery>,
) -> ApiResult<Json<Vec<Subtask>>> {
    let states = query.state.map(|s| vec![s]);
    let subtasks = state
        .store
        .get_subtasks_by_run(run_id, states.as_deref())
        .await
        .map_err(ApiError::Store)?;
    Ok(Json(subtasks))
}

pub async fn get_subtask(State(state): State<AppState>, Path(subtask_id): Path<SubtaskId>) -> ApiResult<Json<Subtask>> {
    let subtask = state.store.get_subtask(subtask_id).await.map_err(ApiError::Store)?.ok_or(ApiError::NotFound)?;
    Ok(Json(subtask))
}

pub async fn complete_subtask(
    State(state): State<AppState>,
    Path(subtask_id): Path<SubtaskId>,
    Json(body): Json<CompleteSubtaskRequest>,
) -> ApiResult<()> {
    let usage = body.usage.map(|u| TokenUsage {
        model: u.model,
        provider: u.provider,
        input_tokens: u.input_tokens,
        output_tokens: u.output_tokens,
        idempotency_key: u.idempotency_key,
    });
    state
        .driver
        .complete_subtask(subtask_id, body.output, usage)
        .await
        .map_err(ApiError::Orchestrator)?;
    Ok(())
}

pub async fn fail_subtask(
    State(state): State<AppState>,
    Path(subtask_id): Path<SubtaskId>,
    Json(body): Json<FailSubtaskRequest>,
) -> ApiResult<()> {
    state.driver.fail_subtask(subtask_id, body.error).await.map_err(ApiError::Orchestrator)?;
    Ok(())
}
