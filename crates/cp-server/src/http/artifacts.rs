//! The `artifacts` resource: the durable outputs a run
//! produced. Like `messages`, there is no dedicated artifact store — an
//! artifact is a completed subtask's `output`, surfaced by subtask so a
//! caller can tell which step produced what.

use axum::Json;
use axum::extract::{Path, State};
use cp_base::RunId;
use cp_store::SubtaskState;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Artifact {
    pub subtask_id: cp_base::SubtaskId,
    pub subtask_index: u32,
    pub task_type: String,
    pub output: serde_json::Value,
}

pub async fn list_artifacts(State(state): State<AppState>, Path(run_id): Path<RunId>) -> ApiResult<Json<Vec<Artifact>>> {
    let mut subtasks = state
        .store
        .get_subtasks_by_run(run_id, Some(&[SubtaskState::Completed]))
        .await
        .map_err(ApiError::Store)?;
    subtasks.sort_by_key(|s| s.subtask_index);

    let artifacts = subtasks
        .into_iter()
        .filter_map(|s| {
            s.output.map(|output| Artifact {
                subtask_id: s.id,
                subtask_index: s.subtask_index,
                task_type: s.task_type.clone(),
                output,
            })
        })
        .collect();
    Ok(Json(artifacts))
}
