//! The `messages` resource: the run's transcript. There is no
//! separate message store — a run's messages are the `input`/`output` of
//! each of its subtasks in execution order, which is what an operator
//! actually wants to read back when checking on a run.

use axum::Json;
use axum::extract::{Path, State};
use cp_base::RunId;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Message {
    pub subtask_id: cp_base::SubtaskId,
    pub subtask_index: u32,
    pub role: &'static str,
    pub content: serde_json::Value,
}

pub async fn list_messages(State(state): State<AppState>, Path(run_id): Path<RunId>) -> ApiResult<Json<Vec<Message>>> {
    let mut subtasks = state.store.get_subtasks_by_run(run_id, None).await.map_err(ApiError::Store)?;
    subtasks.sort_by_key(|s| s.subtask_index);

    let mut messages = Vec::with_capacity(subtasks.len() * 2);
    for subtask in subtasks {
        messages.push(Message {
            subtask_id: subtask.id,
            subtask_index: subtask.subtask_index,
            role: "task",
            content: subtask.input,
        });
        if let Some(output) = subtask.output {
            messages.push(Message {
                subtask_id: subtask.id,
                subtask_index: subtask.subtask_index,
                role: "result",
                content: output,
            });
        }
    }
    Ok(Json(messages))
}
