// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Completion-detection endpoint.
//!
//! `POST /api/terminal/step-done` with `{token, pipelineId, taskId}`.
//! Tokens are single-use; the agent is assumed to invoke once per step.

use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use cam_core::{PipelineId, TaskId};
use cam_engine::EngineError;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StepDonePayload {
    token: String,
    pipeline_id: PipelineId,
    task_id: TaskId,
}

pub(crate) async fn step_done(
    State(state): State<AppState>,
    payload: Result<Json<StepDonePayload>, JsonRejection>,
) -> StatusCode {
    let Ok(Json(payload)) = payload else {
        return StatusCode::BAD_REQUEST;
    };

    match state
        .engine
        .notify_step_completed(&payload.token, &payload.pipeline_id, &payload.task_id)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(EngineError::InvalidToken)
        | Err(EngineError::PipelineNotFound(_))
        | Err(EngineError::PipelineConflict(_)) => StatusCode::CONFLICT,
        Err(e) => {
            tracing::error!(error = %e, "step-done processing failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
