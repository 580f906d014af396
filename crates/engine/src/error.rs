// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine error types

use cam_core::{PipelineId, SessionId, TaskId};
use cam_pty::PtyError;
use cam_storage::StorageError;
use thiserror::Error;

/// Errors crossing the engine boundary.
///
/// Precondition misses inside the engine are no-ops, not errors; what
/// surfaces here is either caller mistakes (unknown ids, invalid requests)
/// or genuine failures from the PTY, storage, or filesystem layers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown agent: {0}")]
    AgentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("agent {agent} requires env var {name}, which did not resolve")]
    MissingEnv { agent: String, name: String },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error(
        "step {step_index} needs {needed} prepared session(s) for agent {agent_id}, pool has {available}"
    )]
    InsufficientPool {
        step_index: usize,
        agent_id: String,
        needed: usize,
        available: usize,
    },

    #[error("prepared session rejected: {0}")]
    PreparedRejected(String),

    #[error("task row conflict for {0}")]
    TaskConflict(TaskId),

    #[error("invalid or already-used callback token")]
    InvalidToken,

    #[error("pipeline {0} does not accept this operation in its current state")]
    PipelineConflict(PipelineId),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("workspace io: {0}")]
    Workspace(#[from] std::io::Error),
}
