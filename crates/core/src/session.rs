// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-session metadata.
//!
//! An agent session wraps a PTY session with agent identity and a link to
//! its durable task row. Status is monotonic: once terminal it never moves.

use crate::command::SessionMode;
use crate::pipeline::PipelineId;
use crate::task::TaskId;
use crate::user::UserId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

crate::define_id! {
    /// Unique identifier for a PTY-backed session.
    pub struct SessionId;
}

crate::define_id! {
    /// Identifier for an auxiliary data tap on a PTY session.
    pub struct TapId;
}

/// Lifecycle status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentSessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentSessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSessionStatus::Running => "running",
            AgentSessionStatus::Completed => "completed",
            AgentSessionStatus::Failed => "failed",
            AgentSessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AgentSessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-memory record of a live (or recently finished) agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSessionMeta {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub agent_id: String,
    pub agent_name: String,
    pub prompt: String,
    pub repo_path: PathBuf,
    pub mode: SessionMode,
    /// Branch created for `create`-mode sessions.
    pub work_branch: Option<String>,
    /// Conversation reopened for `resume`/`continue` sessions.
    pub resume_conversation_id: Option<String>,
    pub status: AgentSessionStatus,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub task_id: Option<TaskId>,
    pub pipeline_id: Option<PipelineId>,
}

impl AgentSessionMeta {
    /// Transition to a terminal status.
    ///
    /// Returns false (and changes nothing) if the session is already
    /// terminal. Callers racing exit against cancel both funnel here.
    pub fn finish(
        &mut self,
        status: AgentSessionStatus,
        exit_code: Option<i32>,
        epoch_ms: u64,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.exit_code = exit_code;
        self.finished_at_ms = Some(epoch_ms);
        true
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentSessionStatus::Running
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
