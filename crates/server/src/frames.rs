// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket frame types.
//!
//! JSON frames, one message per frame, multiplexed by session id and
//! pipeline id. Pipeline frames carry per-node id arrays.

use cam_core::{
    AgentSessionStatus, PipelineId, PipelineRequest, SessionId, SessionMode, StepStatus, TaskId,
};
use serde::{Deserialize, Serialize};

/// Frames a client sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Open a plain terminal session.
    #[serde(rename_all = "camelCase")]
    Create {
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        idle_timeout_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Attach { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    Input { session_id: SessionId, data: String },
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Destroy { session_id: SessionId },
    List,
    Ping,
    #[serde(rename_all = "camelCase")]
    AgentCreate {
        agent_id: String,
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        mode: SessionMode,
        #[serde(default)]
        resume_conversation_id: Option<String>,
        #[serde(default)]
        work_dir: Option<String>,
        #[serde(default)]
        repo_url: Option<String>,
        #[serde(default)]
        auto_exit: bool,
    },
    #[serde(rename_all = "camelCase")]
    AgentCancel { session_id: SessionId },
    AgentList,
    PipelineCreate {
        #[serde(flatten)]
        request: PipelineRequest,
    },
    #[serde(rename_all = "camelCase")]
    PipelineCancel { pipeline_id: PipelineId },
    #[serde(rename_all = "camelCase")]
    PipelinePause { pipeline_id: PipelineId },
    #[serde(rename_all = "camelCase")]
    PipelineResume { pipeline_id: PipelineId },
}

/// A plain terminal session, for `sessions` frames.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionInfo {
    pub session_id: SessionId,
    pub shell: String,
    pub attached: bool,
    pub scrollback_len: usize,
}

/// An agent session, for `agent-sessions` frames.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionInfo {
    pub session_id: SessionId,
    pub task_id: Option<TaskId>,
    pub agent_id: String,
    pub status: AgentSessionStatus,
    pub mode: SessionMode,
    pub work_branch: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub pty_alive: bool,
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Created {
        session_id: SessionId,
        shell: String,
    },
    /// Raw agent bytes, terminal escapes included.
    #[serde(rename_all = "camelCase")]
    Output { session_id: SessionId, data: String },
    #[serde(rename_all = "camelCase")]
    Exited {
        session_id: SessionId,
        exit_code: i32,
    },
    Sessions {
        sessions: Vec<TerminalSessionInfo>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    AgentCreated {
        session_id: SessionId,
        task_id: Option<TaskId>,
        agent_id: String,
        status: AgentSessionStatus,
    },
    #[serde(rename_all = "camelCase")]
    AgentStatus {
        session_id: SessionId,
        task_id: Option<TaskId>,
        status: AgentSessionStatus,
        exit_code: Option<i32>,
        branch: Option<String>,
        last_commit: Option<String>,
    },
    AgentSessions {
        sessions: Vec<AgentSessionInfo>,
    },
    #[serde(rename_all = "camelCase")]
    PipelineCreated {
        pipeline_id: PipelineId,
        session_ids: Vec<SessionId>,
        task_ids: Vec<TaskId>,
    },
    #[serde(rename_all = "camelCase")]
    PipelineStepStatus {
        pipeline_id: PipelineId,
        step_index: usize,
        status: StepStatus,
        session_ids: Vec<SessionId>,
        task_ids: Vec<TaskId>,
    },
    #[serde(rename_all = "camelCase")]
    PipelineCompleted { pipeline_id: PipelineId },
    #[serde(rename_all = "camelCase")]
    PipelinePaused { pipeline_id: PipelineId },
    #[serde(rename_all = "camelCase")]
    PipelineResumed { pipeline_id: PipelineId },
}

#[cfg(test)]
#[path = "frames_tests.rs"]
mod tests;
