// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task rows: the durable mirror of session and pipeline-node state.
//!
//! In-memory state is authoritative for live sessions; the task table is
//! where status and output logs survive restarts. Every status transition
//! the engine writes is conditional on an expected current status.

use crate::pipeline::PipelineId;
use crate::user::UserId;
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier for a task row.
    pub struct TaskId;
}

/// Lifecycle status of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Queued,
    Waiting,
    Running,
    AwaitingReview,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Statuses a pipeline node may be promoted to `running` from.
    pub const PROMOTABLE: &'static [TaskStatus] =
        &[TaskStatus::Draft, TaskStatus::Queued, TaskStatus::Waiting];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Queued => "queued",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingReview => "awaiting_review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        Some(match s {
            "draft" => TaskStatus::Draft,
            "queued" => TaskStatus::Queued,
            "waiting" => TaskStatus::Waiting,
            "running" => TaskStatus::Running,
            "awaiting_review" => TaskStatus::AwaitingReview,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Scheduled,
    #[default]
    Terminal,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Scheduled => "scheduled",
            TaskSource::Terminal => "terminal",
        }
    }

    pub fn parse(s: &str) -> Option<TaskSource> {
        match s {
            "scheduled" => Some(TaskSource::Scheduled),
            "terminal" => Some(TaskSource::Terminal),
            _ => None,
        }
    }
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    /// The effective prompt.
    pub description: String,
    pub agent_id: String,
    pub repo_url: Option<String>,
    pub work_branch: Option<String>,
    pub work_dir: Option<String>,
    pub status: TaskStatus,
    pub source: TaskSource,
    /// Pipeline group this row belongs to, if any.
    pub group_id: Option<PipelineId>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub retry_count: u32,
}

/// One persisted line of terminal output, append-only per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogLine {
    pub task_id: TaskId,
    pub line: String,
    pub created_at_ms: u64,
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
