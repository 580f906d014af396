// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline state machine.
//!
//! A pipeline is an ordered sequence of steps; a step is a parallel fan-out
//! of nodes, each backed by its own agent session and task row. The engine
//! advances `current_step_index` strictly monotonically and only while every
//! node of the current step has completed.

use crate::command::SessionMode;
use crate::session::SessionId;
use crate::task::TaskId;
use crate::user::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

crate::define_id! {
    /// Unique identifier for a pipeline instance.
    pub struct PipelineId;
}

/// Status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Draft,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }
}

/// Status of a step, derived from its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Status of a whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    /// Active pipelines hold prepared-session leases and accept callbacks.
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineStatus::Running | PipelineStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Whether nodes may open fresh conversations or must reuse pooled ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPolicy {
    ReuseOnly,
    #[default]
    AllowCreate,
}

/// Origin of a prepared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreparedSource {
    /// Backed by a durable session-pool row owned by the same user.
    #[default]
    Managed,
    /// Supplied ad hoc by the caller.
    External,
}

/// Lease state of a prepared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreparedStatus {
    Available,
    Leased,
}

/// How a node's session was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSessionSource {
    Reused,
    Created,
}

/// A reusable agent conversation scoped to one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedSession {
    pub session_key: String,
    pub agent_id: String,
    pub mode: SessionMode,
    pub resume_conversation_id: Option<String>,
    pub source: PreparedSource,
    pub status: PreparedStatus,
    pub usage_count: u32,
    pub leased_by_task_id: Option<TaskId>,
    pub leased_by_step_index: Option<usize>,
    pub leased_by_runtime_session_id: Option<SessionId>,
}

impl PreparedSession {
    pub fn available(&self) -> bool {
        self.status == PreparedStatus::Available
    }

    fn lease(&mut self, task_id: TaskId, step_index: usize) {
        self.status = PreparedStatus::Leased;
        self.usage_count += 1;
        self.leased_by_task_id = Some(task_id);
        self.leased_by_step_index = Some(step_index);
        self.leased_by_runtime_session_id = None;
    }

    pub fn release(&mut self) {
        self.status = PreparedStatus::Available;
        self.leased_by_task_id = None;
        self.leased_by_step_index = None;
        self.leased_by_runtime_session_id = None;
    }
}

/// The plan handed to the engine when a lease is acquired.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedLease {
    pub session_key: String,
    pub mode: SessionMode,
    pub resume_conversation_id: Option<String>,
}

/// One agent session inside a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineNode {
    pub title: String,
    pub prompt: String,
    pub agent_id: String,
    pub task_id: TaskId,
    pub status: NodeStatus,
    pub session_source: Option<NodeSessionSource>,
    /// Session key of the prepared session leased to this node, if any.
    pub lease_key: Option<String>,
    /// Runtime PTY session once launched.
    pub session_id: Option<SessionId>,
}

/// A group of nodes that run in parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub title: String,
    pub prompt: String,
    pub input_condition: Option<String>,
    pub input_files: Vec<String>,
    pub status: StepStatus,
    pub nodes: Vec<PipelineNode>,
}

impl PipelineStep {
    /// Step status as a function of node statuses.
    pub fn derived_status(&self) -> StepStatus {
        if self.nodes.iter().any(|n| n.status == NodeStatus::Failed) {
            StepStatus::Failed
        } else if self.nodes.iter().any(|n| n.status == NodeStatus::Cancelled) {
            StepStatus::Cancelled
        } else if self.nodes.iter().any(|n| n.status == NodeStatus::Running) {
            StepStatus::Running
        } else if self
            .nodes
            .iter()
            .all(|n| n.status == NodeStatus::Completed)
        {
            StepStatus::Completed
        } else {
            StepStatus::Pending
        }
    }

    pub fn all_completed(&self) -> bool {
        self.nodes.iter().all(|n| n.status == NodeStatus::Completed)
    }
}

/// A pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub user_id: UserId,
    pub repo_path: PathBuf,
    pub default_agent_id: String,
    pub steps: Vec<PipelineStep>,
    pub current_step_index: usize,
    pub status: PipelineStatus,
    pub session_policy: SessionPolicy,
    pub allow_create_step_indexes: BTreeSet<usize>,
    pub prepared_sessions: Vec<PreparedSession>,
    pub created_at_ms: u64,
}

impl Pipeline {
    /// True when fresh conversations may be created for the given step.
    pub fn allow_create_for(&self, step_index: usize) -> bool {
        self.session_policy == SessionPolicy::AllowCreate
            || self.allow_create_step_indexes.contains(&step_index)
    }

    /// Count of prepared sessions currently available for an agent.
    pub fn available_prepared_count(&self, agent_id: &str) -> usize {
        self.prepared_sessions
            .iter()
            .filter(|p| p.agent_id == agent_id && p.available())
            .count()
    }

    /// Lease the available prepared session with the lowest usage count
    /// (ties broken by lexical session key).
    pub fn lease_prepared(
        &mut self,
        agent_id: &str,
        task_id: &TaskId,
        step_index: usize,
    ) -> Option<PreparedLease> {
        let best = self
            .prepared_sessions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.agent_id == agent_id && p.available())
            .min_by(|(_, a), (_, b)| {
                a.usage_count
                    .cmp(&b.usage_count)
                    .then_with(|| a.session_key.cmp(&b.session_key))
            })
            .map(|(i, _)| i)?;

        let prepared = &mut self.prepared_sessions[best];
        prepared.lease(task_id.clone(), step_index);
        Some(PreparedLease {
            session_key: prepared.session_key.clone(),
            mode: prepared.mode,
            resume_conversation_id: prepared.resume_conversation_id.clone(),
        })
    }

    /// Bind a leased prepared session to the runtime session that uses it.
    pub fn bind_lease_session(&mut self, session_key: &str, session_id: SessionId) {
        if let Some(p) = self
            .prepared_sessions
            .iter_mut()
            .find(|p| p.session_key == session_key)
        {
            p.leased_by_runtime_session_id = Some(session_id);
        }
    }

    /// Release a lease by session key. Idempotent.
    pub fn release_lease(&mut self, session_key: &str) {
        if let Some(p) = self
            .prepared_sessions
            .iter_mut()
            .find(|p| p.session_key == session_key)
        {
            p.release();
        }
    }

    /// Session keys of managed prepared sessions currently leased.
    pub fn leased_managed_keys(&self) -> Vec<String> {
        self.prepared_sessions
            .iter()
            .filter(|p| p.source == PreparedSource::Managed && p.status == PreparedStatus::Leased)
            .map(|p| p.session_key.clone())
            .collect()
    }

    /// Managed session keys regardless of lease state.
    pub fn managed_keys(&self) -> Vec<String> {
        self.prepared_sessions
            .iter()
            .filter(|p| p.source == PreparedSource::Managed)
            .map(|p| p.session_key.clone())
            .collect()
    }

    /// Locate a node by its runtime session id.
    pub fn find_node_by_session(&self, session_id: &SessionId) -> Option<(usize, usize)> {
        for (si, step) in self.steps.iter().enumerate() {
            for (ni, node) in step.nodes.iter().enumerate() {
                if node.session_id.as_ref() == Some(session_id) {
                    return Some((si, ni));
                }
            }
        }
        None
    }

    /// Locate a node by its task id.
    pub fn find_node_by_task(&self, task_id: &TaskId) -> Option<(usize, usize)> {
        for (si, step) in self.steps.iter().enumerate() {
            for (ni, node) in step.nodes.iter().enumerate() {
                if node.task_id == *task_id {
                    return Some((si, ni));
                }
            }
        }
        None
    }

    /// Task ids of every node in the given step.
    pub fn step_task_ids(&self, step_index: usize) -> Vec<TaskId> {
        self.steps
            .get(step_index)
            .map(|s| s.nodes.iter().map(|n| n.task_id.clone()).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Creation requests (wire shape, normalized by the engine)
// ---------------------------------------------------------------------------

/// A node inside a step request. Missing fields inherit from the step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// One step of a pipeline request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Parallel fan-out; empty means one implicit node mirroring the step.
    #[serde(default)]
    pub parallel: Vec<NodeRequest>,
    #[serde(default)]
    pub input_condition: Option<String>,
    #[serde(default)]
    pub input_files: Vec<String>,
}

impl StepRequest {
    /// Normalized `(title, prompt, agent_id)` per node, applying the
    /// node ⇒ step ⇒ pipeline-default agent inheritance.
    pub fn effective_nodes(&self, default_agent: &str) -> Vec<(String, String, String)> {
        let step_agent = self.agent_id.as_deref().unwrap_or(default_agent);
        if self.parallel.is_empty() {
            return vec![(
                self.title.clone(),
                self.prompt.clone(),
                step_agent.to_string(),
            )];
        }
        self.parallel
            .iter()
            .map(|node| {
                (
                    node.title.clone().unwrap_or_else(|| self.title.clone()),
                    node.prompt.clone().unwrap_or_else(|| self.prompt.clone()),
                    node.agent_id
                        .as_deref()
                        .unwrap_or(step_agent)
                        .to_string(),
                )
            })
            .collect()
    }
}

/// A prepared session offered at pipeline creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedRequest {
    pub session_key: String,
    pub agent_id: String,
    pub mode: SessionMode,
    #[serde(default)]
    pub resume_conversation_id: Option<String>,
    #[serde(default)]
    pub source: PreparedSource,
}

impl PreparedRequest {
    pub fn into_prepared(self) -> PreparedSession {
        PreparedSession {
            session_key: self.session_key,
            agent_id: self.agent_id,
            mode: self.mode,
            resume_conversation_id: self.resume_conversation_id,
            source: self.source,
            status: PreparedStatus::Available,
            usage_count: 0,
            leased_by_task_id: None,
            leased_by_step_index: None,
            leased_by_runtime_session_id: None,
        }
    }
}

/// A whole pipeline request as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub steps: Vec<StepRequest>,
    #[serde(default)]
    pub session_policy: SessionPolicy,
    #[serde(default)]
    pub allow_create_step_indexes: Vec<usize>,
    #[serde(default)]
    pub prepared_sessions: Vec<PreparedRequest>,
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
