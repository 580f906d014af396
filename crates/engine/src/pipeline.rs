// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline engine: step/node lifecycle, leasing, hooks, advancement.
//!
//! Locking discipline: the pipelines map is mutated in short critical
//! sections that never suspend. Every function collects the work to do
//! under the lock, drops it, then performs PTY / storage / filesystem I/O.

use crate::error::EngineError;
use crate::manager::{CreateAgentSession, Engine, TokenClaim};
use crate::workspace::{ensure_step_workspace, render_node_prompt, write_node_task_file};
use cam_adapters::{inject_step_done_hook, supports_completion_hook, HookSpec, RepoIndex,
    SecretResolver,
};
use cam_core::agent::is_session_governed;
use cam_core::pipeline::{
    NodeSessionSource, NodeStatus, Pipeline, PipelineNode, PipelineStatus, PipelineStep,
    PreparedSource, StepStatus,
};
use cam_core::{
    AgentSessionMeta, AgentSessionStatus, Clock, EngineEvent, PipelineId, PipelineRequest,
    SessionId, SessionMode, TaskId, TaskRow, TaskSource, TaskStatus, User, UserId,
};
use cam_adapters::resolve_repo_path;
use cam_storage::{SessionPoolStore, TaskRepository};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a successful create hands back to the dispatcher.
#[derive(Debug, Clone)]
pub struct PipelineCreated {
    pub pipeline_id: PipelineId,
    /// Task ids of the first step's nodes, in node order.
    pub task_ids: Vec<TaskId>,
    /// Runtime session ids of the first step's nodes, in node order.
    pub session_ids: Vec<SessionId>,
}

/// Cancellation work collected under the pipelines lock.
#[derive(Default)]
struct CascadePlan {
    /// Nodes that were running: their sessions get a raw cancel.
    running: Vec<(SessionId, TaskId)>,
    /// Current-step nodes that never launched. Their rows may already be
    /// `running` (bulk insert / promote), so the wider expected set applies.
    current_pending: Vec<TaskId>,
    /// Draft nodes in later steps.
    downstream_pending: Vec<TaskId>,
}

fn hook_key(pipeline_id: &PipelineId, step_index: usize, node_index: usize) -> String {
    format!("{}:{}:{}", pipeline_id, step_index, node_index)
}

/// Mutate the pipeline for a terminal cascade: cancel running nodes of the
/// current step (minus any already-terminal ones) and all draft nodes
/// everywhere, releasing leases as nodes go terminal.
fn collect_cascade(pipeline: &mut Pipeline, step_index: usize) -> CascadePlan {
    let mut plan = CascadePlan::default();

    for si in 0..pipeline.steps.len() {
        for ni in 0..pipeline.steps[si].nodes.len() {
            let status = pipeline.steps[si].nodes[ni].status;
            match status {
                NodeStatus::Running if si == step_index => {
                    let (session_id, task_id, lease_key) = {
                        let node = &mut pipeline.steps[si].nodes[ni];
                        node.status = NodeStatus::Cancelled;
                        (node.session_id.clone(), node.task_id.clone(), node.lease_key.take())
                    };
                    if let Some(key) = lease_key {
                        pipeline.release_lease(&key);
                    }
                    match session_id {
                        Some(session_id) => plan.running.push((session_id, task_id)),
                        None => plan.current_pending.push(task_id),
                    }
                }
                NodeStatus::Draft => {
                    let (task_id, lease_key) = {
                        let node = &mut pipeline.steps[si].nodes[ni];
                        node.status = NodeStatus::Cancelled;
                        (node.task_id.clone(), node.lease_key.take())
                    };
                    if let Some(key) = lease_key {
                        pipeline.release_lease(&key);
                    }
                    if si == step_index {
                        plan.current_pending.push(task_id);
                    } else {
                        plan.downstream_pending.push(task_id);
                    }
                }
                _ => {}
            }
        }
    }

    plan
}

impl<R, P, S, I, C> Engine<R, P, S, I, C>
where
    R: TaskRepository,
    P: SessionPoolStore,
    S: SecretResolver,
    I: RepoIndex,
    C: Clock,
{
    // -----------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------

    /// Validate the request, mirror every node as a task row in one
    /// transaction, register the pipeline, and launch the first step.
    pub async fn create_pipeline(
        self: &Arc<Self>,
        req: PipelineRequest,
        user: &User,
    ) -> Result<PipelineCreated, EngineError> {
        if req.steps.len() < 2 {
            return Err(EngineError::InvalidPipeline(
                "a pipeline needs at least 2 steps".to_string(),
            ));
        }

        let default_agent = req
            .agent_id
            .clone()
            .unwrap_or_else(|| "claude-code".to_string());

        // Normalize steps: empty parallel lists become one implicit node.
        let normalized: Vec<Vec<(String, String, String)>> = req
            .steps
            .iter()
            .map(|step| step.effective_nodes(&default_agent))
            .collect();
        for (si, nodes) in normalized.iter().enumerate() {
            if nodes.is_empty() {
                return Err(EngineError::InvalidPipeline(format!(
                    "step {} has no nodes",
                    si
                )));
            }
            for (_, _, agent_id) in nodes {
                if self.catalog.get(agent_id).is_none() {
                    return Err(EngineError::AgentNotFound(agent_id.clone()));
                }
            }
        }

        let repo_path =
            resolve_repo_path(req.work_dir.as_deref(), req.repo_url.as_deref(), &self.repo_index)
                .await;
        let repo_str = repo_path.display().to_string();

        // Prepared sessions: only reopenable modes make sense, and managed
        // entries must be backed by a pool row of this user that matches
        // and is not already part of another live pipeline.
        let prepared: Vec<_> = req
            .prepared_sessions
            .iter()
            .cloned()
            .map(|p| p.into_prepared())
            .collect();
        let live_keys = self.live_managed_keys(&user.id);
        for prep in &prepared {
            if prep.mode == SessionMode::Create {
                return Err(EngineError::PreparedRejected(format!(
                    "{}: prepared sessions must use resume or continue",
                    prep.session_key
                )));
            }
            if prep.source != PreparedSource::Managed {
                continue;
            }
            if live_keys.contains(&prep.session_key) {
                return Err(EngineError::PreparedRejected(format!(
                    "{}: leased by another live pipeline",
                    prep.session_key
                )));
            }
            let row = self
                .pool
                .get(&user.id, &prep.session_key)
                .await?
                .ok_or_else(|| {
                    EngineError::PreparedRejected(format!(
                        "{}: no pool row for this user",
                        prep.session_key
                    ))
                })?;
            if row.repo_path != repo_str
                || row.agent_id != prep.agent_id
                || row.mode != prep.mode
                || row.resume_conversation_id != prep.resume_conversation_id
            {
                return Err(EngineError::PreparedRejected(format!(
                    "{}: pool row does not match the request",
                    prep.session_key
                )));
            }
        }

        // Session-policy validation: reuse-only steps must be coverable
        // from the pool, per governed agent.
        let allow_create: BTreeSet<usize> = req.allow_create_step_indexes.iter().copied().collect();
        if req.session_policy == cam_core::pipeline::SessionPolicy::ReuseOnly {
            for (si, nodes) in normalized.iter().enumerate() {
                if allow_create.contains(&si) {
                    continue;
                }
                let mut needed: std::collections::HashMap<&str, usize> = Default::default();
                for (_, _, agent_id) in nodes {
                    if is_session_governed(agent_id) {
                        *needed.entry(agent_id.as_str()).or_default() += 1;
                    }
                }
                for (agent_id, needed) in needed {
                    let available = prepared
                        .iter()
                        .filter(|p| p.agent_id == agent_id)
                        .count();
                    if available < needed {
                        return Err(EngineError::InsufficientPool {
                            step_index: si,
                            agent_id: agent_id.to_string(),
                            needed,
                            available,
                        });
                    }
                }
            }
        }

        // Capacity: the user's live sessions plus the whole first step.
        let live = self.pty.list_by_user(&user.id).len();
        if live + normalized[0].len() > self.config.max_sessions_per_user {
            return Err(EngineError::Pty(cam_pty::PtyError::SessionLimit(live)));
        }

        // Build the in-memory pipeline.
        let pipeline_id = PipelineId::new(uuid::Uuid::new_v4().to_string());
        let now = self.clock.epoch_ms();
        let steps: Vec<PipelineStep> = req
            .steps
            .iter()
            .zip(normalized.iter())
            .map(|(step_req, nodes)| PipelineStep {
                title: step_req.title.clone(),
                prompt: step_req.prompt.clone(),
                input_condition: step_req.input_condition.clone(),
                input_files: step_req.input_files.clone(),
                status: StepStatus::Pending,
                nodes: nodes
                    .iter()
                    .map(|(title, prompt, agent_id)| PipelineNode {
                        title: title.clone(),
                        prompt: prompt.clone(),
                        agent_id: agent_id.clone(),
                        task_id: TaskId::new(uuid::Uuid::new_v4().to_string()),
                        status: NodeStatus::Draft,
                        session_source: None,
                        lease_key: None,
                        session_id: None,
                    })
                    .collect(),
            })
            .collect();

        let pipeline = Pipeline {
            id: pipeline_id.clone(),
            user_id: user.id.clone(),
            repo_path: repo_path.clone(),
            default_agent_id: default_agent,
            steps,
            current_step_index: 0,
            status: PipelineStatus::Running,
            session_policy: req.session_policy,
            allow_create_step_indexes: allow_create,
            prepared_sessions: prepared,
            created_at_ms: now,
        };

        // Mirror every node in one transaction: step 0 starts `running`,
        // later steps `draft`. A failure here leaves nothing registered.
        let mut rows: Vec<TaskRow> = Vec::new();
        for (si, step) in pipeline.steps.iter().enumerate() {
            for (ni, node) in step.nodes.iter().enumerate() {
                rows.push(TaskRow {
                    id: node.task_id.clone(),
                    user_id: user.id.clone(),
                    title: node.title.clone(),
                    description: render_node_prompt(&pipeline, si, ni),
                    agent_id: node.agent_id.clone(),
                    repo_url: req.repo_url.clone(),
                    work_branch: None,
                    work_dir: Some(repo_str.clone()),
                    status: if si == 0 {
                        TaskStatus::Running
                    } else {
                        TaskStatus::Draft
                    },
                    source: TaskSource::Terminal,
                    group_id: Some(pipeline_id.clone()),
                    created_at_ms: now,
                    started_at_ms: (si == 0).then_some(now),
                    finished_at_ms: None,
                    retry_count: 0,
                });
            }
        }
        self.tasks.insert_tasks(&rows).await?;

        let step0_tasks = pipeline.step_task_ids(0);
        self.pipelines
            .lock()
            .insert(pipeline_id.clone(), pipeline);

        tracing::info!(
            pipeline_id = %pipeline_id,
            steps = req.steps.len(),
            repo = %repo_str,
            "pipeline created"
        );

        let launched = self.start_step_nodes(&pipeline_id, 0, user).await?;
        Ok(PipelineCreated {
            pipeline_id,
            task_ids: step0_tasks,
            session_ids: launched.into_iter().map(|m| m.session_id).collect(),
        })
    }

    // -----------------------------------------------------------------
    // Step launch
    // -----------------------------------------------------------------

    /// Launch every node of a step. Any node failing to start rolls the
    /// whole pipeline back.
    pub(crate) async fn start_step_nodes(
        self: &Arc<Self>,
        pipeline_id: &PipelineId,
        step_index: usize,
        user: &User,
    ) -> Result<Vec<AgentSessionMeta>, EngineError> {
        let now = self.clock.epoch_ms();

        // Snapshot for rendering; set the step index while we hold the lock.
        let snapshot = {
            let mut pipelines = self.pipelines.lock();
            let pipeline = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.clone()))?;
            pipeline.current_step_index = step_index;
            pipeline.clone()
        };
        let repo_path = snapshot.repo_path.clone();

        if let Err(e) = ensure_step_workspace(&repo_path, &snapshot, step_index, now) {
            self.rollback_step(pipeline_id, step_index).await;
            return Err(e.into());
        }

        let node_count = snapshot.steps[step_index].nodes.len();
        let mut launched: Vec<AgentSessionMeta> = Vec::with_capacity(node_count);

        for ni in 0..node_count {
            let (agent_id, task_id) = {
                let node = &snapshot.steps[step_index].nodes[ni];
                (node.agent_id.clone(), node.task_id.clone())
            };

            // Acquire the session plan: lease a prepared conversation, or
            // fall back to a fresh one where the policy allows.
            let plan = {
                let mut pipelines = self.pipelines.lock();
                let Some(pipeline) = pipelines.get_mut(pipeline_id) else {
                    return Err(EngineError::PipelineNotFound(pipeline_id.clone()));
                };
                let lease = if is_session_governed(&agent_id) {
                    pipeline.lease_prepared(&agent_id, &task_id, step_index)
                } else {
                    None
                };
                match lease {
                    Some(lease) => {
                        let node = &mut pipeline.steps[step_index].nodes[ni];
                        node.lease_key = Some(lease.session_key.clone());
                        node.session_source = Some(NodeSessionSource::Reused);
                        Some((lease.mode, lease.resume_conversation_id, Some(lease.session_key)))
                    }
                    None if pipeline.allow_create_for(step_index) => {
                        let node = &mut pipeline.steps[step_index].nodes[ni];
                        node.session_source = Some(NodeSessionSource::Created);
                        Some((SessionMode::Create, None, None))
                    }
                    None => None,
                }
            };
            let Some((mode, resume_conversation_id, lease_key)) = plan else {
                self.rollback_step(pipeline_id, step_index).await;
                return Err(EngineError::InsufficientPool {
                    step_index,
                    agent_id: agent_id.clone(),
                    needed: 1,
                    available: 0,
                });
            };

            let rendered = render_node_prompt(&snapshot, step_index, ni);

            // Hook injection is best effort: a node without a hook falls
            // back to the agent's non-interactive auto-exit form.
            let mut hooked = false;
            if supports_completion_hook(&agent_id) {
                let token = uuid::Uuid::new_v4().to_string();
                let spec = HookSpec {
                    port: self.config.callback_port,
                    token: token.clone(),
                    pipeline_id: pipeline_id.clone(),
                    task_id: task_id.clone(),
                };
                match inject_step_done_hook(&repo_path, &spec) {
                    Ok(cleanup) => {
                        self.hook_cleanups
                            .lock()
                            .insert(hook_key(pipeline_id, step_index, ni), cleanup);
                        self.callback_tokens.lock().insert(
                            token,
                            TokenClaim {
                                pipeline_id: pipeline_id.clone(),
                                task_id: task_id.clone(),
                            },
                        );
                        hooked = true;
                    }
                    Err(e) => {
                        tracing::warn!(
                            pipeline_id = %pipeline_id,
                            step_index,
                            node_index = ni,
                            error = %e,
                            "hook injection failed, falling back to auto-exit"
                        );
                    }
                }
            }

            let created = self
                .create_agent_session(
                    CreateAgentSession {
                        agent_id: agent_id.clone(),
                        prompt: rendered.clone(),
                        mode,
                        resume_conversation_id,
                        work_dir: Some(repo_path.display().to_string()),
                        repo_url: None,
                        auto_exit: !hooked,
                        cols: 80,
                        rows: 24,
                        pipeline_task_id: Some(task_id.clone()),
                        pipeline_id: Some(pipeline_id.clone()),
                    },
                    user,
                )
                .await;

            let meta = match created {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(
                        pipeline_id = %pipeline_id,
                        step_index,
                        node_index = ni,
                        error = %e,
                        "node failed to start, rolling the pipeline back"
                    );
                    self.rollback_step(pipeline_id, step_index).await;
                    return Err(e);
                }
            };

            if let Err(e) = write_node_task_file(&repo_path, step_index, ni, &rendered) {
                tracing::warn!(error = %e, "node task file write failed");
            }

            {
                let mut pipelines = self.pipelines.lock();
                if let Some(pipeline) = pipelines.get_mut(pipeline_id) {
                    let node = &mut pipeline.steps[step_index].nodes[ni];
                    node.status = NodeStatus::Running;
                    node.session_id = Some(meta.session_id.clone());
                    if let Some(key) = &lease_key {
                        pipeline.bind_lease_session(key, meta.session_id.clone());
                    }
                }
            }
            launched.push(meta);
        }

        {
            let mut pipelines = self.pipelines.lock();
            if let Some(pipeline) = pipelines.get_mut(pipeline_id) {
                pipeline.steps[step_index].status = StepStatus::Running;
            }
        }

        tracing::info!(
            pipeline_id = %pipeline_id,
            step_index,
            nodes = launched.len(),
            "step nodes launched"
        );
        Ok(launched)
    }

    /// Launch failure: fail the pipeline, unwind everything started.
    async fn rollback_step(self: &Arc<Self>, pipeline_id: &PipelineId, step_index: usize) {
        let plan = {
            let mut pipelines = self.pipelines.lock();
            let Some(pipeline) = pipelines.get_mut(pipeline_id) else {
                return;
            };
            pipeline.status = PipelineStatus::Failed;
            pipeline.steps[step_index].status = StepStatus::Failed;
            let plan = collect_cascade(pipeline, step_index);
            // Launch rollback releases everything, leased or not.
            for prepared in &mut pipeline.prepared_sessions {
                prepared.release();
            }
            plan
        };
        self.pipeline_finished_at
            .lock()
            .insert(pipeline_id.clone(), self.clock.epoch_ms());

        self.execute_cascade(plan).await;
        self.drop_pipeline_hooks_and_tokens(pipeline_id);
    }

    /// Apply a collected cascade outside the lock.
    async fn execute_cascade(self: &Arc<Self>, plan: CascadePlan) {
        let now = self.clock.epoch_ms();
        for (session_id, _task_id) in &plan.running {
            self.cancel_session_raw(session_id).await;
        }
        for task_id in &plan.current_pending {
            let _ = self
                .tasks
                .update_status_conditional(
                    task_id,
                    TaskStatus::Cancelled,
                    &[
                        TaskStatus::Draft,
                        TaskStatus::Queued,
                        TaskStatus::Waiting,
                        TaskStatus::Running,
                    ],
                    Some(now),
                )
                .await;
        }
        for task_id in &plan.downstream_pending {
            let _ = self
                .tasks
                .update_status_conditional(
                    task_id,
                    TaskStatus::Cancelled,
                    &[TaskStatus::Draft, TaskStatus::Queued, TaskStatus::Waiting],
                    Some(now),
                )
                .await;
        }
    }

    // -----------------------------------------------------------------
    // Node completion
    // -----------------------------------------------------------------

    /// A node reached a terminal state. Idempotent: the first observation
    /// of a given node wins, later ones return untouched.
    pub(crate) async fn mark_node_done(
        self: &Arc<Self>,
        pipeline_id: &PipelineId,
        session_id: &SessionId,
        success: bool,
    ) {
        enum Outcome {
            NodeCompleted {
                hook: String,
            },
            StepCompleted {
                hook: String,
                task_id: TaskId,
                user_id: UserId,
                auto_advance: bool,
            },
            NodeFailed {
                step_index: usize,
            },
        }

        let outcome = {
            let mut pipelines = self.pipelines.lock();
            let Some(pipeline) = pipelines.get_mut(pipeline_id) else {
                return;
            };
            let Some((si, ni)) = pipeline.find_node_by_session(session_id) else {
                return;
            };
            if pipeline.steps[si].nodes[ni].status.is_terminal() {
                return;
            }

            if success {
                let (task_id, lease_key) = {
                    let node = &mut pipeline.steps[si].nodes[ni];
                    node.status = NodeStatus::Completed;
                    (node.task_id.clone(), node.lease_key.take())
                };
                if let Some(key) = lease_key {
                    pipeline.release_lease(&key);
                }
                if pipeline.steps[si].all_completed() {
                    pipeline.steps[si].status = StepStatus::Completed;
                    Outcome::StepCompleted {
                        hook: hook_key(pipeline_id, si, ni),
                        task_id,
                        user_id: pipeline.user_id.clone(),
                        auto_advance: pipeline.status == PipelineStatus::Running,
                    }
                } else {
                    Outcome::NodeCompleted {
                        hook: hook_key(pipeline_id, si, ni),
                    }
                }
            } else {
                let lease_key = {
                    let node = &mut pipeline.steps[si].nodes[ni];
                    node.status = NodeStatus::Failed;
                    node.lease_key.take()
                };
                if let Some(key) = lease_key {
                    pipeline.release_lease(&key);
                }
                pipeline.steps[si].status = StepStatus::Failed;
                pipeline.status = PipelineStatus::Failed;
                Outcome::NodeFailed { step_index: si }
            }
        };

        match outcome {
            Outcome::NodeCompleted { hook } => {
                self.run_hook_cleanup(&hook);
            }
            Outcome::StepCompleted {
                hook,
                task_id,
                user_id,
                auto_advance,
            } => {
                self.run_hook_cleanup(&hook);
                self.events.publish(EngineEvent::PipelineStepCompleted {
                    pipeline_id: pipeline_id.clone(),
                    task_id,
                    user_id: user_id.clone(),
                    session_id: session_id.clone(),
                });
                if auto_advance {
                    // The dispatcher advances on the event too; advancement
                    // is guarded so the duplicate is a no-op. This path
                    // keeps headless pipelines moving.
                    let engine = Arc::clone(self);
                    let pipeline_id = pipeline_id.clone();
                    let user = User {
                        id: user_id,
                        username: String::new(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = engine.advance_pipeline(&pipeline_id, &user).await {
                            tracing::warn!(pipeline_id = %pipeline_id, error = %e, "auto-advance failed");
                        }
                    });
                }
            }
            Outcome::NodeFailed { step_index } => {
                let plan = {
                    let mut pipelines = self.pipelines.lock();
                    match pipelines.get_mut(pipeline_id) {
                        Some(pipeline) => collect_cascade(pipeline, step_index),
                        None => CascadePlan::default(),
                    }
                };
                self.pipeline_finished_at
                    .lock()
                    .insert(pipeline_id.clone(), self.clock.epoch_ms());
                self.execute_cascade(plan).await;
                self.drop_pipeline_hooks_and_tokens(pipeline_id);
                tracing::info!(pipeline_id = %pipeline_id, step_index, "pipeline failed on node failure");
            }
        }
    }

    fn run_hook_cleanup(&self, key: &str) {
        let cleanup = self.hook_cleanups.lock().remove(key);
        if let Some(mut cleanup) = cleanup {
            cleanup.run();
        }
    }

    // -----------------------------------------------------------------
    // Advancement and control
    // -----------------------------------------------------------------

    /// Move to the next step when the current one is completed. Safe to
    /// call redundantly: anything but "running pipeline with a completed
    /// current step" is a no-op returning `None`.
    pub async fn advance_pipeline(
        self: &Arc<Self>,
        pipeline_id: &PipelineId,
        user: &User,
    ) -> Result<Option<Vec<AgentSessionMeta>>, EngineError> {
        enum Advance {
            Finished(UserId),
            Launch(usize),
            Hold,
        }

        let decision = {
            let mut pipelines = self.pipelines.lock();
            let pipeline = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.clone()))?;
            if pipeline.status != PipelineStatus::Running {
                Advance::Hold
            } else {
                let cur = pipeline.current_step_index;
                if pipeline.steps[cur].status != StepStatus::Completed {
                    Advance::Hold
                } else if cur + 1 >= pipeline.steps.len() {
                    pipeline.status = PipelineStatus::Completed;
                    Advance::Finished(pipeline.user_id.clone())
                } else {
                    // Claim the next step inside the lock so concurrent
                    // advancers cannot double-launch it.
                    pipeline.current_step_index = cur + 1;
                    Advance::Launch(cur + 1)
                }
            }
        };

        match decision {
            Advance::Hold => Ok(None),
            Advance::Finished(user_id) => {
                self.pipeline_finished_at
                    .lock()
                    .insert(pipeline_id.clone(), self.clock.epoch_ms());
                self.events.publish(EngineEvent::PipelineCompleted {
                    pipeline_id: pipeline_id.clone(),
                    user_id,
                });
                tracing::info!(pipeline_id = %pipeline_id, "pipeline completed");
                Ok(None)
            }
            Advance::Launch(next) => Ok(Some(self.start_step_nodes(pipeline_id, next, user).await?)),
        }
    }

    /// `running → paused`. Nothing in flight is cancelled.
    pub fn pause_pipeline(&self, pipeline_id: &PipelineId) -> Result<(), EngineError> {
        let mut pipelines = self.pipelines.lock();
        let pipeline = pipelines
            .get_mut(pipeline_id)
            .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.clone()))?;
        match pipeline.status {
            PipelineStatus::Running => {
                pipeline.status = PipelineStatus::Paused;
                Ok(())
            }
            PipelineStatus::Paused => Ok(()),
            _ => Err(EngineError::PipelineConflict(pipeline_id.clone())),
        }
    }

    /// `paused → running`; when the current step already finished while
    /// paused, advance immediately.
    pub async fn resume_pipeline(
        self: &Arc<Self>,
        pipeline_id: &PipelineId,
        user: &User,
    ) -> Result<Option<Vec<AgentSessionMeta>>, EngineError> {
        {
            let mut pipelines = self.pipelines.lock();
            let pipeline = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.clone()))?;
            match pipeline.status {
                PipelineStatus::Paused => pipeline.status = PipelineStatus::Running,
                PipelineStatus::Running => {}
                _ => return Err(EngineError::PipelineConflict(pipeline_id.clone())),
            }
        }
        self.advance_pipeline(pipeline_id, user).await
    }

    /// Cancel everything: running nodes of the current step, every draft
    /// node, all hooks and callback tokens.
    pub async fn cancel_pipeline(self: &Arc<Self>, pipeline_id: &PipelineId) -> Result<(), EngineError> {
        let plan = {
            let mut pipelines = self.pipelines.lock();
            let pipeline = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.clone()))?;
            if pipeline.status.is_terminal() {
                return Ok(());
            }
            pipeline.status = PipelineStatus::Cancelled;
            let cur = pipeline.current_step_index;
            let plan = collect_cascade(pipeline, cur);
            pipeline.steps[cur].status = pipeline.steps[cur].derived_status();
            plan
        };
        self.pipeline_finished_at
            .lock()
            .insert(pipeline_id.clone(), self.clock.epoch_ms());

        self.execute_cascade(plan).await;
        self.drop_pipeline_hooks_and_tokens(pipeline_id);
        tracing::info!(pipeline_id = %pipeline_id, "pipeline cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Completion hooks
    // -----------------------------------------------------------------

    /// An agent POSTed its completion callback. Consume the single-use
    /// token, complete the node without waiting for the child to exit,
    /// then interrupt the interactive agent and give it the grace window.
    pub async fn notify_step_completed(
        self: &Arc<Self>,
        token: &str,
        pipeline_id: &PipelineId,
        task_id: &TaskId,
    ) -> Result<(), EngineError> {
        {
            let mut tokens = self.callback_tokens.lock();
            match tokens.get(token) {
                Some(claim)
                    if claim.pipeline_id == *pipeline_id && claim.task_id == *task_id =>
                {
                    tokens.remove(token);
                }
                _ => return Err(EngineError::InvalidToken),
            }
        }

        let session_id = {
            let pipelines = self.pipelines.lock();
            let pipeline = pipelines
                .get(pipeline_id)
                .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.clone()))?;
            if !pipeline.status.is_active() {
                return Err(EngineError::PipelineConflict(pipeline_id.clone()));
            }
            let (si, ni) = pipeline
                .find_node_by_task(task_id)
                .ok_or_else(|| EngineError::PipelineConflict(pipeline_id.clone()))?;
            let node = &pipeline.steps[si].nodes[ni];
            if node.status != NodeStatus::Running {
                return Err(EngineError::PipelineConflict(pipeline_id.clone()));
            }
            node.session_id
                .clone()
                .ok_or_else(|| EngineError::PipelineConflict(pipeline_id.clone()))?
        };

        // Close the session meta first so the eventual child exit no-ops.
        let now = self.clock.epoch_ms();
        let meta = {
            let mut sessions = self.sessions.lock();
            sessions.get_mut(&session_id).map(|meta| {
                meta.finish(AgentSessionStatus::Completed, None, now);
                meta.clone()
            })
        };
        self.session_finished_at.lock().insert(session_id.clone(), now);

        if let Err(e) = self
            .tasks
            .update_status_conditional(
                task_id,
                TaskStatus::Completed,
                &[TaskStatus::Running],
                Some(now),
            )
            .await
        {
            tracing::warn!(task_id = %task_id, error = %e, "hook completion status update failed");
        }

        self.mark_node_done(pipeline_id, &session_id, true).await;

        // Exit the interactive agent cleanly instead of timing out.
        let _ = self.pty.send_interrupt(&session_id);
        self.schedule_forced_destroy(&session_id);

        if let Some(meta) = meta {
            self.events.publish(EngineEvent::AgentStatusChanged {
                user_id: meta.user_id.clone(),
                session_id: session_id.clone(),
                task_id: Some(task_id.clone()),
                status: AgentSessionStatus::Completed,
                exit_code: None,
                branch: None,
                last_commit: None,
            });
        }

        tracing::info!(
            pipeline_id = %pipeline_id,
            task_id = %task_id,
            session_id = %session_id,
            "step completion callback consumed"
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn get_pipeline(&self, pipeline_id: &PipelineId) -> Option<Pipeline> {
        self.maybe_gc();
        self.pipelines.lock().get(pipeline_id).cloned()
    }

    pub fn list_pipelines_by_user(&self, user_id: &UserId) -> Vec<Pipeline> {
        self.maybe_gc();
        let pipelines = self.pipelines.lock();
        pipelines
            .values()
            .filter(|p| &p.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
