// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-session lifecycle and engine state.

use crate::error::EngineError;
use crate::persist::{start_persistence, PersisterHandle};
use cam_adapters::{
    collect_repo_summary, create_work_branch, generate_work_branch, resolve_repo_path,
    HookCleanup, RepoIndex, SecretContext, SecretResolver,
};
use cam_core::agent::AgentCatalog;
use cam_core::{
    build_exec_plan, AgentSessionMeta, AgentSessionStatus, Clock, CommandRequest, EngineEvent,
    EventTopic, Pipeline, PipelineId, SessionId, SessionMode, TaskId, TaskRow, TaskSource,
    TaskStatus, User, UserId,
};
use cam_pty::{PtyCreateOpts, PtyExit, PtyManager};
use cam_storage::{
    SessionPoolFilter, SessionPoolRow, SessionPoolStore, SessionPoolUpsert, TaskRepository,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Grace window between interrupt and forced destroy.
pub const CANCEL_TIMEOUT_MS: u64 = 3_000;

/// Idle timeout for agent sessions (interactive agents sit quiet for long).
pub const AGENT_IDLE_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Finished sessions are pruned after this long.
pub const FINISHED_SESSION_TTL_MS: u64 = 10 * 60 * 1000;

/// Finished pipelines are pruned after this long.
pub const FINISHED_PIPELINE_TTL_MS: u64 = 30 * 60 * 1000;

/// The pruner runs at most this often, triggered from read paths.
pub const GC_MIN_INTERVAL_MS: u64 = 60 * 1000;

/// How long an exit handler waits for the final log drain.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port the completion-hook callback URL points at.
    pub callback_port: u16,
    /// Per-user live PTY cap (mirrors the PTY manager's).
    pub max_sessions_per_user: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            callback_port: 9690,
            max_sessions_per_user: cam_pty::DEFAULT_MAX_SESSIONS_PER_USER,
        }
    }
}

/// External collaborators handed to the engine.
pub struct EngineDeps<R, P, S, I> {
    pub tasks: Arc<R>,
    pub pool: Arc<P>,
    pub secrets: S,
    pub repo_index: I,
}

/// Options for creating an agent session.
#[derive(Debug, Clone)]
pub struct CreateAgentSession {
    pub agent_id: String,
    pub prompt: String,
    pub mode: SessionMode,
    pub resume_conversation_id: Option<String>,
    pub work_dir: Option<String>,
    pub repo_url: Option<String>,
    pub auto_exit: bool,
    pub cols: u16,
    pub rows: u16,
    /// Pipeline-internal: promote this existing row instead of inserting.
    pub pipeline_task_id: Option<TaskId>,
    /// Pipeline-internal: the owning pipeline.
    pub pipeline_id: Option<PipelineId>,
}

impl CreateAgentSession {
    pub fn new(agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            mode: SessionMode::Create,
            resume_conversation_id: None,
            work_dir: None,
            repo_url: None,
            auto_exit: false,
            cols: 80,
            rows: 24,
            pipeline_task_id: None,
            pipeline_id: None,
        }
    }
}

/// Meta plus liveness, for listings.
#[derive(Debug, Clone)]
pub struct AgentSessionSummary {
    pub meta: AgentSessionMeta,
    pub pty_alive: bool,
}

pub(crate) struct TokenClaim {
    pub pipeline_id: PipelineId,
    pub task_id: TaskId,
}

/// The orchestration engine: agent sessions plus the pipeline state machine
/// (the latter lives in `pipeline.rs`, same struct).
pub struct Engine<R, P, S, I, C> {
    pub(crate) pty: PtyManager,
    pub(crate) tasks: Arc<R>,
    pub(crate) pool: Arc<P>,
    pub(crate) secrets: S,
    pub(crate) repo_index: I,
    pub(crate) clock: C,
    pub(crate) catalog: AgentCatalog,
    pub(crate) config: EngineConfig,
    pub(crate) events: EventTopic,

    pub(crate) sessions: Mutex<HashMap<SessionId, AgentSessionMeta>>,
    pub(crate) task_index: Mutex<HashMap<TaskId, SessionId>>,
    pub(crate) pipelines: Mutex<HashMap<PipelineId, Pipeline>>,
    pub(crate) hook_cleanups: Mutex<HashMap<String, HookCleanup>>,
    pub(crate) callback_tokens: Mutex<HashMap<String, TokenClaim>>,
    pub(crate) session_finished_at: Mutex<HashMap<SessionId, u64>>,
    pub(crate) pipeline_finished_at: Mutex<HashMap<PipelineId, u64>>,
    persisters: Mutex<HashMap<SessionId, PersisterHandle>>,
    last_gc_ms: AtomicU64,
}

impl<R, P, S, I, C> Engine<R, P, S, I, C>
where
    R: TaskRepository,
    P: SessionPoolStore,
    S: SecretResolver,
    I: RepoIndex,
    C: Clock,
{
    pub fn new(
        deps: EngineDeps<R, P, S, I>,
        pty: PtyManager,
        catalog: AgentCatalog,
        clock: C,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pty,
            tasks: deps.tasks,
            pool: deps.pool,
            secrets: deps.secrets,
            repo_index: deps.repo_index,
            clock,
            catalog,
            config,
            events: EventTopic::new(),
            sessions: Mutex::new(HashMap::new()),
            task_index: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            hook_cleanups: Mutex::new(HashMap::new()),
            callback_tokens: Mutex::new(HashMap::new()),
            session_finished_at: Mutex::new(HashMap::new()),
            pipeline_finished_at: Mutex::new(HashMap::new()),
            persisters: Mutex::new(HashMap::new()),
            last_gc_ms: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventTopic {
        &self.events
    }

    pub fn pty(&self) -> &PtyManager {
        &self.pty
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    /// Consume PTY exit notifications for the lifetime of the daemon.
    pub fn run_exit_loop(
        self: &Arc<Self>,
        mut exit_rx: mpsc::UnboundedReceiver<PtyExit>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(exit) = exit_rx.recv().await {
                engine
                    .handle_agent_exit(&exit.session_id, exit.exit_code)
                    .await;
            }
        })
    }

    // -----------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------

    /// Launch an agent session: resolve the agent and repo, build the exec
    /// plan, spawn the PTY, and create or promote the task row.
    pub async fn create_agent_session(
        self: &Arc<Self>,
        opts: CreateAgentSession,
        user: &User,
    ) -> Result<AgentSessionMeta, EngineError> {
        let def = self
            .catalog
            .get(&opts.agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(opts.agent_id.clone()))?
            .clone();

        let repo_path =
            resolve_repo_path(opts.work_dir.as_deref(), opts.repo_url.as_deref(), &self.repo_index)
                .await;

        // Resolve the agent's environment through the secret resolver.
        let ctx = SecretContext {
            agent_id: &def.id,
            repo_url: opts.repo_url.as_deref(),
        };
        let mut env = HashMap::new();
        for spec in &def.env_vars {
            match self.secrets.resolve(&spec.name, &ctx).await {
                Some(value) => {
                    env.insert(spec.name.clone(), value);
                }
                None if spec.required => {
                    return Err(EngineError::MissingEnv {
                        agent: def.id.clone(),
                        name: spec.name.clone(),
                    });
                }
                None => {}
            }
        }

        // Create-mode sessions get their own work branch, best effort.
        let work_branch = if opts.mode == SessionMode::Create {
            let branch = generate_work_branch();
            create_work_branch(&repo_path, &branch).await;
            Some(branch)
        } else {
            None
        };

        let plan = build_exec_plan(&CommandRequest {
            agent_id: def.id.clone(),
            executable: def.executable.clone(),
            default_args: def.default_args.clone(),
            mode: opts.mode,
            prompt: Some(opts.prompt.clone()),
            resume_conversation_id: opts.resume_conversation_id.clone(),
            auto_exit: opts.auto_exit,
        });

        let created = self.pty.create(PtyCreateOpts {
            cols: opts.cols,
            rows: opts.rows,
            file: Some(plan.file),
            args: plan.args,
            shell: None,
            user_id: user.id.clone(),
            env,
            cwd: Some(repo_path.clone()),
            idle_timeout: Some(AGENT_IDLE_TIMEOUT),
            runtime: def.runtime,
        })?;
        let session_id = created.session_id;
        let now = self.clock.epoch_ms();

        // Create or promote the durable mirror. First-step rows are bulk
        // inserted as `running` already, so the whitelist includes it: the
        // promote is then a stamp, not a transition.
        const PROMOTE_FROM: &[TaskStatus] = &[
            TaskStatus::Draft,
            TaskStatus::Queued,
            TaskStatus::Waiting,
            TaskStatus::Running,
        ];
        let task_id = match &opts.pipeline_task_id {
            Some(task_id) => {
                let affected = self
                    .tasks
                    .promote_to_running(task_id, PROMOTE_FROM, now)
                    .await?;
                if affected == 0 {
                    // The row moved under us (deleted or already terminal):
                    // unwind the PTY and report the conflict.
                    self.pty.destroy(&session_id, None);
                    return Err(EngineError::TaskConflict(task_id.clone()));
                }
                task_id.clone()
            }
            None => {
                let task_id = TaskId::new(uuid::Uuid::new_v4().to_string());
                let title = effective_title(&opts.prompt, &def.name);
                let inserted = self
                    .tasks
                    .insert_task(&TaskRow {
                        id: task_id.clone(),
                        user_id: user.id.clone(),
                        title,
                        description: opts.prompt.clone(),
                        agent_id: def.id.clone(),
                        repo_url: opts.repo_url.clone(),
                        work_branch: work_branch.clone(),
                        work_dir: Some(repo_path.display().to_string()),
                        status: TaskStatus::Running,
                        source: TaskSource::Terminal,
                        group_id: opts.pipeline_id.clone(),
                        created_at_ms: now,
                        started_at_ms: Some(now),
                        finished_at_ms: None,
                        retry_count: 0,
                    })
                    .await;
                if let Err(e) = inserted {
                    // Launch without a mirror is worse than no launch.
                    self.pty.destroy(&session_id, None);
                    return Err(e.into());
                }
                task_id
            }
        };

        let meta = AgentSessionMeta {
            session_id: session_id.clone(),
            user_id: user.id.clone(),
            agent_id: def.id.clone(),
            agent_name: def.name.clone(),
            prompt: opts.prompt,
            repo_path: repo_path.clone(),
            mode: opts.mode,
            work_branch,
            resume_conversation_id: opts.resume_conversation_id,
            status: AgentSessionStatus::Running,
            started_at_ms: now,
            finished_at_ms: None,
            exit_code: None,
            task_id: Some(task_id.clone()),
            pipeline_id: opts.pipeline_id,
        };

        self.sessions.lock().insert(session_id.clone(), meta.clone());
        self.task_index.lock().insert(task_id.clone(), session_id.clone());

        match start_persistence(
            &self.pty,
            &session_id,
            task_id.clone(),
            Arc::clone(&self.tasks),
            self.clock.clone(),
        ) {
            Ok(handle) => {
                self.persisters.lock().insert(session_id.clone(), handle);
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "log persistence not started");
            }
        }

        self.events.publish(EngineEvent::AgentSessionCreated {
            user_id: user.id.clone(),
            session_id: session_id.clone(),
            task_id,
            agent_id: def.id,
        });

        tracing::info!(
            session_id = %session_id,
            agent_id = %meta.agent_id,
            repo = %repo_path.display(),
            mode = %meta.mode,
            "agent session created"
        );

        Ok(meta)
    }

    /// React to a child exit: drain logs, close the meta, mirror the task
    /// row, and notify the owning pipeline.
    pub async fn handle_agent_exit(self: &Arc<Self>, session_id: &SessionId, exit_code: i32) {
        // Drain logs first so the final output lands before status flips.
        if let Some(mut handle) = self.take_persister(session_id) {
            handle.stop();
            handle.drained(EXIT_DRAIN_TIMEOUT).await;
        }

        let status = if exit_code == 0 {
            AgentSessionStatus::Completed
        } else {
            AgentSessionStatus::Failed
        };
        let now = self.clock.epoch_ms();

        let (finished, meta) = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(session_id) {
                // Not an agent session (plain terminal): nothing to mirror.
                None => return,
                Some(meta) => {
                    let finished = meta.finish(status, Some(exit_code), now);
                    (finished, meta.clone())
                }
            }
        };
        if !finished {
            // A cancel or hook completion already closed this session.
            return;
        }
        self.session_finished_at.lock().insert(session_id.clone(), now);

        if let Some(task_id) = &meta.task_id {
            let to = if exit_code == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            if let Err(e) = self
                .tasks
                .update_status_conditional(task_id, to, &[TaskStatus::Running], Some(now))
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "task status update failed");
            }
        }

        if let Some(pipeline_id) = &meta.pipeline_id {
            self.mark_node_done(pipeline_id, session_id, exit_code == 0)
                .await;
        }

        // Branch and last-commit collection is slow and cosmetic: do it off
        // the exit path, then publish the status event.
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let summary = collect_repo_summary(&meta.repo_path).await;
            engine.events.publish(EngineEvent::AgentStatusChanged {
                user_id: meta.user_id.clone(),
                session_id: meta.session_id.clone(),
                task_id: meta.task_id.clone(),
                status: meta.status,
                exit_code: meta.exit_code,
                branch: summary.branch,
                last_commit: summary.last_commit,
            });
        });
    }

    /// Cancel an agent session. Sessions inside an active pipeline escalate
    /// to a pipeline cancel so the step cannot get stuck half-done.
    pub async fn cancel_agent_session(
        self: &Arc<Self>,
        session_id: &SessionId,
    ) -> Result<(), EngineError> {
        let meta = self
            .get_meta(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))?;

        if let Some(pipeline_id) = &meta.pipeline_id {
            let active = {
                let pipelines = self.pipelines.lock();
                pipelines
                    .get(pipeline_id)
                    .map(|p| p.status.is_active())
                    .unwrap_or(false)
            };
            if active {
                return self.cancel_pipeline(pipeline_id).await;
            }
        }

        self.cancel_session_raw(session_id).await;
        Ok(())
    }

    /// Interrupt, mark cancelled, mirror the task row, and schedule the
    /// forced destroy. Never escalates; pipeline paths call this directly.
    pub(crate) async fn cancel_session_raw(self: &Arc<Self>, session_id: &SessionId) {
        let _ = self.pty.send_interrupt(session_id);
        let now = self.clock.epoch_ms();

        let meta = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(session_id) {
                None => return,
                Some(meta) => {
                    if !meta.finish(AgentSessionStatus::Cancelled, None, now) {
                        return;
                    }
                    meta.clone()
                }
            }
        };
        self.session_finished_at.lock().insert(session_id.clone(), now);

        if let Some(task_id) = &meta.task_id {
            if let Err(e) = self
                .tasks
                .update_status_conditional(
                    task_id,
                    TaskStatus::Cancelled,
                    &[TaskStatus::Running],
                    Some(now),
                )
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "cancel status update failed");
            }
        }

        self.events.publish(EngineEvent::AgentStatusChanged {
            user_id: meta.user_id.clone(),
            session_id: session_id.clone(),
            task_id: meta.task_id.clone(),
            status: AgentSessionStatus::Cancelled,
            exit_code: None,
            branch: None,
            last_commit: None,
        });

        self.schedule_forced_destroy(session_id);
    }

    /// Give the child the cancel grace window, then destroy it.
    pub(crate) fn schedule_forced_destroy(self: &Arc<Self>, session_id: &SessionId) {
        let engine = Arc::clone(self);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(CANCEL_TIMEOUT_MS)).await;
            if engine.pty.has(&session_id) {
                tracing::info!(session_id = %session_id, "cancel grace elapsed, destroying pty");
                engine.pty.destroy(&session_id, Some(-1));
            }
        });
    }

    /// Used before deleting a task: stop its session if running, wait for
    /// the child to go away, drain the log buffer, and unlink the index.
    pub async fn stop_and_drain_task_session(
        self: &Arc<Self>,
        task_id: &TaskId,
        timeout: Duration,
    ) {
        let session_id = {
            let index = self.task_index.lock();
            index.get(task_id).cloned()
        };
        let Some(session_id) = session_id else {
            return;
        };

        if self
            .get_meta(&session_id)
            .map(|m| m.is_running())
            .unwrap_or(false)
        {
            let _ = self.cancel_agent_session(&session_id).await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.pty.has(&session_id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.wait_for_drain(&session_id, timeout).await;
        self.task_index.lock().remove(task_id);
    }

    /// Stop the persister (if any) and wait for its final flush.
    pub async fn wait_for_drain(&self, session_id: &SessionId, timeout: Duration) -> bool {
        let Some(mut handle) = self.take_persister(session_id) else {
            return true;
        };
        handle.stop();
        handle.drained(timeout).await
    }

    fn take_persister(&self, session_id: &SessionId) -> Option<PersisterHandle> {
        let handle = self.persisters.lock().remove(session_id)?;
        self.pty.remove_data_tap(session_id, handle.tap_id());
        Some(handle)
    }

    pub(crate) fn has_pending_flush(&self, session_id: &SessionId) -> bool {
        self.persisters.lock().contains_key(session_id)
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn list_by_user(&self, user_id: &UserId) -> Vec<AgentSessionMeta> {
        self.maybe_gc();
        let sessions = self.sessions.lock();
        sessions
            .values()
            .filter(|m| &m.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn get_meta(&self, session_id: &SessionId) -> Option<AgentSessionMeta> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Index lookup with self-healing: a missed entry is rebuilt by
    /// scanning the session table.
    pub fn get_meta_by_task_id(&self, task_id: &TaskId) -> Option<AgentSessionMeta> {
        if let Some(session_id) = self.task_index.lock().get(task_id) {
            if let Some(meta) = self.sessions.lock().get(session_id) {
                return Some(meta.clone());
            }
        }

        let found = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .find(|m| m.task_id.as_ref() == Some(task_id))
                .cloned()
        };
        if let Some(meta) = &found {
            self.task_index
                .lock()
                .insert(task_id.clone(), meta.session_id.clone());
        }
        found
    }

    pub fn get_active_session_count(&self, user_id: &UserId) -> usize {
        let sessions = self.sessions.lock();
        sessions
            .values()
            .filter(|m| &m.user_id == user_id && m.is_running())
            .count()
    }

    pub fn get_session_summaries(&self, user_id: &UserId) -> Vec<AgentSessionSummary> {
        self.maybe_gc();
        let sessions = self.sessions.lock();
        sessions
            .values()
            .filter(|m| &m.user_id == user_id)
            .map(|meta| AgentSessionSummary {
                pty_alive: self.pty.has(&meta.session_id),
                meta: meta.clone(),
            })
            .collect()
    }

    /// Ownership check spanning agent metas and plain PTY sessions.
    pub fn is_session_owned_by(&self, session_id: &SessionId, user_id: &UserId) -> bool {
        if let Some(meta) = self.get_meta(session_id) {
            return &meta.user_id == user_id;
        }
        self.pty.is_owned_by(session_id, user_id)
    }

    // -----------------------------------------------------------------
    // Session pool views (live lease annotation)
    // -----------------------------------------------------------------

    /// Session keys of this user's live pipelines' managed prepared
    /// sessions. A pool row with one of these keys counts as leased.
    pub(crate) fn live_managed_keys(&self, user_id: &UserId) -> HashSet<String> {
        let pipelines = self.pipelines.lock();
        pipelines
            .values()
            .filter(|p| &p.user_id == user_id && p.status.is_active())
            .flat_map(|p| p.managed_keys())
            .collect()
    }

    pub async fn pool_upsert(
        &self,
        user: &User,
        req: SessionPoolUpsert,
    ) -> Result<SessionPoolRow, EngineError> {
        let now = self.clock.epoch_ms();
        Ok(self.pool.upsert(&user.id, req, now).await?)
    }

    /// Pool rows annotated with the live `leased` flag.
    pub async fn pool_list(
        &self,
        user: &User,
        filter: &SessionPoolFilter,
    ) -> Result<Vec<(SessionPoolRow, bool)>, EngineError> {
        let rows = self.pool.list(&user.id, filter).await?;
        let leased = self.live_managed_keys(&user.id);
        Ok(rows
            .into_iter()
            .map(|row| {
                let is_leased = leased.contains(&row.session_key);
                (row, is_leased)
            })
            .collect())
    }

    pub async fn pool_delete(&self, user: &User, session_key: &str) -> Result<(), EngineError> {
        let leased = self.live_managed_keys(&user.id);
        Ok(self.pool.delete(&user.id, session_key, &leased).await?)
    }

    pub async fn pool_clear(&self, user: &User) -> Result<u64, EngineError> {
        let leased = self.live_managed_keys(&user.id);
        Ok(self.pool.clear(&user.id, &leased).await?)
    }

    // -----------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------

    /// Prune finished sessions and pipelines. Triggered from read paths,
    /// runs at most every [`GC_MIN_INTERVAL_MS`].
    pub fn maybe_gc(&self) {
        let now = self.clock.epoch_ms();
        let last = self.last_gc_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < GC_MIN_INTERVAL_MS {
            return;
        }
        if self
            .last_gc_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        // Sessions.
        let expired_sessions: Vec<SessionId> = {
            let finished = self.session_finished_at.lock();
            finished
                .iter()
                .filter(|(_, t)| now.saturating_sub(**t) >= FINISHED_SESSION_TTL_MS)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for session_id in expired_sessions {
            let pty_live = self.pty.has(&session_id);
            let running_again = self
                .get_meta(&session_id)
                .map(|m| m.is_running())
                .unwrap_or(false);
            if pty_live || running_again {
                // The finished stamp is stale; the session came back.
                self.session_finished_at.lock().remove(&session_id);
                continue;
            }
            if self.has_pending_flush(&session_id) {
                // Logs still draining; try again next sweep.
                continue;
            }

            let meta = self.sessions.lock().remove(&session_id);
            if let Some(meta) = meta {
                if let Some(task_id) = &meta.task_id {
                    self.task_index.lock().remove(task_id);
                }
            }
            self.session_finished_at.lock().remove(&session_id);
            tracing::debug!(session_id = %session_id, "finished session pruned");
        }

        // Pipelines.
        let expired_pipelines: Vec<PipelineId> = {
            let finished = self.pipeline_finished_at.lock();
            finished
                .iter()
                .filter(|(_, t)| now.saturating_sub(**t) >= FINISHED_PIPELINE_TTL_MS)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for pipeline_id in expired_pipelines {
            let any_live = {
                let pipelines = self.pipelines.lock();
                pipelines
                    .get(&pipeline_id)
                    .map(|p| {
                        p.steps.iter().any(|step| {
                            step.nodes
                                .iter()
                                .filter_map(|n| n.session_id.as_ref())
                                .any(|sid| self.pty.has(sid))
                        })
                    })
                    .unwrap_or(false)
            };
            if any_live {
                continue;
            }

            self.pipelines.lock().remove(&pipeline_id);
            self.pipeline_finished_at.lock().remove(&pipeline_id);
            self.drop_pipeline_hooks_and_tokens(&pipeline_id);
            tracing::debug!(pipeline_id = %pipeline_id, "finished pipeline pruned");
        }
    }

    pub(crate) fn drop_pipeline_hooks_and_tokens(&self, pipeline_id: &PipelineId) {
        let prefix = format!("{}:", pipeline_id);
        let mut cleanups = {
            let mut hooks = self.hook_cleanups.lock();
            let keys: Vec<String> = hooks
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| hooks.remove(&k))
                .collect::<Vec<_>>()
        };
        for cleanup in &mut cleanups {
            cleanup.run();
        }

        let mut tokens = self.callback_tokens.lock();
        tokens.retain(|_, claim| &claim.pipeline_id != pipeline_id);
    }
}

/// First line of the prompt, clipped, as the task title.
fn effective_title(prompt: &str, agent_name: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return format!("{} session", agent_name);
    }
    let mut title: String = first_line.chars().take(80).collect();
    if first_line.chars().count() > 80 {
        title.push('…');
    }
    title
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
