// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket dispatcher.
//!
//! One duplex socket per client. The dispatcher tracks which sessions the
//! socket is attached to and detaches (never destroys) them on disconnect;
//! agent work continues and is reattachable. It also subscribes to the
//! engine's event topic, filtered by the socket's user, and drives pipeline
//! advancement from step-completed notifications.

use crate::frames::{AgentSessionInfo, ClientFrame, ServerFrame, TerminalSessionInfo};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use cam_core::agent::AgentRuntime;
use cam_core::paths::normalize_host_path;
use cam_core::{
    AgentSessionMeta, EngineEvent, PipelineId, SessionId, User,
};
use cam_engine::{CreateAgentSession, EngineError};
use cam_pty::{PtyCreateOpts, PtyEvent};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identity handshake: authentication happens in front of the daemon; the
/// socket carries the already-established user.
#[derive(Debug, Deserialize)]
pub(crate) struct UserParams {
    user: String,
    #[serde(default)]
    name: Option<String>,
}

pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let username = params.name.clone().unwrap_or_else(|| params.user.clone());
    let user = User::new(params.user, username);
    upgrade.on_upgrade(move |socket| handle_socket(socket, state, user))
}

struct Conn {
    state: AppState,
    user: User,
    out: mpsc::UnboundedSender<ServerFrame>,
    attached: HashMap<SessionId, JoinHandle<()>>,
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let event_task = tokio::spawn(run_event_loop(
        state.clone(),
        user.clone(),
        out_tx.clone(),
    ));

    let mut conn = Conn {
        state,
        user,
        out: out_tx,
        attached: HashMap::new(),
    };

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "socket read error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => dispatch(&mut conn, frame).await,
            Err(e) => conn.send(ServerFrame::Error {
                message: format!("invalid frame: {}", e),
                session_id: None,
            }),
        }
    }

    // Disconnect detaches; it never destroys. Sessions stay reattachable.
    for (session_id, pump) in conn.attached.drain() {
        pump.abort();
        conn.state.engine.pty().detach(&session_id);
    }
    event_task.abort();
    send_task.abort();
}

/// Engine events filtered to this socket's user. Step completions drive
/// advancement; the engine's internal auto-advance makes the duplicate
/// call a no-op.
async fn run_event_loop(state: AppState, user: User, out: mpsc::UnboundedSender<ServerFrame>) {
    let mut rx = state.engine.events().subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "socket event subscriber lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if event.user_id() != &user.id {
            continue;
        }

        match event {
            EngineEvent::AgentStatusChanged {
                session_id,
                task_id,
                status,
                exit_code,
                branch,
                last_commit,
                ..
            } => {
                let _ = out.send(ServerFrame::AgentStatus {
                    session_id,
                    task_id,
                    status,
                    exit_code,
                    branch,
                    last_commit,
                });
            }
            EngineEvent::PipelineStepCompleted { pipeline_id, .. } => {
                send_step_status(&state, &pipeline_id, &out);
                match state.engine.advance_pipeline(&pipeline_id, &user).await {
                    Ok(Some(_launched)) => send_step_status(&state, &pipeline_id, &out),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(pipeline_id = %pipeline_id, error = %e, "advance from event failed")
                    }
                }
            }
            EngineEvent::PipelineCompleted { pipeline_id, .. } => {
                let _ = out.send(ServerFrame::PipelineCompleted { pipeline_id });
            }
            EngineEvent::AgentSessionCreated { .. } => {}
        }
    }
}

/// Emit a `pipeline-step-status` frame for the pipeline's current step.
fn send_step_status(state: &AppState, pipeline_id: &PipelineId, out: &mpsc::UnboundedSender<ServerFrame>) {
    let Some(pipeline) = state.engine.get_pipeline(pipeline_id) else {
        return;
    };
    let si = pipeline.current_step_index;
    let Some(step) = pipeline.steps.get(si) else {
        return;
    };
    let _ = out.send(ServerFrame::PipelineStepStatus {
        pipeline_id: pipeline_id.clone(),
        step_index: si,
        status: step.status,
        session_ids: step
            .nodes
            .iter()
            .filter_map(|n| n.session_id.clone())
            .collect(),
        task_ids: step.nodes.iter().map(|n| n.task_id.clone()).collect(),
    });
}

impl Conn {
    fn send(&self, frame: ServerFrame) {
        let _ = self.out.send(frame);
    }

    fn reject(&self, message: &str, session_id: Option<SessionId>) {
        self.send(ServerFrame::Error {
            message: message.to_string(),
            session_id,
        });
    }

    fn owns_session(&self, session_id: &SessionId) -> bool {
        self.state
            .engine
            .is_session_owned_by(session_id, &self.user.id)
    }

    /// Pipeline lookup gated on ownership.
    fn owned_pipeline(&self, pipeline_id: &PipelineId) -> Option<cam_core::Pipeline> {
        self.state
            .engine
            .get_pipeline(pipeline_id)
            .filter(|p| p.user_id == self.user.id)
    }

    fn send_agent_created(&self, meta: &AgentSessionMeta) {
        self.send(ServerFrame::AgentCreated {
            session_id: meta.session_id.clone(),
            task_id: meta.task_id.clone(),
            agent_id: meta.agent_id.clone(),
            status: meta.status,
        });
    }
}

async fn dispatch(conn: &mut Conn, frame: ClientFrame) {
    match frame {
        ClientFrame::Ping => conn.send(ServerFrame::Pong),

        ClientFrame::Create {
            cols,
            rows,
            file,
            args,
            shell,
            cwd,
            idle_timeout_ms,
        } => {
            let result = conn.state.engine.pty().create(PtyCreateOpts {
                cols: cols.unwrap_or(80),
                rows: rows.unwrap_or(24),
                file,
                args,
                shell,
                user_id: conn.user.id.clone(),
                env: HashMap::new(),
                cwd: cwd.map(|c| PathBuf::from(normalize_host_path(&c))),
                idle_timeout: idle_timeout_ms.map(Duration::from_millis),
                runtime: AgentRuntime::Native,
            });
            match result {
                Ok(created) => conn.send(ServerFrame::Created {
                    session_id: created.session_id,
                    shell: created.shell,
                }),
                Err(e) => conn.reject(&e.to_string(), None),
            }
        }

        ClientFrame::Attach { session_id } => {
            if !conn.owns_session(&session_id) {
                return conn.reject("session not found", Some(session_id));
            }
            let (tx, mut rx) = mpsc::unbounded_channel::<PtyEvent>();
            let scrollback = match conn.state.engine.pty().attach(&session_id, tx) {
                Ok(scrollback) => scrollback,
                Err(e) => return conn.reject(&e.to_string(), Some(session_id)),
            };

            // Replay, then stream.
            conn.send(ServerFrame::Output {
                session_id: session_id.clone(),
                data: String::from_utf8_lossy(&scrollback).into_owned(),
            });
            let out = conn.out.clone();
            let pump_session = session_id.clone();
            let pump = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let frame = match event {
                        PtyEvent::Data(data) => ServerFrame::Output {
                            session_id: pump_session.clone(),
                            data: String::from_utf8_lossy(&data).into_owned(),
                        },
                        PtyEvent::Exit(exit_code) => {
                            let _ = out.send(ServerFrame::Exited {
                                session_id: pump_session.clone(),
                                exit_code,
                            });
                            break;
                        }
                    };
                    if out.send(frame).is_err() {
                        break;
                    }
                }
            });
            if let Some(previous) = conn.attached.insert(session_id, pump) {
                previous.abort();
            }
        }

        ClientFrame::Input { session_id, data } => {
            if !conn.owns_session(&session_id) {
                return conn.reject("session not found", Some(session_id));
            }
            if let Err(e) = conn.state.engine.pty().write(&session_id, data.as_bytes()) {
                conn.reject(&e.to_string(), Some(session_id));
            }
        }

        ClientFrame::Resize {
            session_id,
            cols,
            rows,
        } => {
            if !conn.owns_session(&session_id) {
                return conn.reject("session not found", Some(session_id));
            }
            if let Err(e) = conn.state.engine.pty().resize(&session_id, cols, rows) {
                conn.reject(&e.to_string(), Some(session_id));
            }
        }

        ClientFrame::Destroy { session_id } => {
            if !conn.owns_session(&session_id) {
                return conn.reject("session not found", Some(session_id));
            }
            conn.state.engine.pty().destroy(&session_id, Some(-1));
        }

        ClientFrame::List => {
            conn.state.engine.maybe_gc();
            let sessions = conn
                .state
                .engine
                .pty()
                .summaries_for_user(&conn.user.id)
                .into_iter()
                .map(|s| TerminalSessionInfo {
                    session_id: s.session_id,
                    shell: s.shell,
                    attached: s.attached,
                    scrollback_len: s.scrollback_len,
                })
                .collect();
            conn.send(ServerFrame::Sessions { sessions });
        }

        ClientFrame::AgentCreate {
            agent_id,
            prompt,
            mode,
            resume_conversation_id,
            work_dir,
            repo_url,
            auto_exit,
        } => {
            let opts = CreateAgentSession {
                agent_id,
                prompt,
                mode,
                resume_conversation_id,
                work_dir,
                repo_url,
                auto_exit,
                ..CreateAgentSession::new("", "")
            };
            match conn.state.engine.create_agent_session(opts, &conn.user).await {
                Ok(meta) => conn.send_agent_created(&meta),
                Err(e) => conn.reject(&e.to_string(), None),
            }
        }

        ClientFrame::AgentCancel { session_id } => {
            if !conn.owns_session(&session_id) {
                return conn.reject("session not found", Some(session_id));
            }
            if let Err(e) = conn.state.engine.cancel_agent_session(&session_id).await {
                conn.reject(&e.to_string(), Some(session_id));
            }
        }

        ClientFrame::AgentList => {
            let sessions = conn
                .state
                .engine
                .get_session_summaries(&conn.user.id)
                .into_iter()
                .map(|s| AgentSessionInfo {
                    session_id: s.meta.session_id.clone(),
                    task_id: s.meta.task_id.clone(),
                    agent_id: s.meta.agent_id.clone(),
                    status: s.meta.status,
                    mode: s.meta.mode,
                    work_branch: s.meta.work_branch.clone(),
                    started_at_ms: s.meta.started_at_ms,
                    finished_at_ms: s.meta.finished_at_ms,
                    exit_code: s.meta.exit_code,
                    pty_alive: s.pty_alive,
                })
                .collect();
            conn.send(ServerFrame::AgentSessions { sessions });
        }

        ClientFrame::PipelineCreate { request } => {
            match conn.state.engine.create_pipeline(request, &conn.user).await {
                Ok(created) => {
                    conn.send(ServerFrame::PipelineCreated {
                        pipeline_id: created.pipeline_id.clone(),
                        session_ids: created.session_ids,
                        task_ids: created.task_ids,
                    });
                    send_step_status(&conn.state, &created.pipeline_id, &conn.out);
                }
                Err(e) => conn.reject(&e.to_string(), None),
            }
        }

        ClientFrame::PipelineCancel { pipeline_id } => {
            if conn.owned_pipeline(&pipeline_id).is_none() {
                return conn.reject("pipeline not found", None);
            }
            match conn.state.engine.cancel_pipeline(&pipeline_id).await {
                Ok(()) => send_step_status(&conn.state, &pipeline_id, &conn.out),
                Err(e) => conn.reject(&e.to_string(), None),
            }
        }

        ClientFrame::PipelinePause { pipeline_id } => {
            if conn.owned_pipeline(&pipeline_id).is_none() {
                return conn.reject("pipeline not found", None);
            }
            match conn.state.engine.pause_pipeline(&pipeline_id) {
                Ok(()) => conn.send(ServerFrame::PipelinePaused { pipeline_id }),
                Err(e) => conn.reject(&e.to_string(), None),
            }
        }

        ClientFrame::PipelineResume { pipeline_id } => {
            if conn.owned_pipeline(&pipeline_id).is_none() {
                return conn.reject("pipeline not found", None);
            }
            match conn.state.engine.resume_pipeline(&pipeline_id, &conn.user).await {
                Ok(launched) => {
                    conn.send(ServerFrame::PipelineResumed {
                        pipeline_id: pipeline_id.clone(),
                    });
                    if launched.is_some() {
                        send_step_status(&conn.state, &pipeline_id, &conn.out);
                    }
                }
                Err(EngineError::PipelineConflict(id)) => {
                    conn.reject("pipeline is not paused", None);
                    tracing::debug!(pipeline_id = %id, "resume rejected");
                }
                Err(e) => conn.reject(&e.to_string(), None),
            }
        }
    }
}
