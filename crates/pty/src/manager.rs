// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY session registry and lifecycle.

use crate::spawn::{default_shell, plan_spawn, resolve_cwd, NESTED_DETECTION_VAR};
use crate::PtyError;
use cam_core::agent::AgentRuntime;
use cam_core::{SessionId, TapId, UserId};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Scrollback keeps the last 64 KiB of emitted bytes.
pub const SCROLLBACK_MAX: usize = 64 * 1024;

/// Idle timeout applied when the caller does not choose one.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Live sessions allowed per user unless configured otherwise.
pub const DEFAULT_MAX_SESSIONS_PER_USER: usize = 5;

/// ETX, what the terminal sends for Ctrl-C.
const INTERRUPT_BYTE: u8 = 0x03;

/// Options for [`PtyManager::create`].
#[derive(Debug, Clone)]
pub struct PtyCreateOpts {
    pub cols: u16,
    pub rows: u16,
    /// Explicit executable; when absent a shell is spawned.
    pub file: Option<String>,
    pub args: Vec<String>,
    pub shell: Option<String>,
    pub user_id: UserId,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub idle_timeout: Option<Duration>,
    pub runtime: AgentRuntime,
}

impl PtyCreateOpts {
    pub fn shell_for(user_id: UserId) -> Self {
        Self {
            cols: 80,
            rows: 24,
            file: None,
            args: vec![],
            shell: None,
            user_id,
            env: HashMap::new(),
            cwd: None,
            idle_timeout: None,
            runtime: AgentRuntime::Native,
        }
    }
}

/// Result of a successful create.
#[derive(Debug, Clone)]
pub struct PtyCreated {
    pub session_id: SessionId,
    /// What was actually spawned (file or shell).
    pub shell: String,
}

/// Events delivered to the interactive attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit(i32),
}

/// Exit notification delivered to the manager-wide channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyExit {
    pub session_id: SessionId,
    pub exit_code: i32,
}

/// Summary of a live session for listings.
#[derive(Debug, Clone)]
pub struct PtySessionSummary {
    pub session_id: SessionId,
    pub shell: String,
    pub attached: bool,
    pub scrollback_len: usize,
}

struct PtyEntry {
    user_id: UserId,
    shell: String,
    last_activity: Instant,
    idle_timeout: Duration,
    scrollback: Vec<u8>,
    attached: Option<mpsc::UnboundedSender<PtyEvent>>,
    taps: HashMap<TapId, mpsc::UnboundedSender<Vec<u8>>>,
    tap_seq: u64,
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

struct Inner {
    sessions: Mutex<HashMap<SessionId, PtyEntry>>,
    exit_tx: mpsc::UnboundedSender<PtyExit>,
    max_per_user: usize,
}

/// Registry of live PTY sessions.
#[derive(Clone)]
pub struct PtyManager {
    inner: Arc<Inner>,
}

impl PtyManager {
    /// Create a manager and the channel on which child exits are reported.
    pub fn new(max_per_user: usize) -> (Self, mpsc::UnboundedReceiver<PtyExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Inner {
                    sessions: Mutex::new(HashMap::new()),
                    exit_tx,
                    max_per_user,
                }),
            },
            exit_rx,
        )
    }

    /// Spawn a child on a fresh PTY. Must run inside a tokio runtime: the
    /// blocking reader and waiter bridges are spawned here.
    pub fn create(&self, opts: PtyCreateOpts) -> Result<PtyCreated, PtyError> {
        {
            let sessions = self.inner.sessions.lock();
            let live = sessions
                .values()
                .filter(|e| e.user_id == opts.user_id)
                .count();
            if live >= self.inner.max_per_user {
                return Err(PtyError::SessionLimit(live));
            }
        }

        let cwd = resolve_cwd(opts.cwd.as_deref());
        let spec = plan_spawn(
            opts.file.as_deref(),
            &opts.args,
            opts.shell.as_deref(),
            &cwd,
            &opts.env,
            opts.runtime,
            cfg!(windows),
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.file);
        cmd.args(&spec.args);
        cmd.cwd(&cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env_remove(NESTED_DETECTION_VAR);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let session_id = SessionId::new(uuid::Uuid::new_v4().to_string());
        let shell = if opts.file.is_some() {
            spec.file.clone()
        } else {
            opts.shell
                .clone()
                .unwrap_or_else(|| default_shell(cfg!(windows)))
        };
        let idle_timeout = opts.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);

        {
            let mut sessions = self.inner.sessions.lock();
            sessions.insert(
                session_id.clone(),
                PtyEntry {
                    user_id: opts.user_id,
                    shell: shell.clone(),
                    last_activity: Instant::now(),
                    idle_timeout,
                    scrollback: Vec::new(),
                    attached: None,
                    taps: HashMap::new(),
                    tap_seq: 0,
                    writer,
                    master: pair.master,
                    killer,
                },
            );
        }

        tracing::info!(session_id = %session_id, shell = %shell, cwd = %cwd.display(), "pty session created");

        // Reader bridge: blocking reads, dispatched straight to sinks.
        let reader_inner = Arc::clone(&self.inner);
        let reader_id = session_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => Inner::on_data(&reader_inner, &reader_id, &buf[..n]),
                }
            }
        });

        // Waiter bridge: reports the child's real exit.
        let waiter_inner = Arc::clone(&self.inner);
        let waiter_id = session_id.clone();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            Inner::purge(&waiter_inner, &waiter_id, true, code);
        });

        // Idle watchdog.
        let idle_inner = Arc::clone(&self.inner);
        let idle_id = session_id.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let sessions = idle_inner.sessions.lock();
                    match sessions.get(&idle_id) {
                        None => return,
                        Some(e) => e.last_activity + e.idle_timeout,
                    }
                };
                if Instant::now() >= deadline {
                    tracing::info!(session_id = %idle_id, "pty session idle timeout");
                    // Synthetic destroy, as if the child had died.
                    Inner::purge(&idle_inner, &idle_id, true, -1);
                    return;
                }
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            }
        });

        Ok(PtyCreated { session_id, shell })
    }

    /// Attach the interactive sink, replacing any previous one silently.
    /// Returns the scrollback snapshot for replay.
    pub fn attach(
        &self,
        session_id: &SessionId,
        sink: mpsc::UnboundedSender<PtyEvent>,
    ) -> Result<Vec<u8>, PtyError> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| PtyError::NotFound(session_id.clone()))?;
        entry.attached = Some(sink);
        Ok(entry.scrollback.clone())
    }

    /// Clear the interactive sink without touching the child.
    pub fn detach(&self, session_id: &SessionId) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.attached = None;
        }
    }

    /// Register an auxiliary observer, independent of attachment.
    pub fn add_data_tap(
        &self,
        session_id: &SessionId,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<TapId, PtyError> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| PtyError::NotFound(session_id.clone()))?;
        entry.tap_seq += 1;
        let tap_id = TapId::new(format!("tap-{}", entry.tap_seq));
        entry.taps.insert(tap_id.clone(), sink);
        Ok(tap_id)
    }

    /// Remove a tap. Idempotent on gone sessions and unknown taps.
    pub fn remove_data_tap(&self, session_id: &SessionId, tap_id: &TapId) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.taps.remove(tap_id);
        }
    }

    /// Write bytes to the child's stdin. No-op on gone sessions.
    pub fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), PtyError> {
        let mut sessions = self.inner.sessions.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return Ok(());
        };
        entry.writer.write_all(data)?;
        entry.writer.flush()?;
        Ok(())
    }

    /// Send the interrupt byte (Ctrl-C) to the child.
    pub fn send_interrupt(&self, session_id: &SessionId) -> Result<(), PtyError> {
        self.write(session_id, &[INTERRUPT_BYTE])
    }

    /// Resize the terminal. No-op on gone sessions.
    pub fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), PtyError> {
        let sessions = self.inner.sessions.lock();
        let Some(entry) = sessions.get(session_id) else {
            return Ok(());
        };
        entry
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))
    }

    /// Kill the child and purge the record. `emit_exit` additionally
    /// delivers a synthetic exit event with the given code. Idempotent.
    pub fn destroy(&self, session_id: &SessionId, emit_exit: Option<i32>) {
        match emit_exit {
            Some(code) => Inner::purge(&self.inner, session_id, true, code),
            None => Inner::purge(&self.inner, session_id, false, 0),
        }
    }

    pub fn list_by_user(&self, user_id: &UserId) -> Vec<SessionId> {
        let sessions = self.inner.sessions.lock();
        sessions
            .iter()
            .filter(|(_, e)| &e.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn summaries_for_user(&self, user_id: &UserId) -> Vec<PtySessionSummary> {
        let sessions = self.inner.sessions.lock();
        sessions
            .iter()
            .filter(|(_, e)| &e.user_id == user_id)
            .map(|(id, e)| PtySessionSummary {
                session_id: id.clone(),
                shell: e.shell.clone(),
                attached: e.attached.is_some(),
                scrollback_len: e.scrollback.len(),
            })
            .collect()
    }

    pub fn is_owned_by(&self, session_id: &SessionId, user_id: &UserId) -> bool {
        let sessions = self.inner.sessions.lock();
        sessions
            .get(session_id)
            .map(|e| &e.user_id == user_id)
            .unwrap_or(false)
    }

    pub fn has(&self, session_id: &SessionId) -> bool {
        self.inner.sessions.lock().contains_key(session_id)
    }

    pub fn size(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}

impl Inner {
    /// Dispatch one chunk of child output: activity bump, scrollback,
    /// attachment, taps. Same order and same bytes for every sink.
    fn on_data(inner: &Arc<Inner>, session_id: &SessionId, data: &[u8]) {
        let mut sessions = inner.sessions.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };

        entry.last_activity = Instant::now();

        entry.scrollback.extend_from_slice(data);
        if entry.scrollback.len() > SCROLLBACK_MAX {
            let excess = entry.scrollback.len() - SCROLLBACK_MAX;
            entry.scrollback.drain(..excess);
        }

        if let Some(attached) = &entry.attached {
            if attached.send(PtyEvent::Data(data.to_vec())).is_err() {
                entry.attached = None;
            }
        }

        let mut dead_taps = Vec::new();
        for (tap_id, tap) in &entry.taps {
            if tap.send(data.to_vec()).is_err() {
                tracing::warn!(session_id = %session_id, tap_id = %tap_id, "data tap gone, removing");
                dead_taps.push(tap_id.clone());
            }
        }
        for tap_id in dead_taps {
            entry.taps.remove(&tap_id);
        }
    }

    /// Remove the record, kill the child, and (optionally) deliver the exit
    /// exactly once. All exit paths (real exit, destroy, idle timeout)
    /// come through here; the map removal is what makes delivery single.
    fn purge(inner: &Arc<Inner>, session_id: &SessionId, emit_exit: bool, exit_code: i32) {
        let entry = {
            let mut sessions = inner.sessions.lock();
            sessions.remove(session_id)
        };
        let Some(mut entry) = entry else {
            return;
        };

        if let Err(e) = entry.killer.kill() {
            tracing::debug!(session_id = %session_id, error = %e, "kill on purge failed (already dead?)");
        }

        if emit_exit {
            if let Some(attached) = &entry.attached {
                let _ = attached.send(PtyEvent::Exit(exit_code));
            }
            let _ = inner.exit_tx.send(PtyExit {
                session_id: session_id.clone(),
                exit_code,
            });
        }

        tracing::info!(session_id = %session_id, exit_code, emit_exit, "pty session purged");
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
