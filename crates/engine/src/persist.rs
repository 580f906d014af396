// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal-log persistence.
//!
//! A persister is bound to a PTY once its agent session has a task id: a
//! data tap feeds a bounded line buffer, and a 1 s tick drains it into the
//! task-log table in batches. Referential failures mean the task is gone
//! and the buffer is discarded; transient failures requeue for the next
//! tick.

use cam_core::logbuf::{FLUSH_BATCH_SIZE, FLUSH_INTERVAL_MS};
use cam_core::{Clock, LineBuffer, SessionId, TapId, TaskId, TaskLogLine};
use cam_pty::{PtyError, PtyManager};
use cam_storage::{StorageError, TaskRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Handle to a running persister.
pub(crate) struct PersisterHandle {
    tap_id: TapId,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl PersisterHandle {
    pub(crate) fn tap_id(&self) -> &TapId {
        &self.tap_id
    }

    /// Signal the persister to drain and stop.
    pub(crate) fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the final forced flush to complete.
    pub(crate) async fn drained(&mut self, timeout: Duration) -> bool {
        let Some(done_rx) = self.done_rx.take() else {
            return true;
        };
        tokio::time::timeout(timeout, done_rx).await.is_ok()
    }
}

/// Register a tap on the session and start the flush loop.
pub(crate) fn start_persistence<R, C>(
    pty: &PtyManager,
    session_id: &SessionId,
    task_id: TaskId,
    repo: Arc<R>,
    clock: C,
) -> Result<PersisterHandle, PtyError>
where
    R: TaskRepository,
    C: Clock,
{
    let (tap_tx, mut tap_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let tap_id = pty.add_data_tap(session_id, tap_tx)?;

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let session = session_id.clone();
    tokio::spawn(async move {
        let mut buffer = LineBuffer::new();
        let mut tick =
            tokio::time::interval(Duration::from_millis(FLUSH_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                chunk = tap_rx.recv() => match chunk {
                    Some(chunk) => buffer.push_chunk(&chunk),
                    // Tap deregistered: drain what is left and finish.
                    None => break,
                },
                _ = tick.tick() => {
                    flush(repo.as_ref(), &task_id, &session, &mut buffer, false, &clock).await;
                },
                _ = &mut stop_rx => break,
            }
        }

        // Pull in whatever the tap already delivered, then force-drain.
        while let Ok(chunk) = tap_rx.try_recv() {
            buffer.push_chunk(&chunk);
        }
        flush(repo.as_ref(), &task_id, &session, &mut buffer, true, &clock).await;
        let _ = done_tx.send(());
    });

    Ok(PersisterHandle {
        tap_id,
        stop_tx: Some(stop_tx),
        done_rx: Some(done_rx),
    })
}

/// One flush pass. With `force`, the trailing partial becomes a line of its
/// own and every batch is written; otherwise at most one batch goes out.
async fn flush<R: TaskRepository, C: Clock>(
    repo: &R,
    task_id: &TaskId,
    session_id: &SessionId,
    buffer: &mut LineBuffer,
    force: bool,
    clock: &C,
) {
    if force {
        buffer.flush_partial();
    }

    if buffer.is_empty() {
        let dropped = buffer.take_dropped();
        if dropped > 0 {
            tracing::warn!(
                session_id = %session_id,
                task_id = %task_id,
                dropped,
                "terminal log overflow, oldest lines were dropped"
            );
        }
        return;
    }

    // The task may have been deleted concurrently; the durable FK would
    // reject every write, so drop the buffer silently.
    match repo.task_exists(task_id).await {
        Ok(true) => {}
        Ok(false) => {
            buffer.clear();
            return;
        }
        Err(e) => {
            tracing::warn!(task_id = %task_id, error = %e, "task existence check failed, keeping buffer");
            return;
        }
    }

    loop {
        let batch = buffer.take_batch(FLUSH_BATCH_SIZE);
        if batch.is_empty() {
            break;
        }
        let now = clock.epoch_ms();
        let rows: Vec<TaskLogLine> = batch
            .iter()
            .map(|line| TaskLogLine {
                task_id: task_id.clone(),
                line: line.clone(),
                created_at_ms: now,
            })
            .collect();

        match repo.insert_log_lines(&rows).await {
            Ok(()) => {
                if !force {
                    break;
                }
            }
            Err(StorageError::ForeignKey) => {
                buffer.clear();
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "log batch insert failed, will retry");
                buffer.unshift_batch(batch);
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
