// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task repository port.
//!
//! Every status transition is conditional on an expected current status; a
//! transition whose precondition no longer holds affects zero rows, which
//! callers treat as a no-op. This is what makes `(cancel, exit)` races
//! naturally idempotent without cross-process locks.

use async_trait::async_trait;
use cam_core::{TaskId, TaskLogLine, TaskRow, TaskStatus};
use thiserror::Error;

/// Errors from the durable stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    /// Referential violation: the referenced task row is gone.
    #[error("foreign key violation")]
    ForeignKey,
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("row is leased: {0}")]
    Leased(String),
}

/// Port onto the durable task table.
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    /// Insert a single task row.
    async fn insert_task(&self, row: &TaskRow) -> Result<(), StorageError>;

    /// Insert all rows in one transaction: either every step of a pipeline
    /// is mirrored, or none is.
    async fn insert_tasks(&self, rows: &[TaskRow]) -> Result<(), StorageError>;

    /// Conditionally move a row to `running`, stamping `started_at_ms`.
    /// Returns the number of rows affected (0 or 1).
    async fn promote_to_running(
        &self,
        id: &TaskId,
        from: &[TaskStatus],
        started_at_ms: u64,
    ) -> Result<u64, StorageError>;

    /// Conditionally move a row to `to` when its current status is in
    /// `expected`. Returns rows affected (0 or 1); 0 means a racing
    /// transition won and this one is a no-op.
    async fn update_status_conditional(
        &self,
        id: &TaskId,
        to: TaskStatus,
        expected: &[TaskStatus],
        finished_at_ms: Option<u64>,
    ) -> Result<u64, StorageError>;

    /// Append a batch of log lines. May fail with
    /// [`StorageError::ForeignKey`] when the task was deleted concurrently.
    async fn insert_log_lines(&self, lines: &[TaskLogLine]) -> Result<(), StorageError>;

    async fn task_exists(&self, id: &TaskId) -> Result<bool, StorageError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRow>, StorageError>;

    /// Delete a task row (log rows cascade).
    async fn delete_task(&self, id: &TaskId) -> Result<(), StorageError>;

    /// Log lines for a task in insertion order.
    async fn list_log_lines(&self, id: &TaskId) -> Result<Vec<TaskLogLine>, StorageError>;
}
