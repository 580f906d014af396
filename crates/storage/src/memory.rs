// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory fakes mirroring the SQLite semantics, for tests.

use crate::session_pool::{
    derive_session_key, SessionPoolFilter, SessionPoolRow, SessionPoolStore, SessionPoolUpsert,
};
use crate::task_repo::{StorageError, TaskRepository};
use async_trait::async_trait;
use cam_core::{TaskId, TaskLogLine, TaskRow, TaskStatus, UserId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// In-memory [`TaskRepository`] with the same conditional-update and
/// referential-integrity behavior as the SQLite store.
#[derive(Clone, Default)]
pub struct MemoryTaskRepository {
    inner: Arc<Mutex<MemoryTasks>>,
}

#[derive(Default)]
struct MemoryTasks {
    tasks: HashMap<TaskId, TaskRow>,
    logs: Vec<TaskLogLine>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, for assertions.
    pub fn snapshot(&self) -> Vec<TaskRow> {
        self.inner.lock().tasks.values().cloned().collect()
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.inner.lock().tasks.get(id).map(|t| t.status)
    }

    /// Persisted line texts for a task, without going through the port.
    pub fn lines_of(&self, id: &TaskId) -> Vec<String> {
        self.inner
            .lock()
            .logs
            .iter()
            .filter(|l| &l.task_id == id)
            .map(|l| l.line.clone())
            .collect()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn insert_task(&self, row: &TaskRow) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&row.id) {
            return Err(StorageError::Database(format!(
                "duplicate task id: {}",
                row.id
            )));
        }
        inner.tasks.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn insert_tasks(&self, rows: &[TaskRow]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        for row in rows {
            if inner.tasks.contains_key(&row.id) {
                // Whole batch rejected, nothing inserted.
                return Err(StorageError::Database(format!(
                    "duplicate task id: {}",
                    row.id
                )));
            }
        }
        for row in rows {
            inner.tasks.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn promote_to_running(
        &self,
        id: &TaskId,
        from: &[TaskStatus],
        started_at_ms: u64,
    ) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(id) {
            Some(task) if from.contains(&task.status) => {
                task.status = TaskStatus::Running;
                task.started_at_ms = Some(started_at_ms);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_status_conditional(
        &self,
        id: &TaskId,
        to: TaskStatus,
        expected: &[TaskStatus],
        finished_at_ms: Option<u64>,
    ) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(id) {
            Some(task) if expected.contains(&task.status) => {
                task.status = to;
                if finished_at_ms.is_some() {
                    task.finished_at_ms = finished_at_ms;
                }
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_log_lines(&self, lines: &[TaskLogLine]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        for line in lines {
            if !inner.tasks.contains_key(&line.task_id) {
                return Err(StorageError::ForeignKey);
            }
            inner.logs.push(line.clone());
        }
        Ok(())
    }

    async fn task_exists(&self, id: &TaskId) -> Result<bool, StorageError> {
        Ok(self.inner.lock().tasks.contains_key(id))
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRow>, StorageError> {
        Ok(self.inner.lock().tasks.get(id).cloned())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.tasks.remove(id);
        inner.logs.retain(|l| &l.task_id != id);
        Ok(())
    }

    async fn list_log_lines(&self, id: &TaskId) -> Result<Vec<TaskLogLine>, StorageError> {
        Ok(self
            .inner
            .lock()
            .logs
            .iter()
            .filter(|l| &l.task_id == id)
            .cloned()
            .collect())
    }
}

/// In-memory [`SessionPoolStore`].
#[derive(Clone, Default)]
pub struct MemorySessionPool {
    rows: Arc<Mutex<HashMap<(UserId, String), SessionPoolRow>>>,
}

impl MemorySessionPool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionPoolStore for MemorySessionPool {
    async fn upsert(
        &self,
        user_id: &UserId,
        req: SessionPoolUpsert,
        now_ms: u64,
    ) -> Result<SessionPoolRow, StorageError> {
        let session_key = req.session_key.clone().unwrap_or_else(|| {
            derive_session_key(
                &req.agent_id,
                req.resume_conversation_id.as_deref(),
                &req.repo_path,
            )
        });
        let mut rows = self.rows.lock();
        let key = (user_id.clone(), session_key.clone());
        let row = match rows.get(&key) {
            Some(existing) => SessionPoolRow {
                repo_path: req.repo_path,
                agent_id: req.agent_id,
                mode: req.mode,
                resume_conversation_id: req.resume_conversation_id,
                source: req.source,
                title: req.title.or_else(|| existing.title.clone()),
                updated_at_ms: now_ms,
                ..existing.clone()
            },
            None => SessionPoolRow {
                user_id: user_id.clone(),
                session_key: session_key.clone(),
                repo_path: req.repo_path,
                agent_id: req.agent_id,
                mode: req.mode,
                resume_conversation_id: req.resume_conversation_id,
                source: req.source,
                title: req.title,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        };
        rows.insert(key, row.clone());
        Ok(row)
    }

    async fn list(
        &self,
        user_id: &UserId,
        filter: &SessionPoolFilter,
    ) -> Result<Vec<SessionPoolRow>, StorageError> {
        let rows = self.rows.lock();
        let mut out: Vec<SessionPoolRow> = rows
            .values()
            .filter(|r| &r.user_id == user_id)
            .filter(|r| {
                filter
                    .repo_path
                    .as_ref()
                    .map(|p| &r.repo_path == p)
                    .unwrap_or(true)
            })
            .filter(|r| {
                filter
                    .agent_id
                    .as_ref()
                    .map(|a| &r.agent_id == a)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        Ok(out)
    }

    async fn get(
        &self,
        user_id: &UserId,
        session_key: &str,
    ) -> Result<Option<SessionPoolRow>, StorageError> {
        Ok(self
            .rows
            .lock()
            .get(&(user_id.clone(), session_key.to_string()))
            .cloned())
    }

    async fn delete(
        &self,
        user_id: &UserId,
        session_key: &str,
        leased_keys: &HashSet<String>,
    ) -> Result<(), StorageError> {
        if leased_keys.contains(session_key) {
            return Err(StorageError::Leased(session_key.to_string()));
        }
        let mut rows = self.rows.lock();
        match rows.remove(&(user_id.clone(), session_key.to_string())) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(session_key.to_string())),
        }
    }

    async fn clear(
        &self,
        user_id: &UserId,
        leased_keys: &HashSet<String>,
    ) -> Result<u64, StorageError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|(uid, key), _| uid != user_id || leased_keys.contains(key));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
