// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite-backed implementation of the storage ports.
//!
//! One connection behind a mutex; every call is a short statement or a
//! small transaction. The schema is created on open.

use crate::session_pool::{
    derive_session_key, SessionPoolFilter, SessionPoolRow, SessionPoolStore, SessionPoolUpsert,
};
use crate::task_repo::{StorageError, TaskRepository};
use async_trait::async_trait;
use cam_core::pipeline::{PipelineId, PreparedSource};
use cam_core::{SessionMode, TaskId, TaskLogLine, TaskRow, TaskSource, TaskStatus, UserId};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    repo_url TEXT,
    work_branch TEXT,
    work_dir TEXT,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    group_id TEXT,
    created_at_ms INTEGER NOT NULL,
    started_at_ms INTEGER,
    finished_at_ms INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_task_group ON task(group_id);
CREATE INDEX IF NOT EXISTS idx_task_user ON task(user_id);

CREATE TABLE IF NOT EXISTS task_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES task(id) ON DELETE CASCADE,
    line TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_log_task ON task_log(task_id);

CREATE TABLE IF NOT EXISTS terminal_session_pool (
    user_id TEXT NOT NULL,
    session_key TEXT NOT NULL,
    repo_path TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    resume_conversation_id TEXT,
    source TEXT NOT NULL,
    title TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY (user_id, session_key)
);
";

/// SQLite store implementing both [`TaskRepository`] and
/// [`SessionPoolStore`].
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn constraint_err(e: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StorageError::ForeignKey;
        }
    }
    db_err(e)
}

fn status_in_clause(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_task_stmt(conn: &Connection, row: &TaskRow) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO task (id, user_id, title, description, agent_id, repo_url, work_branch,
                           work_dir, status, source, group_id, created_at_ms, started_at_ms,
                           finished_at_ms, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            row.id.as_str(),
            row.user_id.as_str(),
            row.title,
            row.description,
            row.agent_id,
            row.repo_url,
            row.work_branch,
            row.work_dir,
            row.status.as_str(),
            row.source.as_str(),
            row.group_id.as_ref().map(|g| g.as_str().to_string()),
            row.created_at_ms,
            row.started_at_ms,
            row.finished_at_ms,
            row.retry_count,
        ],
    )?;
    Ok(())
}

fn task_from_row(row: &rusqlite::Row<'_>) -> Result<TaskRow, rusqlite::Error> {
    let status_str: String = row.get("status")?;
    let source_str: String = row.get("source")?;
    let group_id: Option<String> = row.get("group_id")?;
    Ok(TaskRow {
        id: TaskId::new(row.get::<_, String>("id")?),
        user_id: UserId::new(row.get::<_, String>("user_id")?),
        title: row.get("title")?,
        description: row.get("description")?,
        agent_id: row.get("agent_id")?,
        repo_url: row.get("repo_url")?,
        work_branch: row.get("work_branch")?,
        work_dir: row.get("work_dir")?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Draft),
        source: TaskSource::parse(&source_str).unwrap_or(TaskSource::Terminal),
        group_id: group_id.map(PipelineId::new),
        created_at_ms: row.get("created_at_ms")?,
        started_at_ms: row.get("started_at_ms")?,
        finished_at_ms: row.get("finished_at_ms")?,
        retry_count: row.get("retry_count")?,
    })
}

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn insert_task(&self, row: &TaskRow) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        insert_task_stmt(&conn, row).map_err(constraint_err)
    }

    async fn insert_tasks(&self, rows: &[TaskRow]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        for row in rows {
            insert_task_stmt(&tx, row).map_err(constraint_err)?;
        }
        tx.commit().map_err(db_err)
    }

    async fn promote_to_running(
        &self,
        id: &TaskId,
        from: &[TaskStatus],
        started_at_ms: u64,
    ) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE task SET status = 'running', started_at_ms = ?1
             WHERE id = ?2 AND status IN ({})",
            status_in_clause(from)
        );
        let affected = conn
            .execute(&sql, params![started_at_ms, id.as_str()])
            .map_err(db_err)?;
        Ok(affected as u64)
    }

    async fn update_status_conditional(
        &self,
        id: &TaskId,
        to: TaskStatus,
        expected: &[TaskStatus],
        finished_at_ms: Option<u64>,
    ) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE task SET status = ?1, finished_at_ms = COALESCE(?2, finished_at_ms)
             WHERE id = ?3 AND status IN ({})",
            status_in_clause(expected)
        );
        let affected = conn
            .execute(&sql, params![to.as_str(), finished_at_ms, id.as_str()])
            .map_err(db_err)?;
        Ok(affected as u64)
    }

    async fn insert_log_lines(&self, lines: &[TaskLogLine]) -> Result<(), StorageError> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO task_log (task_id, line, created_at_ms) VALUES (?1, ?2, ?3)")
                .map_err(db_err)?;
            for line in lines {
                stmt.execute(params![line.task_id.as_str(), line.line, line.created_at_ms])
                    .map_err(constraint_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    async fn task_exists(&self, id: &TaskId) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM task WHERE id = ?1",
                params![id.as_str()],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRow>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM task WHERE id = ?1")
            .map_err(db_err)?;
        let mut rows = stmt
            .query_map(params![id.as_str()], task_from_row)
            .map_err(db_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(db_err)?)),
            None => Ok(None),
        }
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM task WHERE id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_log_lines(&self, id: &TaskId) -> Result<Vec<TaskLogLine>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT task_id, line, created_at_ms FROM task_log
                 WHERE task_id = ?1 ORDER BY id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok(TaskLogLine {
                    task_id: TaskId::new(row.get::<_, String>(0)?),
                    line: row.get(1)?,
                    created_at_ms: row.get(2)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}

fn mode_to_str(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::Create => "create",
        SessionMode::Resume => "resume",
        SessionMode::Continue => "continue",
    }
}

fn mode_from_str(s: &str) -> SessionMode {
    match s {
        "resume" => SessionMode::Resume,
        "continue" => SessionMode::Continue,
        _ => SessionMode::Create,
    }
}

fn source_to_str(source: PreparedSource) -> &'static str {
    match source {
        PreparedSource::Managed => "managed",
        PreparedSource::External => "external",
    }
}

fn source_from_str(s: &str) -> PreparedSource {
    match s {
        "external" => PreparedSource::External,
        _ => PreparedSource::Managed,
    }
}

fn pool_from_row(row: &rusqlite::Row<'_>) -> Result<SessionPoolRow, rusqlite::Error> {
    let mode: String = row.get("mode")?;
    let source: String = row.get("source")?;
    Ok(SessionPoolRow {
        user_id: UserId::new(row.get::<_, String>("user_id")?),
        session_key: row.get("session_key")?,
        repo_path: row.get("repo_path")?,
        agent_id: row.get("agent_id")?,
        mode: mode_from_str(&mode),
        resume_conversation_id: row.get("resume_conversation_id")?,
        source: source_from_str(&source),
        title: row.get("title")?,
        created_at_ms: row.get("created_at_ms")?,
        updated_at_ms: row.get("updated_at_ms")?,
    })
}

#[async_trait]
impl SessionPoolStore for SqliteStore {
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

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO terminal_session_pool
                 (user_id, session_key, repo_path, agent_id, mode,
                  resume_conversation_id, source, title, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(user_id, session_key) DO UPDATE SET
                 repo_path = excluded.repo_path,
                 agent_id = excluded.agent_id,
                 mode = excluded.mode,
                 resume_conversation_id = excluded.resume_conversation_id,
                 source = excluded.source,
                 title = COALESCE(excluded.title, terminal_session_pool.title),
                 updated_at_ms = excluded.updated_at_ms",
            params![
                user_id.as_str(),
                session_key,
                req.repo_path,
                req.agent_id,
                mode_to_str(req.mode),
                req.resume_conversation_id,
                source_to_str(req.source),
                req.title,
                now_ms,
            ],
        )
        .map_err(db_err)?;

        let mut stmt = conn
            .prepare("SELECT * FROM terminal_session_pool WHERE user_id = ?1 AND session_key = ?2")
            .map_err(db_err)?;
        stmt.query_row(params![user_id.as_str(), session_key], pool_from_row)
            .map_err(db_err)
    }

    async fn list(
        &self,
        user_id: &UserId,
        filter: &SessionPoolFilter,
    ) -> Result<Vec<SessionPoolRow>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM terminal_session_pool
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR repo_path = ?2)
                   AND (?3 IS NULL OR agent_id = ?3)
                 ORDER BY updated_at_ms DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![user_id.as_str(), filter.repo_path, filter.agent_id],
                pool_from_row,
            )
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    async fn get(
        &self,
        user_id: &UserId,
        session_key: &str,
    ) -> Result<Option<SessionPoolRow>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM terminal_session_pool WHERE user_id = ?1 AND session_key = ?2")
            .map_err(db_err)?;
        let mut rows = stmt
            .query_map(params![user_id.as_str(), session_key], pool_from_row)
            .map_err(db_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(db_err)?)),
            None => Ok(None),
        }
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
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM terminal_session_pool WHERE user_id = ?1 AND session_key = ?2",
                params![user_id.as_str(), session_key],
            )
            .map_err(db_err)?;
        if affected == 0 {
            return Err(StorageError::NotFound(session_key.to_string()));
        }
        Ok(())
    }

    async fn clear(
        &self,
        user_id: &UserId,
        leased_keys: &HashSet<String>,
    ) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let keep = leased_keys
            .iter()
            .map(|k| format!("'{}'", k.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if keep.is_empty() {
            "DELETE FROM terminal_session_pool WHERE user_id = ?1".to_string()
        } else {
            format!(
                "DELETE FROM terminal_session_pool WHERE user_id = ?1 AND session_key NOT IN ({})",
                keep
            )
        };
        let affected = conn.execute(&sql, params![user_id.as_str()]).map_err(db_err)?;
        Ok(affected as u64)
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
