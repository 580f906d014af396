// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable registry of reusable agent conversations.
//!
//! Rows are unique per `(user_id, session_key)`. The engine computes the
//! live `leased` view from its active pipelines; this store only refuses to
//! delete rows the engine reports as leased.

use crate::task_repo::StorageError;
use async_trait::async_trait;
use cam_core::pipeline::PreparedSource;
use cam_core::{SessionMode, UserId};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashSet;

/// A persisted pool row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolRow {
    pub user_id: UserId,
    pub session_key: String,
    pub repo_path: String,
    pub agent_id: String,
    pub mode: SessionMode,
    pub resume_conversation_id: Option<String>,
    pub source: PreparedSource,
    pub title: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Upsert input; a missing `session_key` is derived deterministically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolUpsert {
    #[serde(default)]
    pub session_key: Option<String>,
    pub repo_path: String,
    pub agent_id: String,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub resume_conversation_id: Option<String>,
    #[serde(default)]
    pub source: PreparedSource,
    #[serde(default)]
    pub title: Option<String>,
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct SessionPoolFilter {
    pub repo_path: Option<String>,
    pub agent_id: Option<String>,
}

/// Derive the deterministic session key:
/// `<agentId>:<resumeConversationId|"continue">:<10-hex-prefix of SHA-1(repoPath)>`.
pub fn derive_session_key(
    agent_id: &str,
    resume_conversation_id: Option<&str>,
    repo_path: &str,
) -> String {
    let digest = Sha1::digest(repo_path.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}:{}:{}",
        agent_id,
        resume_conversation_id.filter(|id| !id.is_empty()).unwrap_or("continue"),
        &hex[..10]
    )
}

/// Port onto the durable session pool.
#[async_trait]
pub trait SessionPoolStore: Send + Sync + 'static {
    /// Insert or update a row; updates bump `updated_at_ms`.
    async fn upsert(
        &self,
        user_id: &UserId,
        req: SessionPoolUpsert,
        now_ms: u64,
    ) -> Result<SessionPoolRow, StorageError>;

    async fn list(
        &self,
        user_id: &UserId,
        filter: &SessionPoolFilter,
    ) -> Result<Vec<SessionPoolRow>, StorageError>;

    async fn get(
        &self,
        user_id: &UserId,
        session_key: &str,
    ) -> Result<Option<SessionPoolRow>, StorageError>;

    /// Delete one row; refused with [`StorageError::Leased`] when the key
    /// is in `leased_keys`.
    async fn delete(
        &self,
        user_id: &UserId,
        session_key: &str,
        leased_keys: &HashSet<String>,
    ) -> Result<(), StorageError>;

    /// Delete every non-leased row of the user; returns how many went.
    async fn clear(
        &self,
        user_id: &UserId,
        leased_keys: &HashSet<String>,
    ) -> Result<u64, StorageError>;
}

#[cfg(test)]
#[path = "session_pool_tests.rs"]
mod tests;
