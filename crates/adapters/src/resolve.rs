// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Repo path resolution.
//!
//! Order: explicit work dir (normalized) → repo-index lookup →
//! `$CAM_REPOS_DIR/<repo-name>` → `$HOME` / `$USERPROFILE` / process cwd.

use crate::repo_index::RepoIndex;
use cam_core::paths::normalize_host_path;
use std::path::PathBuf;

/// Resolve the directory an agent session runs in.
pub async fn resolve_repo_path<I: RepoIndex>(
    work_dir: Option<&str>,
    repo_url: Option<&str>,
    index: &I,
) -> PathBuf {
    if let Some(dir) = work_dir.filter(|d| !d.is_empty()) {
        return PathBuf::from(normalize_host_path(dir));
    }

    if let Some(url) = repo_url.filter(|u| !u.is_empty()) {
        if let Some(path) = index.find_default_work_dir_by_url(url).await {
            return path;
        }
        if let (Ok(base), Some(name)) = (std::env::var("CAM_REPOS_DIR"), repo_name_from_url(url)) {
            return PathBuf::from(base).join(name);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home);
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        return PathBuf::from(profile);
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Last path segment of a repo URL, without the `.git` suffix.
pub fn repo_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.trim_end_matches(".git");
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
