// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Best-effort git helpers.
//!
//! Work-branch creation and post-exit summaries are conveniences, never
//! gates: a repo without git (or a git failure) degrades to warnings.

use crate::subprocess::{run_with_timeout, GIT_TIMEOUT};
use std::path::Path;
use tokio::process::Command;

/// Branch and last-commit subject, collected after an agent exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSummary {
    pub branch: Option<String>,
    pub last_commit: Option<String>,
}

/// Fresh work-branch name for a create-mode session.
pub fn generate_work_branch() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("cam/vibe-{}", &id[..8])
}

/// `git checkout -b <branch>` in the repo. Returns whether it worked.
pub async fn create_work_branch(repo: &Path, branch: &str) -> bool {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo).args(["checkout", "-b", branch]);
    match run_with_timeout(cmd, GIT_TIMEOUT, "git checkout -b").await {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            tracing::warn!(
                repo = %repo.display(),
                branch,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "work branch creation failed"
            );
            false
        }
        Err(e) => {
            tracing::warn!(repo = %repo.display(), branch, error = %e, "work branch creation failed");
            false
        }
    }
}

/// Current branch and latest commit subject, best effort.
pub async fn collect_repo_summary(repo: &Path) -> RepoSummary {
    let branch = git_stdout(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await;
    let last_commit = git_stdout(repo, &["log", "-1", "--format=%s"]).await;
    RepoSummary {
        branch,
        last_commit,
    }
}

async fn git_stdout(repo: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo).args(args);
    match run_with_timeout(cmd, GIT_TIMEOUT, "git").await {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "git_tests.rs"]
mod tests;
