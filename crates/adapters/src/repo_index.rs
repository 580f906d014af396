// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Repo index port: maps repo URLs to known local checkouts.

use async_trait::async_trait;
use std::path::PathBuf;

/// Lookup of the default working directory for a repository URL.
#[async_trait]
pub trait RepoIndex: Clone + Send + Sync + 'static {
    async fn find_default_work_dir_by_url(&self, url: &str) -> Option<PathBuf>;
}

/// Index that knows nothing; path resolution falls through to the
/// `$CAM_REPOS_DIR` convention.
#[derive(Clone, Default)]
pub struct NoopRepoIndex;

#[async_trait]
impl RepoIndex for NoopRepoIndex {
    async fn find_default_work_dir_by_url(&self, _url: &str) -> Option<PathBuf> {
        None
    }
}

/// Map-backed index for tests.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone, Default)]
pub struct FakeRepoIndex {
    map: std::sync::Arc<parking_lot::Mutex<std::collections::HashMap<String, PathBuf>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeRepoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, url: &str, path: impl Into<PathBuf>) {
        self.map.lock().insert(url.to_string(), path.into());
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl RepoIndex for FakeRepoIndex {
    async fn find_default_work_dir_by_url(&self, url: &str) -> Option<PathBuf> {
        self.map.lock().get(url).cloned()
    }
}
