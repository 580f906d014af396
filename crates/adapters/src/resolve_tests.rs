// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::repo_index::{FakeRepoIndex, NoopRepoIndex};
use yare::parameterized;

#[parameterized(
    https = { "https://github.com/acme/widget.git", "widget" },
    https_no_git = { "https://github.com/acme/widget", "widget" },
    ssh = { "git@github.com:acme/widget.git", "widget" },
    trailing_slash = { "https://github.com/acme/widget/", "widget" },
)]
fn repo_names_from_urls(url: &str, expected: &str) {
    assert_eq!(repo_name_from_url(url).as_deref(), Some(expected));
}

#[test]
fn repo_name_rejects_empty() {
    assert_eq!(repo_name_from_url(""), None);
    assert_eq!(repo_name_from_url(".git"), None);
}

#[tokio::test]
async fn explicit_work_dir_wins_and_is_normalized() {
    let index = NoopRepoIndex;
    let path = resolve_repo_path(Some("C:\\repos\\widget"), Some("https://x/y.git"), &index).await;
    if cfg!(windows) {
        assert_eq!(path, PathBuf::from("C:\\repos\\widget"));
    } else {
        assert_eq!(path, PathBuf::from("/mnt/c/repos/widget"));
    }
}

#[tokio::test]
async fn index_lookup_comes_before_repos_dir() {
    let index = FakeRepoIndex::new();
    index.set("https://github.com/acme/widget.git", "/srv/checkouts/widget");
    let path = resolve_repo_path(None, Some("https://github.com/acme/widget.git"), &index).await;
    assert_eq!(path, PathBuf::from("/srv/checkouts/widget"));
}

#[tokio::test]
async fn falls_back_to_home_without_any_repo_hint() {
    let index = NoopRepoIndex;
    let path = resolve_repo_path(None, None, &index).await;
    // Points at HOME (or a sensible fallback), never empty.
    assert!(!path.as_os_str().is_empty());
}
