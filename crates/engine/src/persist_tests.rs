// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use cam_core::agent::AgentRuntime;
use cam_core::{FakeClock, TaskRow, TaskSource, TaskStatus, UserId};
use cam_pty::PtyCreateOpts;
use cam_storage::MemoryTaskRepository;
use std::collections::HashMap;

fn sh(script: &str) -> PtyCreateOpts {
    PtyCreateOpts {
        cols: 80,
        rows: 24,
        file: Some("/bin/sh".to_string()),
        args: vec!["-c".to_string(), script.to_string()],
        shell: None,
        user_id: UserId::new("u1"),
        env: HashMap::new(),
        cwd: None,
        idle_timeout: Some(Duration::from_secs(60)),
        runtime: AgentRuntime::Native,
    }
}

fn running_task(id: &str) -> TaskRow {
    TaskRow {
        id: TaskId::new(id),
        user_id: UserId::new("u1"),
        title: "t".to_string(),
        description: "d".to_string(),
        agent_id: "claude-code".to_string(),
        repo_url: None,
        work_branch: None,
        work_dir: None,
        status: TaskStatus::Running,
        source: TaskSource::Terminal,
        group_id: None,
        created_at_ms: 0,
        started_at_ms: None,
        finished_at_ms: None,
        retry_count: 0,
    }
}

async fn wait_for_lines(
    repo: &MemoryTaskRepository,
    task_id: &TaskId,
    want: usize,
) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let lines = repo.list_log_lines(task_id).await.unwrap();
        if lines.len() >= want {
            return lines.into_iter().map(|l| l.line).collect();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} lines arrived",
            lines.len()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn lines_are_persisted_in_order() {
    let (pty, _exits) = cam_pty::PtyManager::new(5);
    let repo = MemoryTaskRepository::new();
    repo.insert_task(&running_task("t1")).await.unwrap();

    let created = pty
        .create(sh("printf 'alpha\\nbeta\\ngamma\\n'; sleep 3"))
        .unwrap();
    let _handle = start_persistence(
        &pty,
        &created.session_id,
        TaskId::new("t1"),
        Arc::new(repo.clone()),
        FakeClock::new(),
    )
    .unwrap();

    let lines = wait_for_lines(&repo, &TaskId::new("t1"), 3).await;
    assert_eq!(lines, vec!["alpha", "beta", "gamma"]);

    pty.destroy(&created.session_id, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_flushes_the_trailing_partial() {
    let (pty, _exits) = cam_pty::PtyManager::new(5);
    let repo = MemoryTaskRepository::new();
    repo.insert_task(&running_task("t1")).await.unwrap();

    let created = pty.create(sh("printf 'complete\\nincompl'; sleep 5")).unwrap();
    let mut handle = start_persistence(
        &pty,
        &created.session_id,
        TaskId::new("t1"),
        Arc::new(repo.clone()),
        FakeClock::new(),
    )
    .unwrap();

    // Let the output arrive, then stop and drain.
    wait_for_lines(&repo, &TaskId::new("t1"), 1).await;
    handle.stop();
    assert!(handle.drained(Duration::from_secs(5)).await);

    let lines = wait_for_lines(&repo, &TaskId::new("t1"), 2).await;
    assert_eq!(lines, vec!["complete", "incompl"]);

    pty.destroy(&created.session_id, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_task_discards_the_buffer_silently() {
    let (pty, _exits) = cam_pty::PtyManager::new(5);
    let repo = MemoryTaskRepository::new();
    repo.insert_task(&running_task("t1")).await.unwrap();

    let created = pty.create(sh("printf 'orphaned\\n'; sleep 3")).unwrap();
    let mut handle = start_persistence(
        &pty,
        &created.session_id,
        TaskId::new("t1"),
        Arc::new(repo.clone()),
        FakeClock::new(),
    )
    .unwrap();

    // Task vanishes before the first flush can land meaningfully.
    repo.delete_task(&TaskId::new("t1")).await.unwrap();

    handle.stop();
    assert!(handle.drained(Duration::from_secs(5)).await);
    let lines = repo.list_log_lines(&TaskId::new("t1")).await.unwrap();
    assert!(lines.is_empty());

    pty.destroy(&created.session_id, None);
}
