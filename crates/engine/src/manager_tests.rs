// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_helpers::{test_rig, wait_until, TestRig};

fn create_opts(rig: &TestRig, agent: &str, prompt: &str) -> CreateAgentSession {
    let mut opts = CreateAgentSession::new(agent, prompt);
    opts.work_dir = Some(rig.workdir.path().display().to_string());
    opts
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_session_completes_on_zero_exit() {
    let rig = test_rig(5);
    let meta = rig
        .engine
        .create_agent_session(create_opts(&rig, "sh-ok", "do it"), &rig.user)
        .await
        .unwrap();
    let task_id = meta.task_id.clone().unwrap();
    assert_eq!(rig.repo.status_of(&task_id), Some(TaskStatus::Running));

    let engine = Arc::clone(&rig.engine);
    let sid = meta.session_id.clone();
    wait_until("session to complete", || {
        engine
            .get_meta(&sid)
            .map(|m| m.status == AgentSessionStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    let done = rig.engine.get_meta(&meta.session_id).unwrap();
    assert_eq!(done.exit_code, Some(0));
    assert!(done.finished_at_ms.is_some());
    assert_eq!(rig.repo.status_of(&task_id), Some(TaskStatus::Completed));
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_session_fails_on_nonzero_exit() {
    let rig = test_rig(5);
    let meta = rig
        .engine
        .create_agent_session(create_opts(&rig, "sh-fail", "doomed"), &rig.user)
        .await
        .unwrap();
    let task_id = meta.task_id.clone().unwrap();

    let engine = Arc::clone(&rig.engine);
    let sid = meta.session_id.clone();
    wait_until("session to fail", || {
        engine
            .get_meta(&sid)
            .map(|m| m.status == AgentSessionStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(rig.engine.get_meta(&meta.session_id).unwrap().exit_code, Some(42));
    assert_eq!(rig.repo.status_of(&task_id), Some(TaskStatus::Failed));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_output_lands_in_the_task_log() {
    let rig = test_rig(5);
    let meta = rig
        .engine
        .create_agent_session(create_opts(&rig, "sh-chatty", "talk"), &rig.user)
        .await
        .unwrap();
    let task_id = meta.task_id.clone().unwrap();

    let repo = rig.repo.clone();
    let tid = task_id.clone();
    wait_until("log lines to persist", || {
        let text = repo.lines_of(&tid).join("\n");
        text.contains("alpha") && text.contains("beta")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_marks_session_and_task_cancelled() {
    let rig = test_rig(5);
    let meta = rig
        .engine
        .create_agent_session(create_opts(&rig, "sh-hang", "wait"), &rig.user)
        .await
        .unwrap();
    let task_id = meta.task_id.clone().unwrap();

    rig.engine.cancel_agent_session(&meta.session_id).await.unwrap();

    let done = rig.engine.get_meta(&meta.session_id).unwrap();
    assert_eq!(done.status, AgentSessionStatus::Cancelled);
    assert_eq!(rig.repo.status_of(&task_id), Some(TaskStatus::Cancelled));

    // The forced destroy reaps the child within the grace window.
    let engine = Arc::clone(&rig.engine);
    let sid = meta.session_id.clone();
    wait_until("pty to be reaped", || !engine.pty().has(&sid)).await;

    // A racing exit cannot overwrite the cancel.
    assert_eq!(
        rig.engine.get_meta(&meta.session_id).unwrap().status,
        AgentSessionStatus::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn promote_conflict_unwinds_the_pty() {
    let rig = test_rig(5);
    let mut opts = create_opts(&rig, "sh-hang", "never");
    // Points at a task row that does not exist.
    opts.pipeline_task_id = Some(TaskId::new("ghost-task"));

    let err = rig
        .engine
        .create_agent_session(opts, &rig.user)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TaskConflict(_)));
    assert_eq!(rig.engine.pty().size(), 0);
    assert!(rig.engine.list_by_user(&rig.user.id).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn required_secret_must_resolve() {
    let rig = test_rig(5);
    // Built-in codex declares OPENAI_API_KEY as required; the fake
    // resolver is empty.
    let err = rig
        .engine
        .create_agent_session(create_opts(&rig, "codex", "hi"), &rig.user)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingEnv { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_agent_is_rejected() {
    let rig = test_rig(5);
    let err = rig
        .engine
        .create_agent_session(create_opts(&rig, "no-such-agent", "hi"), &rig.user)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AgentNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn task_index_self_heals() {
    let rig = test_rig(5);
    let meta = rig
        .engine
        .create_agent_session(create_opts(&rig, "sh-hang", "wait"), &rig.user)
        .await
        .unwrap();
    let task_id = meta.task_id.clone().unwrap();

    // Sabotage the index; the scan rebuilds it.
    rig.engine.task_index.lock().clear();
    let found = rig.engine.get_meta_by_task_id(&task_id).unwrap();
    assert_eq!(found.session_id, meta.session_id);
    assert!(rig.engine.task_index.lock().contains_key(&task_id));

    rig.engine.cancel_agent_session(&meta.session_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_sessions_are_pruned_after_ttl() {
    let rig = test_rig(5);
    let meta = rig
        .engine
        .create_agent_session(create_opts(&rig, "sh-ok", "quick"), &rig.user)
        .await
        .unwrap();

    let engine = Arc::clone(&rig.engine);
    let sid = meta.session_id.clone();
    wait_until("session to finish", || {
        engine
            .get_meta(&sid)
            .map(|m| !m.is_running())
            .unwrap_or(false)
    })
    .await;
    wait_until("pty to be gone", || !engine.pty().has(&sid)).await;
    wait_until("logs to drain", || !engine.has_pending_flush(&sid)).await;

    // Within the TTL the record stays.
    rig.clock.advance_ms(FINISHED_SESSION_TTL_MS / 2);
    rig.engine.maybe_gc();
    assert!(rig.engine.get_meta(&meta.session_id).is_some());

    // Past the TTL it goes, index entry included.
    rig.clock.advance_ms(FINISHED_SESSION_TTL_MS);
    rig.engine.maybe_gc();
    assert!(rig.engine.get_meta(&meta.session_id).is_none());
    assert!(rig
        .engine
        .get_meta_by_task_id(&meta.task_id.clone().unwrap())
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_and_drain_unlinks_the_task() {
    let rig = test_rig(5);
    let meta = rig
        .engine
        .create_agent_session(create_opts(&rig, "sh-hang", "wait"), &rig.user)
        .await
        .unwrap();
    let task_id = meta.task_id.clone().unwrap();

    rig.engine
        .stop_and_drain_task_session(&task_id, Duration::from_secs(10))
        .await;

    assert!(!rig.engine.pty().has(&meta.session_id));
    assert!(!rig.engine.task_index.lock().contains_key(&task_id));
    assert!(!rig.engine.has_pending_flush(&meta.session_id));
}
