// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::error::EngineError;
use crate::test_helpers::{test_rig, wait_until, TestRig};
use cam_core::pipeline::{PreparedRequest, SessionPolicy};
use cam_core::{NodeRequest, PipelineRequest, StepRequest};
use cam_storage::SessionPoolUpsert;
use std::time::Duration;

fn step(title: &str, prompt: &str, agent: &str) -> StepRequest {
    StepRequest {
        title: title.to_string(),
        prompt: prompt.to_string(),
        agent_id: Some(agent.to_string()),
        parallel: vec![],
        input_condition: None,
        input_files: vec![],
    }
}

fn request(rig: &TestRig, steps: Vec<StepRequest>) -> PipelineRequest {
    PipelineRequest {
        title: None,
        repo_url: None,
        work_dir: Some(rig.workdir.path().display().to_string()),
        agent_id: Some("sh-ok".to_string()),
        steps,
        session_policy: SessionPolicy::AllowCreate,
        allow_create_step_indexes: vec![],
        prepared_sessions: vec![],
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_requires_two_steps() {
    let rig = test_rig(5);
    let err = rig
        .engine
        .create_pipeline(request(&rig, vec![step("only", "P", "sh-ok")]), &rig.user)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPipeline(_)));
    assert!(rig.repo.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_unknown_agents_before_any_rows() {
    let rig = test_rig(5);
    let err = rig
        .engine
        .create_pipeline(
            request(
                &rig,
                vec![step("plan", "P", "sh-ok"), step("impl", "I", "no-such-agent")],
            ),
            &rig.user,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AgentNotFound(_)));
    assert!(rig.repo.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn reuse_only_with_insufficient_pool_fails_before_any_rows() {
    let rig = test_rig(5);
    let mut req = request(
        &rig,
        vec![
            StepRequest {
                title: "impl".to_string(),
                prompt: "I".to_string(),
                agent_id: Some("claude-code".to_string()),
                parallel: vec![NodeRequest::default(), NodeRequest::default()],
                input_condition: None,
                input_files: vec![],
            },
            step("review", "R", "claude-code"),
        ],
    );
    req.session_policy = SessionPolicy::ReuseOnly;
    req.prepared_sessions = vec![PreparedRequest {
        session_key: "only-one".to_string(),
        agent_id: "claude-code".to_string(),
        mode: SessionMode::Continue,
        resume_conversation_id: None,
        source: PreparedSource::External,
    }];

    let err = rig.engine.create_pipeline(req, &rig.user).await.unwrap_err();
    match err {
        EngineError::InsufficientPool {
            step_index,
            needed,
            available,
            ..
        } => {
            assert_eq!(step_index, 0);
            assert_eq!(needed, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected InsufficientPool, got {:?}", other),
    }
    assert!(rig.repo.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn managed_prepared_sessions_must_match_a_pool_row() {
    let rig = test_rig(5);
    let mut req = request(
        &rig,
        vec![step("plan", "P", "sh-ok"), step("impl", "I", "sh-ok")],
    );
    req.prepared_sessions = vec![PreparedRequest {
        session_key: "unknown-key".to_string(),
        agent_id: "claude-code".to_string(),
        mode: SessionMode::Continue,
        resume_conversation_id: None,
        source: PreparedSource::Managed,
    }];

    let err = rig.engine.create_pipeline(req, &rig.user).await.unwrap_err();
    assert!(matches!(err, EngineError::PreparedRejected(_)));
    assert!(rig.repo.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn managed_prepared_sessions_verify_against_the_pool() {
    let rig = test_rig(5);
    let repo_str = rig.workdir.path().display().to_string();
    let row = rig
        .pool
        .upsert(
            &rig.user.id,
            SessionPoolUpsert {
                session_key: Some("warm".to_string()),
                repo_path: repo_str,
                agent_id: "claude-code".to_string(),
                mode: SessionMode::Continue,
                resume_conversation_id: None,
                source: PreparedSource::Managed,
                title: None,
            },
            0,
        )
        .await
        .unwrap();

    // Same key but a different agent: rejected.
    let mut req = request(
        &rig,
        vec![step("plan", "P", "sh-ok"), step("impl", "I", "sh-ok")],
    );
    req.prepared_sessions = vec![PreparedRequest {
        session_key: row.session_key.clone(),
        agent_id: "codex".to_string(),
        mode: SessionMode::Continue,
        resume_conversation_id: None,
        source: PreparedSource::Managed,
    }];
    let err = rig.engine.create_pipeline(req, &rig.user).await.unwrap_err();
    assert!(matches!(err, EngineError::PreparedRejected(_)));

    // Matching request passes validation (the pipeline itself runs on
    // script agents and never leases it).
    let mut req = request(
        &rig,
        vec![step("plan", "P", "sh-ok"), step("impl", "I", "sh-ok")],
    );
    req.prepared_sessions = vec![PreparedRequest {
        session_key: row.session_key,
        agent_id: "claude-code".to_string(),
        mode: SessionMode::Continue,
        resume_conversation_id: None,
        source: PreparedSource::Managed,
    }];
    let created = rig.engine.create_pipeline(req, &rig.user).await.unwrap();
    let engine = std::sync::Arc::clone(&rig.engine);
    let pid = created.pipeline_id.clone();
    wait_until("pipeline to finish", || {
        engine
            .pipelines
            .lock()
            .get(&pid)
            .map(|p| p.status == PipelineStatus::Completed)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_two_step_pipeline_runs_to_completion() {
    let rig = test_rig(5);
    let created = rig
        .engine
        .create_pipeline(
            request(&rig, vec![step("plan", "P", "sh-ok"), step("impl", "I", "sh-ok")]),
            &rig.user,
        )
        .await
        .unwrap();
    assert_eq!(created.session_ids.len(), 1);
    assert_eq!(created.task_ids.len(), 1);

    let engine = std::sync::Arc::clone(&rig.engine);
    let pid = created.pipeline_id.clone();
    wait_until("pipeline completion", || {
        engine
            .pipelines
            .lock()
            .get(&pid)
            .map(|p| p.status == PipelineStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    // Every task row ends completed.
    let pipeline = rig.engine.get_pipeline(&created.pipeline_id).unwrap();
    assert_eq!(pipeline.current_step_index, 1);
    for step in &pipeline.steps {
        assert_eq!(step.status, StepStatus::Completed);
        for node in &step.nodes {
            assert_eq!(node.status, NodeStatus::Completed);
            assert_eq!(rig.repo.status_of(&node.task_id), Some(TaskStatus::Completed));
        }
    }

    // The step workspace was laid out for both steps.
    assert!(rig.workdir.path().join(".conversations/step1/workspace.json").exists());
    assert!(rig.workdir.path().join(".conversations/step1/agent-1-task.md").exists());
    assert!(rig.workdir.path().join(".conversations/step2/workspace.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_node_failure_cancels_siblings_and_downstream() {
    let rig = test_rig(5);
    let req = request(
        &rig,
        vec![
            StepRequest {
                title: "fanout".to_string(),
                prompt: "split the work".to_string(),
                agent_id: None,
                parallel: vec![
                    NodeRequest {
                        title: Some("stuck".to_string()),
                        prompt: None,
                        agent_id: Some("sh-hang".to_string()),
                    },
                    NodeRequest {
                        title: Some("doomed".to_string()),
                        prompt: None,
                        agent_id: Some("sh-fail".to_string()),
                    },
                ],
                input_condition: None,
                input_files: vec![],
            },
            step("after", "never runs", "sh-ok"),
        ],
    );

    let created = rig.engine.create_pipeline(req, &rig.user).await.unwrap();
    let engine = std::sync::Arc::clone(&rig.engine);
    let pid = created.pipeline_id.clone();
    wait_until("pipeline failure", || {
        engine
            .pipelines
            .lock()
            .get(&pid)
            .map(|p| p.status == PipelineStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    let pipeline = rig.engine.get_pipeline(&created.pipeline_id).unwrap();
    let fanout = &pipeline.steps[0];
    assert_eq!(fanout.status, StepStatus::Failed);

    let stuck = &fanout.nodes[0];
    let doomed = &fanout.nodes[1];
    assert_eq!(doomed.status, NodeStatus::Failed);
    assert_eq!(stuck.status, NodeStatus::Cancelled);
    assert_eq!(rig.repo.status_of(&doomed.task_id), Some(TaskStatus::Failed));

    // The sibling's task row flips running -> cancelled.
    let repo = rig.repo.clone();
    let stuck_task = stuck.task_id.clone();
    wait_until("sibling cancellation", || {
        repo.status_of(&stuck_task) == Some(TaskStatus::Cancelled)
    })
    .await;

    // Downstream drafts are cancelled with the narrow expected set.
    let after = &pipeline.steps[1].nodes[0];
    assert_eq!(after.status, NodeStatus::Cancelled);
    assert_eq!(rig.repo.status_of(&after.task_id), Some(TaskStatus::Cancelled));

    // The sibling's PTY gets the interrupt + forced destroy treatment.
    let stuck_sid = stuck.session_id.clone().unwrap();
    let engine = std::sync::Arc::clone(&rig.engine);
    wait_until("sibling pty reaped", || !engine.pty().has(&stuck_sid)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_holds_advancement_and_resume_releases_it() {
    let rig = test_rig(5);
    let created = rig
        .engine
        .create_pipeline(
            request(
                &rig,
                vec![step("plan", "P", "sh-slow-ok"), step("impl", "I", "sh-ok")],
            ),
            &rig.user,
        )
        .await
        .unwrap();

    rig.engine.pause_pipeline(&created.pipeline_id).unwrap();

    // Step 1 finishes while paused; the pipeline must hold.
    let engine = std::sync::Arc::clone(&rig.engine);
    let pid = created.pipeline_id.clone();
    wait_until("step 1 completion", || {
        engine
            .pipelines
            .lock()
            .get(&pid)
            .map(|p| p.steps[0].status == StepStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let held = rig.engine.get_pipeline(&created.pipeline_id).unwrap();
    assert_eq!(held.status, PipelineStatus::Paused);
    assert_eq!(held.current_step_index, 0);
    assert_eq!(held.steps[1].nodes[0].status, NodeStatus::Draft);
    assert_eq!(
        rig.repo.status_of(&held.steps[1].nodes[0].task_id),
        Some(TaskStatus::Draft)
    );

    // Resume advances immediately into step 2 and the pipeline completes.
    let launched = rig
        .engine
        .resume_pipeline(&created.pipeline_id, &rig.user)
        .await
        .unwrap();
    assert_eq!(launched.map(|l| l.len()), Some(1));

    let engine = std::sync::Arc::clone(&rig.engine);
    let pid = created.pipeline_id.clone();
    wait_until("pipeline completion", || {
        engine
            .pipelines
            .lock()
            .get(&pid)
            .map(|p| p.status == PipelineStatus::Completed)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_pipeline_stops_running_and_draft_nodes() {
    let rig = test_rig(5);
    let created = rig
        .engine
        .create_pipeline(
            request(&rig, vec![step("stuck", "P", "sh-hang"), step("later", "I", "sh-ok")]),
            &rig.user,
        )
        .await
        .unwrap();

    rig.engine.cancel_pipeline(&created.pipeline_id).await.unwrap();

    let pipeline = rig.engine.get_pipeline(&created.pipeline_id).unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Cancelled);
    assert_eq!(pipeline.steps[0].nodes[0].status, NodeStatus::Cancelled);
    assert_eq!(pipeline.steps[1].nodes[0].status, NodeStatus::Cancelled);

    assert_eq!(
        rig.repo.status_of(&pipeline.steps[0].nodes[0].task_id),
        Some(TaskStatus::Cancelled)
    );
    assert_eq!(
        rig.repo.status_of(&pipeline.steps[1].nodes[0].task_id),
        Some(TaskStatus::Cancelled)
    );

    // Cancel is idempotent.
    rig.engine.cancel_pipeline(&created.pipeline_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_pipeline_node_escalates_to_the_pipeline() {
    let rig = test_rig(5);
    let created = rig
        .engine
        .create_pipeline(
            request(&rig, vec![step("stuck", "P", "sh-hang"), step("later", "I", "sh-ok")]),
            &rig.user,
        )
        .await
        .unwrap();

    let session_id = created.session_ids[0].clone();
    rig.engine.cancel_agent_session(&session_id).await.unwrap();

    let pipeline = rig.engine.get_pipeline(&created.pipeline_id).unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn hook_callback_completes_the_node_without_child_exit() {
    let rig = test_rig(5);
    let created = rig
        .engine
        .create_pipeline(
            request(
                &rig,
                vec![step("hooked", "P", "claude-sh"), step("after", "I", "sh-ok")],
            ),
            &rig.user,
        )
        .await
        .unwrap();
    let pipeline_id = created.pipeline_id.clone();
    let task_id = created.task_ids[0].clone();
    let session_id = created.session_ids[0].clone();

    // The hook was written into the repo settings file.
    let settings = rig.workdir.path().join(".claude/settings.json");
    assert!(settings.exists());
    let token = {
        let tokens = rig.engine.callback_tokens.lock();
        let (token, claim) = tokens.iter().next().expect("token registered");
        assert_eq!(claim.pipeline_id, pipeline_id);
        assert_eq!(claim.task_id, task_id);
        token.clone()
    };

    // Wrong ids leave the token intact.
    let err = rig
        .engine
        .notify_step_completed(&token, &pipeline_id, &TaskId::new("other-task"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidToken));

    // The real callback completes the node while the child still runs.
    rig.engine
        .notify_step_completed(&token, &pipeline_id, &task_id)
        .await
        .unwrap();
    assert_eq!(rig.repo.status_of(&task_id), Some(TaskStatus::Completed));
    assert_eq!(
        rig.engine.get_meta(&session_id).unwrap().status,
        AgentSessionStatus::Completed
    );

    // Tokens are single-use.
    let err = rig
        .engine
        .notify_step_completed(&token, &pipeline_id, &task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidToken));

    // The interactive child is reaped within the grace window, the hook
    // entry is reverted, and the pipeline advances to completion.
    let engine = std::sync::Arc::clone(&rig.engine);
    let sid = session_id.clone();
    wait_until("hooked pty reaped", || !engine.pty().has(&sid)).await;

    let engine = std::sync::Arc::clone(&rig.engine);
    let pid = pipeline_id.clone();
    wait_until("pipeline completion", || {
        engine
            .pipelines
            .lock()
            .get(&pid)
            .map(|p| p.status == PipelineStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(!settings.exists(), "hook cleanup should remove the file it created");
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_check_counts_the_whole_first_step() {
    let rig = test_rig(2);
    let req = request(
        &rig,
        vec![
            StepRequest {
                title: "fanout".to_string(),
                prompt: "P".to_string(),
                agent_id: Some("sh-hang".to_string()),
                parallel: vec![
                    NodeRequest::default(),
                    NodeRequest::default(),
                    NodeRequest::default(),
                ],
                input_condition: None,
                input_files: vec![],
            },
            step("after", "I", "sh-ok"),
        ],
    );
    let err = rig.engine.create_pipeline(req, &rig.user).await.unwrap_err();
    assert!(matches!(err, EngineError::Pty(_)));
    assert!(rig.repo.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_listing_reports_live_leases() {
    let rig = test_rig(5);
    let repo_str = rig.workdir.path().display().to_string();
    rig.pool
        .upsert(
            &rig.user.id,
            SessionPoolUpsert {
                session_key: Some("warm".to_string()),
                repo_path: repo_str,
                agent_id: "claude-code".to_string(),
                mode: SessionMode::Continue,
                resume_conversation_id: None,
                source: PreparedSource::Managed,
                title: None,
            },
            0,
        )
        .await
        .unwrap();

    let mut req = request(
        &rig,
        vec![step("stuck", "P", "sh-hang"), step("later", "I", "sh-ok")],
    );
    req.prepared_sessions = vec![PreparedRequest {
        session_key: "warm".to_string(),
        agent_id: "claude-code".to_string(),
        mode: SessionMode::Continue,
        resume_conversation_id: None,
        source: PreparedSource::Managed,
    }];
    let created = rig.engine.create_pipeline(req, &rig.user).await.unwrap();

    // Member of a live pipeline: annotated leased, delete refused.
    let listed = rig
        .engine
        .pool_list(&rig.user, &Default::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].1, "row should report as leased");
    assert!(rig.engine.pool_delete(&rig.user, "warm").await.is_err());

    // A second pipeline cannot claim the same managed key.
    let mut other = request(
        &rig,
        vec![step("a", "P", "sh-ok"), step("b", "I", "sh-ok")],
    );
    other.prepared_sessions = vec![PreparedRequest {
        session_key: "warm".to_string(),
        agent_id: "claude-code".to_string(),
        mode: SessionMode::Continue,
        resume_conversation_id: None,
        source: PreparedSource::Managed,
    }];
    let err = rig.engine.create_pipeline(other, &rig.user).await.unwrap_err();
    assert!(matches!(err, EngineError::PreparedRejected(_)));

    // After cancellation the row is free again.
    rig.engine.cancel_pipeline(&created.pipeline_id).await.unwrap();
    let listed = rig
        .engine
        .pool_list(&rig.user, &Default::default())
        .await
        .unwrap();
    assert!(!listed[0].1);
    rig.engine.pool_delete(&rig.user, "warm").await.unwrap();
}
