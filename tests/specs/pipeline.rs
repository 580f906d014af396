//! Pipeline scenarios: advancement, failure cascades, pause/resume, hooks.

use crate::prelude::*;
use cam_core::pipeline::{NodeStatus, PreparedRequest, PreparedSource, SessionPolicy, StepStatus};
use cam_core::{
    NodeRequest, PipelineRequest, PipelineStatus, SessionMode, TaskStatus,
};

fn request(rig: &Rig, steps: Vec<cam_core::StepRequest>) -> PipelineRequest {
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

/// Happy pipeline, two steps, one node each: step 1's child exits 0, step 2
/// launches, and both task rows end completed.
#[tokio::test(flavor = "multi_thread")]
async fn two_step_pipeline_completes_both_steps() {
    let rig = rig();
    let created = rig
        .engine
        .create_pipeline(
            request(&rig, vec![step("plan", "P", "sh-ok"), step("impl", "I", "sh-ok")]),
            &rig.user,
        )
        .await
        .unwrap();

    wait_for_pipeline_status(&rig, &created.pipeline_id, PipelineStatus::Completed).await;

    let pipeline = rig.engine.get_pipeline(&created.pipeline_id).unwrap();
    // Step index advanced strictly once, never restarted.
    assert_eq!(pipeline.current_step_index, 1);
    for step in &pipeline.steps {
        assert_eq!(step.status, StepStatus::Completed);
        for node in &step.nodes {
            assert_eq!(rig.repo.status_of(&node.task_id), Some(TaskStatus::Completed));
        }
    }
}

/// Parallel step, one node fails with exit 42: the pipeline fails, the
/// sibling is interrupted and its row goes running → cancelled, and the
/// downstream draft is cancelled.
#[tokio::test(flavor = "multi_thread")]
async fn parallel_failure_cancels_sibling_and_downstream() {
    let rig = rig();
    let created = rig
        .engine
        .create_pipeline(
            request(
                &rig,
                vec![
                    cam_core::StepRequest {
                        title: "fanout".to_string(),
                        prompt: "split".to_string(),
                        agent_id: None,
                        parallel: vec![
                            NodeRequest {
                                title: Some("n1".to_string()),
                                prompt: None,
                                agent_id: Some("sh-hang".to_string()),
                            },
                            NodeRequest {
                                title: Some("n2".to_string()),
                                prompt: None,
                                agent_id: Some("sh-fail-42".to_string()),
                            },
                        ],
                        input_condition: None,
                        input_files: vec![],
                    },
                    step("after", "never", "sh-ok"),
                ],
            ),
            &rig.user,
        )
        .await
        .unwrap();

    wait_for_pipeline_status(&rig, &created.pipeline_id, PipelineStatus::Failed).await;

    let pipeline = rig.engine.get_pipeline(&created.pipeline_id).unwrap();
    let n1 = &pipeline.steps[0].nodes[0];
    let n2 = &pipeline.steps[0].nodes[1];
    let downstream = &pipeline.steps[1].nodes[0];

    assert_eq!(n2.status, NodeStatus::Failed);
    assert_eq!(rig.repo.status_of(&n2.task_id), Some(TaskStatus::Failed));

    assert_eq!(n1.status, NodeStatus::Cancelled);
    let repo = rig.repo.clone();
    let n1_task = n1.task_id.clone();
    wait_until("sibling row cancelled", || {
        repo.status_of(&n1_task) == Some(TaskStatus::Cancelled)
    })
    .await;

    assert_eq!(downstream.status, NodeStatus::Cancelled);
    assert_eq!(
        rig.repo.status_of(&downstream.task_id),
        Some(TaskStatus::Cancelled)
    );
}

/// Reuse-only with an insufficient pool: the create fails before any task
/// row is inserted.
#[tokio::test(flavor = "multi_thread")]
async fn reuse_only_with_small_pool_fails_without_side_effects() {
    let rig = rig();
    let mut req = request(
        &rig,
        vec![
            cam_core::StepRequest {
                title: "governed".to_string(),
                prompt: "G".to_string(),
                agent_id: Some("claude-code".to_string()),
                parallel: vec![NodeRequest::default(), NodeRequest::default()],
                input_condition: None,
                input_files: vec![],
            },
            step("after", "A", "claude-code"),
        ],
    );
    req.session_policy = SessionPolicy::ReuseOnly;
    req.prepared_sessions = vec![PreparedRequest {
        session_key: "the-only-one".to_string(),
        agent_id: "claude-code".to_string(),
        mode: SessionMode::Continue,
        resume_conversation_id: None,
        source: PreparedSource::External,
    }];

    assert!(rig.engine.create_pipeline(req, &rig.user).await.is_err());
    assert!(rig.repo.snapshot().is_empty());
}

/// Hook path: the injected settings file carries a callback whose token
/// completes the node while the child is still alive; the engine then
/// schedules the forced destroy.
#[tokio::test(flavor = "multi_thread")]
async fn hook_callback_completes_a_live_node() {
    let rig = rig();
    let created = rig
        .engine
        .create_pipeline(
            request(
                &rig,
                vec![step("hooked", "H", "claude-spec"), step("after", "A", "sh-ok")],
            ),
            &rig.user,
        )
        .await
        .unwrap();
    let pipeline_id = created.pipeline_id.clone();
    let task_id = created.task_ids[0].clone();
    let session_id = created.session_ids[0].clone();

    // Read the callback the injector wrote into the repo, exactly as the
    // agent would see it.
    let settings: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(rig.workdir.path().join(".claude/settings.json")).unwrap(),
    )
    .unwrap();
    let command = settings["hooks"]["Stop"][0]["hooks"][0]["command"]
        .as_str()
        .unwrap();
    assert!(command.contains("/api/terminal/step-done"));
    let payload_start = command.find("-d '").unwrap() + 4;
    let payload_end = command[payload_start..].find('\'').unwrap() + payload_start;
    let payload: serde_json::Value =
        serde_json::from_str(&command[payload_start..payload_end]).unwrap();
    assert_eq!(payload["pipelineId"], pipeline_id.as_str());
    assert_eq!(payload["taskId"], task_id.as_str());
    let token = payload["token"].as_str().unwrap().to_string();

    // The child is alive; the callback completes the node anyway.
    assert!(rig.engine.pty().has(&session_id));
    rig.engine
        .notify_step_completed(&token, &pipeline_id, &task_id)
        .await
        .unwrap();
    assert_eq!(rig.repo.status_of(&task_id), Some(TaskStatus::Completed));

    // Second use of the token is rejected.
    assert!(rig
        .engine
        .notify_step_completed(&token, &pipeline_id, &task_id)
        .await
        .is_err());

    // Forced destroy reaps the interactive child within the grace window,
    // and the pipeline advances to completion.
    let engine = std::sync::Arc::clone(&rig.engine);
    let sid = session_id.clone();
    wait_until("hooked child reaped", || !engine.pty().has(&sid)).await;
    wait_for_pipeline_status(&rig, &pipeline_id, PipelineStatus::Completed).await;
}

/// Pause then resume across a step boundary: the step finishes while
/// paused, the pipeline holds, and resume advances immediately.
#[tokio::test(flavor = "multi_thread")]
async fn pause_holds_and_resume_advances() {
    let rig = rig();
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
    let pipeline_id = created.pipeline_id.clone();

    rig.engine.pause_pipeline(&pipeline_id).unwrap();

    let engine = std::sync::Arc::clone(&rig.engine);
    let pid = pipeline_id.clone();
    wait_until("step 1 completion while paused", || {
        engine
            .get_pipeline(&pid)
            .map(|p| p.steps[0].status == StepStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let held = rig.engine.get_pipeline(&pipeline_id).unwrap();
    assert_eq!(held.status, PipelineStatus::Paused);
    assert_eq!(held.current_step_index, 0);

    let launched = rig
        .engine
        .resume_pipeline(&pipeline_id, &rig.user)
        .await
        .unwrap();
    assert!(launched.is_some(), "resume should launch step 2 immediately");

    wait_for_pipeline_status(&rig, &pipeline_id, PipelineStatus::Completed).await;
}
