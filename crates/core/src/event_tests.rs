// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn step_completed(user: &str) -> EngineEvent {
    EngineEvent::PipelineStepCompleted {
        pipeline_id: PipelineId::new("pipe-1"),
        task_id: TaskId::new("task-1"),
        user_id: UserId::new(user),
        session_id: SessionId::new("sess-1"),
    }
}

#[tokio::test]
async fn publish_reaches_all_subscribers() {
    let topic = EventTopic::new();
    let mut rx1 = topic.subscribe();
    let mut rx2 = topic.subscribe();

    topic.publish(step_completed("user-1"));

    let e1 = rx1.recv().await.unwrap();
    let e2 = rx2.recv().await.unwrap();
    assert_eq!(e1.user_id(), &UserId::new("user-1"));
    assert_eq!(e2.user_id(), &UserId::new("user-1"));
}

#[tokio::test]
async fn publish_without_subscribers_is_fine() {
    let topic = EventTopic::new();
    topic.publish(step_completed("user-1"));
    assert_eq!(topic.subscriber_count(), 0);
}

#[tokio::test]
async fn slow_subscriber_lags_instead_of_blocking() {
    let topic = EventTopic::new();
    let mut rx = topic.subscribe();

    for _ in 0..(EVENT_BUFFER + 10) {
        topic.publish(step_completed("user-1"));
    }

    // The first receive reports the overflow; the subscriber is expected
    // to resubscribe or drop out.
    match rx.recv().await {
        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
        other => panic!("expected lag, got {:?}", other),
    }
}

#[test]
fn events_serialize_with_kebab_case_tag() {
    let json = serde_json::to_value(step_completed("user-1")).unwrap();
    assert_eq!(json["type"], "pipeline-step-completed");
}
