// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine event topic.
//!
//! Events are ephemeral notifications; the task table is the durable
//! record. Delivery is a broadcast channel: subscribers that fall behind
//! observe a lag error and drop out; the engine never blocks on them.

use crate::pipeline::PipelineId;
use crate::session::{AgentSessionStatus, SessionId};
use crate::task::TaskId;
use crate::user::UserId;
use serde::Serialize;
use tokio::sync::broadcast;

/// Per-subscriber buffer before lagging subscribers start losing events.
pub const EVENT_BUFFER: usize = 256;

/// Notifications published by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    AgentSessionCreated {
        user_id: UserId,
        session_id: SessionId,
        task_id: TaskId,
        agent_id: String,
    },
    AgentStatusChanged {
        user_id: UserId,
        session_id: SessionId,
        task_id: Option<TaskId>,
        status: AgentSessionStatus,
        exit_code: Option<i32>,
        branch: Option<String>,
        last_commit: Option<String>,
    },
    PipelineStepCompleted {
        pipeline_id: PipelineId,
        task_id: TaskId,
        user_id: UserId,
        session_id: SessionId,
    },
    PipelineCompleted {
        pipeline_id: PipelineId,
        user_id: UserId,
    },
}

impl EngineEvent {
    /// The user the event concerns, for per-socket filtering.
    pub fn user_id(&self) -> &UserId {
        match self {
            EngineEvent::AgentSessionCreated { user_id, .. }
            | EngineEvent::AgentStatusChanged { user_id, .. }
            | EngineEvent::PipelineStepCompleted { user_id, .. }
            | EngineEvent::PipelineCompleted { user_id, .. } => user_id,
        }
    }
}

/// Multi-subscriber topic for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventTopic {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventTopic {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish to all current subscribers. A publish with no subscribers
    /// is dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventTopic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
