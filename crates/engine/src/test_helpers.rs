// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test rig: an engine wired to in-memory stores and script-backed
//! agents.

use crate::manager::{Engine, EngineConfig, EngineDeps};
use cam_adapters::{FakeRepoIndex, FakeSecretResolver};
use cam_core::agent::{AgentCatalog, AgentDefinition, AgentRuntime};
use cam_core::{FakeClock, User};
use cam_pty::PtyManager;
use cam_storage::{MemorySessionPool, MemoryTaskRepository};
use std::sync::Arc;
use std::time::Duration;

pub(crate) type TestEngine =
    Engine<MemoryTaskRepository, MemorySessionPool, FakeSecretResolver, FakeRepoIndex, FakeClock>;

pub(crate) fn sh_agent(id: &str, script: &str) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        name: id.to_string(),
        executable: "/bin/sh".to_string(),
        default_args: vec!["-c".to_string(), script.to_string()],
        env_vars: vec![],
        runtime: AgentRuntime::Native,
        built_in: false,
    }
}

pub(crate) struct TestRig {
    pub engine: Arc<TestEngine>,
    pub repo: MemoryTaskRepository,
    pub pool: Arc<MemorySessionPool>,
    pub clock: FakeClock,
    pub user: User,
    pub workdir: tempfile::TempDir,
}

pub(crate) fn test_rig(max_sessions: usize) -> TestRig {
    let (pty, exit_rx) = PtyManager::new(max_sessions);
    let repo = MemoryTaskRepository::new();
    let pool = Arc::new(MemorySessionPool::new());
    let clock = FakeClock::new();

    let mut catalog = AgentCatalog::builtin();
    // Script-backed stand-ins: the prompt arrives as $0 and is ignored.
    for (id, script) in [
        ("sh-ok", "exit 0"),
        ("sh-slow-ok", "sleep 1; exit 0"),
        ("sh-fail", "exit 42"),
        ("sh-hang", "sleep 30"),
        ("sh-chatty", "printf 'alpha\\nbeta\\n'; exit 0"),
        // Id chosen to land in the hook-supporting family.
        ("claude-sh", "sleep 30"),
    ] {
        catalog
            .register(sh_agent(id, script))
            .unwrap_or_else(|e| panic!("register {}: {}", id, e));
    }

    let engine = Engine::new(
        EngineDeps {
            tasks: Arc::new(repo.clone()),
            pool: Arc::clone(&pool),
            secrets: FakeSecretResolver::new(),
            repo_index: FakeRepoIndex::new(),
        },
        pty,
        catalog,
        clock.clone(),
        EngineConfig {
            callback_port: 9999,
            max_sessions_per_user: max_sessions,
        },
    );
    engine.run_exit_loop(exit_rx);

    TestRig {
        engine,
        repo,
        pool,
        clock,
        user: User::new("user-1", "dev"),
        workdir: tempfile::tempdir().expect("tempdir"),
    }
}

pub(crate) async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
