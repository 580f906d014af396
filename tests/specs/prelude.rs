//! Shared rig for the behavioral specs.

use cam_adapters::{FakeRepoIndex, FakeSecretResolver};
use cam_core::agent::{AgentCatalog, AgentDefinition, AgentRuntime};
use cam_core::{FakeClock, PipelineId, PipelineStatus, StepRequest, User};
use cam_engine::{Engine, EngineConfig, EngineDeps};
use cam_pty::PtyManager;
use cam_storage::{MemorySessionPool, MemoryTaskRepository};
use std::sync::Arc;
use std::time::Duration;

pub type SpecEngine =
    Engine<MemoryTaskRepository, MemorySessionPool, FakeSecretResolver, FakeRepoIndex, FakeClock>;

pub struct Rig {
    pub engine: Arc<SpecEngine>,
    pub repo: MemoryTaskRepository,
    pub user: User,
    pub workdir: tempfile::TempDir,
}

fn sh_agent(id: &str, script: &str) -> AgentDefinition {
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

pub fn rig() -> Rig {
    let (pty, exit_rx) = PtyManager::new(16);
    let repo = MemoryTaskRepository::new();

    let mut catalog = AgentCatalog::builtin();
    for (id, script) in [
        ("sh-ok", "exit 0"),
        ("sh-slow-ok", "sleep 1; exit 0"),
        ("sh-fail-42", "exit 42"),
        ("sh-hang", "sleep 30"),
        ("sh-print", "printf 'spec-output\\n'; sleep 1; exit 0"),
        // Lands in the hook-supporting agent family.
        ("claude-spec", "sleep 30"),
    ] {
        catalog.register(sh_agent(id, script)).unwrap();
    }

    let engine = Engine::new(
        EngineDeps {
            tasks: Arc::new(repo.clone()),
            pool: Arc::new(MemorySessionPool::new()),
            secrets: FakeSecretResolver::new(),
            repo_index: FakeRepoIndex::new(),
        },
        pty,
        catalog,
        FakeClock::new(),
        EngineConfig {
            callback_port: 9999,
            max_sessions_per_user: 16,
        },
    );
    engine.run_exit_loop(exit_rx);

    Rig {
        engine,
        repo,
        user: User::new("spec-user", "spec"),
        workdir: tempfile::tempdir().unwrap(),
    }
}

pub fn step(title: &str, prompt: &str, agent: &str) -> StepRequest {
    StepRequest {
        title: title.to_string(),
        prompt: prompt.to_string(),
        agent_id: Some(agent.to_string()),
        parallel: vec![],
        input_condition: None,
        input_files: vec![],
    }
}

pub async fn wait_for_pipeline_status(rig: &Rig, id: &PipelineId, status: PipelineStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if rig.engine.get_pipeline(id).map(|p| p.status) == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline never reached {:?} (currently {:?})",
            status,
            rig.engine.get_pipeline(id).map(|p| p.status)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
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
