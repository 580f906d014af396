// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CAM Daemon (camd)
//!
//! Single-node orchestration daemon: owns the PTY sessions, the engine,
//! and one HTTP listener serving the WebSocket and the completion-hook
//! callback.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use cam_adapters::{EnvSecretResolver, NoopRepoIndex};
use cam_core::agent::{AgentCatalog, AgentDefinition};
use cam_core::SystemClock;
use cam_engine::{Engine, EngineConfig, EngineDeps};
use cam_pty::{PtyManager, DEFAULT_MAX_SESSIONS_PER_USER};
use cam_server::{router, AppState};
use cam_storage::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// Default listen port; also the port composed into hook callback URLs.
const DEFAULT_PORT: u16 = 9690;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle info flags before any setup
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("camd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("camd {}", env!("CARGO_PKG_VERSION"));
                println!("CAM daemon - orchestrates local CLI coding agents over PTY sessions");
                println!();
                println!("USAGE:");
                println!("    camd");
                println!();
                println!("Listens on 127.0.0.1:$PORT (default {DEFAULT_PORT}) serving the");
                println!("WebSocket at /ws and the completion hook at /api/terminal/step-done.");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: camd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let state_dir = state_dir();
    std::fs::create_dir_all(&state_dir)?;
    let log_path = state_dir.join("daemon.log");

    rotate_log_if_needed(&log_path);
    let _log_guard = setup_logging(&log_path)?;

    info!("starting camd {}", env!("CARGO_PKG_VERSION"));

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let store = SqliteStore::open(&state_dir.join("cam.db"))?;
    let (pty, exit_rx) = PtyManager::new(DEFAULT_MAX_SESSIONS_PER_USER);

    let mut catalog = AgentCatalog::builtin();
    load_extra_agents(&state_dir, &mut catalog);

    let engine = Engine::new(
        EngineDeps {
            tasks: Arc::new(store.clone()),
            pool: Arc::new(store),
            secrets: EnvSecretResolver,
            repo_index: NoopRepoIndex,
        },
        pty,
        catalog,
        SystemClock,
        EngineConfig {
            callback_port: port,
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
        },
    );
    engine.run_exit_loop(exit_rx);

    let app = router(AppState { engine });
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("daemon ready, listening on 127.0.0.1:{}", port);

    // Signal ready for parent process (e.g. systemd, a CLI waiting on us)
    println!("READY");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("sigterm handler failed: {}", e);
            return std::future::pending().await;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("sigint handler failed: {}", e);
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}

/// `$CAM_STATE_DIR`, or `~/.local/state/cam`.
fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CAM_STATE_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local/state/cam")
}

/// Extra agent definitions materialized from `agents.json` in the state
/// dir. Best-effort: a broken file is logged and skipped.
fn load_extra_agents(state_dir: &Path, catalog: &mut AgentCatalog) {
    let path = state_dir.join("agents.json");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return,
    };
    let defs: Vec<AgentDefinition> = match serde_json::from_str(&content) {
        Ok(defs) => defs,
        Err(e) => {
            error!(path = %path.display(), "agents.json is invalid: {}", e);
            return;
        }
    };
    for def in defs {
        let id = def.id.clone();
        match catalog.register(def) {
            Ok(()) => info!(agent_id = %id, "registered extra agent"),
            Err(e) => error!(agent_id = %id, "agent registration refused: {}", e),
        }
    }
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep (daemon.log.1, .2, .3).
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotate the daemon log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `daemon.log` → `daemon.log.1` → `daemon.log.2` → `daemon.log.3`,
/// deleting the oldest. Best-effort: rotation failures are silently ignored
/// so the daemon still starts.
fn rotate_log_if_needed(log_path: &Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };

    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();

    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

fn setup_logging(
    log_path: &Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, std::io::Error> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let dir = log_path
        .parent()
        .ok_or_else(|| std::io::Error::other("log path has no parent"))?;
    let name = log_path
        .file_name()
        .ok_or_else(|| std::io::Error::other("log path has no file name"))?;

    let file_appender = tracing_appender::rolling::never(dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
