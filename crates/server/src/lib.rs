// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! cam-server: the daemon's client surface.
//!
//! One axum listener serves both the multiplexed WebSocket (terminal and
//! pipeline frames) and the completion-hook HTTP endpoint.

mod frames;
mod http;
mod ws;

pub use frames::{AgentSessionInfo, ClientFrame, ServerFrame, TerminalSessionInfo};

use cam_adapters::{EnvSecretResolver, NoopRepoIndex};
use cam_core::SystemClock;
use cam_engine::Engine;
use cam_storage::SqliteStore;
use std::sync::Arc;

/// The engine as the daemon wires it: SQLite mirror, env secrets, no repo
/// index, wall clock.
pub type DaemonEngine =
    Engine<SqliteStore, SqliteStore, EnvSecretResolver, NoopRepoIndex, SystemClock>;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DaemonEngine>,
}

/// The daemon's router: WebSocket upgrade plus the step-done callback.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .route(
            "/api/terminal/step-done",
            axum::routing::post(http::step_done),
        )
        .with_state(state)
}
