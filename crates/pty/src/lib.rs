// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! cam-pty: PTY session manager.
//!
//! Owns child processes attached to pseudo-terminals. Each session keeps a
//! tail-truncated scrollback, at most one interactive attachment, and any
//! number of auxiliary data taps. Child exit, explicit destroy, and idle
//! timeout all funnel into a single purge path.

mod manager;
mod spawn;

pub use manager::{
    PtyCreateOpts, PtyCreated, PtyEvent, PtyExit, PtyManager, PtySessionSummary,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS_PER_USER, SCROLLBACK_MAX,
};

use cam_core::SessionId;
use thiserror::Error;

/// Errors from PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session limit reached ({0} live sessions)")]
    SessionLimit(usize),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
