// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User identity passed along every engine operation.

use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier for a user.
    ///
    /// Sessions, pipelines, and pool rows are all scoped to a user; ownership
    /// checks compare this id before any session- or pipeline-bearing
    /// operation is dispatched.
    pub struct UserId;
}

/// The caller identity the server hands to the engine.
///
/// Authentication happens outside the core; the engine only enforces
/// ownership against `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

impl User {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            username: username.into(),
        }
    }
}
