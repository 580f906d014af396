// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Secret resolution port.

use async_trait::async_trait;

/// What the secret is for; backends may scope secrets per agent or repo.
#[derive(Debug, Clone)]
pub struct SecretContext<'a> {
    pub agent_id: &'a str,
    pub repo_url: Option<&'a str>,
}

/// Resolves the value of a named environment variable for an agent launch.
#[async_trait]
pub trait SecretResolver: Clone + Send + Sync + 'static {
    async fn resolve(&self, env_name: &str, ctx: &SecretContext<'_>) -> Option<String>;
}

/// Reads secrets from the daemon's own environment.
#[derive(Clone, Default)]
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, env_name: &str, _ctx: &SecretContext<'_>) -> Option<String> {
        std::env::var(env_name).ok()
    }
}

/// Map-backed resolver for tests.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone, Default)]
pub struct FakeSecretResolver {
    map: std::sync::Arc<parking_lot::Mutex<std::collections::HashMap<String, String>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: &str) {
        self.map.lock().insert(name.to_string(), value.to_string());
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl SecretResolver for FakeSecretResolver {
    async fn resolve(&self, env_name: &str, _ctx: &SecretContext<'_>) -> Option<String> {
        self.map.lock().get(env_name).cloned()
    }
}
