// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent catalog: definitions of the locally installed CLI agents CAM can
//! launch.
//!
//! Definitions are configuration, never mutated by the engine. Built-ins
//! ship with the daemon and are read-only; extra definitions may be
//! registered at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Agent ids whose conversations can be reopened with `--resume` /
/// `--continue` and therefore participate in the prepared-session pool.
pub const SESSION_GOVERNED_AGENTS: &[&str] = &["claude-code", "codex"];

/// True if the agent's sessions are pool-governed (reusable conversations).
pub fn is_session_governed(agent_id: &str) -> bool {
    SESSION_GOVERNED_AGENTS.contains(&agent_id)
}

/// Where an agent's process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRuntime {
    /// Directly on the host.
    #[default]
    Native,
    /// Through the Linux sub-environment bridge on Windows hosts.
    LinuxSubenv,
}

/// Declared environment variable an agent needs at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
}

impl EnvVarSpec {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            sensitive: true,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            sensitive: true,
        }
    }
}

/// A launchable CLI agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Stable identifier (e.g. "claude-code").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Executable looked up on PATH (or an absolute path).
    pub executable: String,
    /// Arguments always passed before mode/prompt arguments.
    #[serde(default)]
    pub default_args: Vec<String>,
    /// Environment variables the agent reads.
    #[serde(default)]
    pub env_vars: Vec<EnvVarSpec>,
    #[serde(default)]
    pub runtime: AgentRuntime,
    /// Built-ins ship with the daemon and cannot be replaced.
    #[serde(default)]
    pub built_in: bool,
}

/// Errors from catalog mutation.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("agent '{0}' is built-in and read-only")]
    BuiltIn(String),
}

/// Registry of agent definitions, seeded with the built-ins.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    defs: HashMap<String, AgentDefinition>,
}

impl AgentCatalog {
    /// Catalog containing only the built-in agents.
    pub fn builtin() -> Self {
        let mut defs = HashMap::new();
        for def in builtin_definitions() {
            defs.insert(def.id.clone(), def);
        }
        Self { defs }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.defs.get(agent_id)
    }

    /// Register a non-built-in definition. Replacing a built-in is refused.
    pub fn register(&mut self, def: AgentDefinition) -> Result<(), CatalogError> {
        if let Some(existing) = self.defs.get(&def.id) {
            if existing.built_in {
                return Err(CatalogError::BuiltIn(def.id));
            }
        }
        self.defs.insert(def.id.clone(), def);
        Ok(())
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.defs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_definitions() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition {
            id: "claude-code".to_string(),
            name: "Claude Code".to_string(),
            executable: "claude".to_string(),
            default_args: vec![],
            env_vars: vec![EnvVarSpec::optional("ANTHROPIC_API_KEY")],
            runtime: AgentRuntime::Native,
            built_in: true,
        },
        AgentDefinition {
            id: "codex".to_string(),
            name: "Codex CLI".to_string(),
            executable: "codex".to_string(),
            default_args: vec![],
            env_vars: vec![EnvVarSpec::required("OPENAI_API_KEY")],
            runtime: AgentRuntime::Native,
            built_in: true,
        },
        AgentDefinition {
            id: "gemini-cli".to_string(),
            name: "Gemini CLI".to_string(),
            executable: "gemini".to_string(),
            default_args: vec![],
            env_vars: vec![EnvVarSpec::required("GEMINI_API_KEY")],
            runtime: AgentRuntime::Native,
            built_in: true,
        },
        AgentDefinition {
            id: "aider".to_string(),
            name: "Aider".to_string(),
            executable: "aider".to_string(),
            default_args: vec![],
            env_vars: vec![
                EnvVarSpec::optional("OPENAI_API_KEY"),
                EnvVarSpec::optional("ANTHROPIC_API_KEY"),
            ],
            runtime: AgentRuntime::Native,
            built_in: true,
        },
    ]
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
