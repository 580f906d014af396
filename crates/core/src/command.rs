// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exec-plan builder: compile an agent launch request into `{file, args}`.
//!
//! Plans are handed to the process-spawn API as-is. Nothing here is ever
//! shell-escaped; there is no shell between CAM and the agent.

use serde::{Deserialize, Serialize};

/// How a conversation is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Fresh conversation.
    #[default]
    Create,
    /// Reopen a specific conversation by id.
    Resume,
    /// Reopen the most recent conversation.
    Continue,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Create => write!(f, "create"),
            SessionMode::Resume => write!(f, "resume"),
            SessionMode::Continue => write!(f, "continue"),
        }
    }
}

/// Input to the builder.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub agent_id: String,
    pub executable: String,
    pub default_args: Vec<String>,
    pub mode: SessionMode,
    pub prompt: Option<String>,
    pub resume_conversation_id: Option<String>,
    /// Request a non-interactive form that exits when the prompt is done.
    pub auto_exit: bool,
}

/// A directly spawnable command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub file: String,
    pub args: Vec<String>,
}

/// Build the exec plan for an agent launch.
///
/// Unknown agent ids still produce a valid plan (the generic rules).
pub fn build_exec_plan(req: &CommandRequest) -> ExecPlan {
    let mut args = req.default_args.clone();
    if is_codex_family(&req.agent_id) {
        args.extend(codex_args(req));
    } else {
        args.extend(generic_args(req));
    }
    ExecPlan {
        file: req.executable.clone(),
        args,
    }
}

fn is_codex_family(agent_id: &str) -> bool {
    agent_id == "codex" || agent_id.starts_with("codex-")
}

fn prompt_of(req: &CommandRequest) -> Option<&str> {
    req.prompt.as_deref().filter(|p| !p.is_empty())
}

/// Claude-style CLIs and everything unrecognized.
fn generic_args(req: &CommandRequest) -> Vec<String> {
    let mut args = Vec::new();
    match req.mode {
        SessionMode::Create => {
            if req.auto_exit {
                if let Some(prompt) = prompt_of(req) {
                    args.push("-p".to_string());
                    args.push(prompt.to_string());
                }
                return args;
            }
            if let Some(prompt) = prompt_of(req) {
                args.push(prompt.to_string());
            }
        }
        SessionMode::Resume => {
            match req.resume_conversation_id.as_deref() {
                Some(id) if !id.is_empty() => {
                    args.push("--resume".to_string());
                    args.push(id.to_string());
                }
                // No conversation id: the closest the CLI offers is
                // picking up the most recent conversation.
                _ => args.push("--continue".to_string()),
            }
            if let Some(prompt) = prompt_of(req) {
                args.push(prompt.to_string());
            }
        }
        SessionMode::Continue => {
            args.push("--continue".to_string());
            if let Some(prompt) = prompt_of(req) {
                args.push(prompt.to_string());
            }
        }
    }
    args
}

/// The codex CLI speaks subcommands rather than flags.
fn codex_args(req: &CommandRequest) -> Vec<String> {
    let mut args = Vec::new();
    match req.mode {
        SessionMode::Resume | SessionMode::Continue => {
            args.push("resume".to_string());
            match (req.mode, req.resume_conversation_id.as_deref()) {
                (SessionMode::Resume, Some(id)) if !id.is_empty() => args.push(id.to_string()),
                _ => args.push("--last".to_string()),
            }
            if req.auto_exit {
                args.push("--full-auto".to_string());
            }
            if let Some(prompt) = prompt_of(req) {
                args.push(prompt.to_string());
            }
        }
        SessionMode::Create => match prompt_of(req) {
            None => args.push("--full-auto".to_string()),
            Some(prompt) if req.auto_exit => {
                args.push("exec".to_string());
                args.push("--full-auto".to_string());
                args.push(prompt.to_string());
            }
            Some(prompt) => {
                args.push("--full-auto".to_string());
                args.push(prompt.to_string());
            }
        },
    }
    args
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
