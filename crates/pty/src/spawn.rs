// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Spawn planning: cwd selection and host-specific exec wrapping.
//!
//! The wrapping rules are pure functions over `(file, args, env, runtime,
//! host)` so they are testable on any host; the manager applies them with
//! the real `cfg!(windows)` flag.

use cam_core::agent::AgentRuntime;
use cam_core::paths::to_linux_subenv_path;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable some agents set to refuse nested launches.
/// Cleared from every child so agents can spawn agents.
pub(crate) const NESTED_DETECTION_VAR: &str = "CLAUDECODE";

/// A fully planned spawn: what to hand to the PTY system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecSpec {
    pub file: String,
    pub args: Vec<String>,
    /// Environment set on the child (in addition to inheritance).
    pub env: Vec<(String, String)>,
}

/// Pick the working directory: first existing candidate among the caller's
/// choice, `$HOME`, `$USERPROFILE`, and the process cwd; `/tmp` as a last
/// resort.
pub(crate) fn resolve_cwd(supplied: Option<&Path>) -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = supplied {
        candidates.push(p.to_path_buf());
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home));
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        candidates.push(PathBuf::from(profile));
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd);
    }

    candidates
        .into_iter()
        .find(|p| p.is_dir())
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// The shell used when no explicit command is given.
pub(crate) fn default_shell(host_is_windows: bool) -> String {
    if host_is_windows {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
    }
}

/// Plan the exec for a session.
///
/// - `linux-subenv` runtime on a Windows host wraps through `wsl.exe` as a
///   login shell, with the env map injected as leading `KEY=VAL` tokens
///   (env forwarding through the bridge is unreliable).
/// - A native Windows host with an explicit file goes through the command
///   interpreter so `.cmd`/`.bat` launchers work.
/// - Everything else spawns directly.
pub(crate) fn plan_spawn(
    file: Option<&str>,
    args: &[String],
    shell: Option<&str>,
    cwd: &Path,
    env: &HashMap<String, String>,
    runtime: AgentRuntime,
    host_is_windows: bool,
) -> ExecSpec {
    let env_pairs: Vec<(String, String)> = env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if runtime == AgentRuntime::LinuxSubenv && host_is_windows {
        let target = file
            .map(str::to_string)
            .unwrap_or_else(|| default_shell(false));
        let mut line = String::new();
        line.push_str("cd ");
        line.push_str(&shell_quote(&to_linux_subenv_path(&cwd.display().to_string())));
        line.push_str(" && ");
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            line.push_str(key);
            line.push('=');
            line.push_str(&shell_quote(&env[key]));
            line.push(' ');
        }
        line.push_str("exec ");
        line.push_str(&shell_quote(&target));
        for arg in args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        return ExecSpec {
            file: "wsl.exe".to_string(),
            args: vec!["bash".to_string(), "-lc".to_string(), line],
            env: env_pairs,
        };
    }

    if host_is_windows {
        if let Some(file) = file {
            let mut wrapped = vec!["/c".to_string(), file.to_string()];
            wrapped.extend(args.iter().cloned());
            return ExecSpec {
                file: "cmd.exe".to_string(),
                args: wrapped,
                env: env_pairs,
            };
        }
    }

    match file {
        Some(file) => ExecSpec {
            file: file.to_string(),
            args: args.to_vec(),
            env: env_pairs,
        },
        None => ExecSpec {
            file: shell
                .map(str::to_string)
                .unwrap_or_else(|| default_shell(host_is_windows)),
            args: vec![],
            env: env_pairs,
        },
    }
}

/// Single-quote a token for the login-shell bridge line.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
