// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Completion-hook injector.
//!
//! For agents that support an on-completion hook, a Stop entry is merged
//! into the repo's agent settings file so the agent POSTs a one-time
//! callback when it finishes a step. The returned cleanup restores the
//! file byte-for-byte if it existed, otherwise removes only our entries.

use cam_core::{PipelineId, TaskId};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Callback path served by the daemon.
pub const STEP_DONE_PATH: &str = "/api/terminal/step-done";

/// Relative location of the settings file inside the repo.
const SETTINGS_FILE: &str = ".claude/settings.json";

/// Errors from hook injection.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether the agent family honors the settings-file Stop hook.
pub fn supports_completion_hook(agent_id: &str) -> bool {
    agent_id == "claude-code" || agent_id.starts_with("claude-")
}

/// Everything needed to compose the callback.
#[derive(Debug, Clone)]
pub struct HookSpec {
    pub port: u16,
    pub token: String,
    pub pipeline_id: PipelineId,
    pub task_id: TaskId,
}

impl HookSpec {
    fn callback_url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, STEP_DONE_PATH)
    }

    fn payload(&self) -> String {
        json!({
            "token": self.token,
            "pipelineId": self.pipeline_id,
            "taskId": self.task_id,
        })
        .to_string()
    }

    fn command(&self) -> String {
        format!(
            "curl -s -X POST -H 'Content-Type: application/json' -d '{}' {}",
            self.payload(),
            self.callback_url()
        )
    }
}

/// Restores the settings file to its pre-injection state. Idempotent.
#[derive(Debug)]
pub struct HookCleanup {
    path: PathBuf,
    /// Original bytes when the file pre-existed; None when we created it.
    original: Option<Vec<u8>>,
    done: bool,
}

impl HookCleanup {
    pub fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        match &self.original {
            Some(bytes) => {
                if let Err(e) = fs::write(&self.path, bytes) {
                    tracing::warn!(path = %self.path.display(), error = %e, "hook cleanup restore failed");
                }
            }
            None => {
                if let Err(e) = remove_step_done_entries(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "hook cleanup removal failed");
                }
            }
        }
    }
}

/// Merge the step-done Stop hook into the repo's settings file.
///
/// Unrelated configuration (other hooks, other keys, other Stop entries)
/// is preserved. The write is atomic: temp file then rename.
pub fn inject_step_done_hook(repo_path: &Path, spec: &HookSpec) -> Result<HookCleanup, HookError> {
    let path = repo_path.join(SETTINGS_FILE);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let original = match fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let mut settings: Value = original
        .as_deref()
        .and_then(|bytes| serde_json::from_slice(bytes).ok())
        .unwrap_or_else(|| json!({}));

    if !settings.is_object() {
        settings = json!({});
    }

    let stop_entry = json!({
        "matcher": "",
        "hooks": [{
            "type": "command",
            "command": spec.command(),
        }]
    });

    let hooks = settings
        .as_object_mut()
        .map(|obj| obj.entry("hooks").or_insert_with(|| json!({})));
    let Some(hooks) = hooks else {
        return write_atomic(&path, &settings).map(|_| HookCleanup {
            path,
            original,
            done: false,
        });
    };
    if !hooks.is_object() {
        *hooks = json!({});
    }
    if let Some(hooks_obj) = hooks.as_object_mut() {
        let stop = hooks_obj.entry("Stop").or_insert_with(|| json!([]));
        if !stop.is_array() {
            *stop = json!([]);
        }
        if let Some(stop_arr) = stop.as_array_mut() {
            stop_arr.push(stop_entry);
        }
    }

    write_atomic(&path, &settings)?;

    Ok(HookCleanup {
        path,
        original,
        done: false,
    })
}

fn write_atomic(path: &Path, settings: &Value) -> Result<(), HookError> {
    let rendered = serde_json::to_string_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, rendered)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Strip only the Stop entries whose command targets the step-done
/// endpoint; remove the file entirely when nothing else is left.
fn remove_step_done_entries(path: &Path) -> Result<(), HookError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let Ok(mut settings) = serde_json::from_slice::<Value>(&bytes) else {
        // Someone rewrote the file into a shape we don't understand;
        // leave it alone.
        return Ok(());
    };

    let mut now_empty = false;
    if let Some(hooks) = settings.get_mut("hooks").and_then(Value::as_object_mut) {
        if let Some(stop) = hooks.get_mut("Stop").and_then(Value::as_array_mut) {
            stop.retain(|entry| !entry.to_string().contains(STEP_DONE_PATH));
            if stop.is_empty() {
                hooks.remove("Stop");
            }
        }
        now_empty = hooks.is_empty();
    }
    if now_empty {
        if let Some(obj) = settings.as_object_mut() {
            obj.remove("hooks");
        }
    }

    if settings.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        fs::remove_file(path)?;
        return Ok(());
    }

    write_atomic(path, &settings)
}

#[cfg(test)]
#[path = "hooks_tests.rs"]
mod tests;
