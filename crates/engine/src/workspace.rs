// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step workspace layout.
//!
//! Agents in a pipeline coordinate through files under the repo, never
//! shared memory. The engine guarantees the layout and the prompt contract;
//! whether an agent honors them is outside its control.

use cam_core::Pipeline;
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Root of the per-pipeline exchange area, relative to the repo.
pub const CONVERSATIONS_DIR: &str = ".conversations";

/// Relative directory for a step (0-based index, 1-based name).
pub fn step_dir_rel(step_index: usize) -> String {
    format!("{}/step{}", CONVERSATIONS_DIR, step_index + 1)
}

/// Relative path of a node's required output file (0-based node index).
pub fn node_output_rel(step_index: usize, node_index: usize) -> String {
    format!("{}/agent-{}-output.md", step_dir_rel(step_index), node_index + 1)
}

fn node_task_rel(step_index: usize, node_index: usize) -> String {
    format!("{}/agent-{}-task.md", step_dir_rel(step_index), node_index + 1)
}

/// Create the step directory and write `workspace.json` describing it.
pub(crate) fn ensure_step_workspace(
    repo: &Path,
    pipeline: &Pipeline,
    step_index: usize,
    now_ms: u64,
) -> io::Result<PathBuf> {
    let step = &pipeline.steps[step_index];
    let dir = repo.join(step_dir_rel(step_index));
    fs::create_dir_all(&dir)?;

    let previous = (step_index > 0).then(|| step_dir_rel(step_index - 1));
    let manifest = json!({
        "pipelineId": pipeline.id,
        "stepIndex": step_index + 1,
        "stepTitle": step.title,
        "stepPrompt": step.prompt,
        "inputFiles": step.input_files,
        "inputCondition": step.input_condition,
        "previousStepDir": previous,
        "generatedAt": now_ms,
    });
    fs::write(
        dir.join("workspace.json"),
        serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string()),
    )?;
    Ok(dir)
}

/// Compose the fully rendered prompt for one node.
///
/// The node's own prompt is prefixed with the coordination contract:
/// where this step lives, where the previous step's artifacts are, what
/// to read, and what to write.
pub fn render_node_prompt(pipeline: &Pipeline, step_index: usize, node_index: usize) -> String {
    let step = &pipeline.steps[step_index];
    let node = &step.nodes[node_index];
    let step_dir = step_dir_rel(step_index);
    let step_count = pipeline.steps.len();
    let node_count = step.nodes.len();

    let mut out = String::new();
    out.push_str("## Pipeline context\n\n");
    out.push_str(&format!("- Pipeline: {}\n", pipeline.id));
    out.push_str(&format!(
        "- Step {} of {}: {}\n",
        step_index + 1,
        step_count,
        step.title
    ));
    out.push_str(&format!(
        "- You are agent {} of {} in this step\n",
        node_index + 1,
        node_count
    ));
    out.push_str(&format!("- Step directory: {}\n", step_dir));
    match step_index {
        0 => out.push_str("- Previous step: no previous step\n"),
        _ => out.push_str(&format!(
            "- Previous step directory: {}\n",
            step_dir_rel(step_index - 1)
        )),
    }
    if let Some(condition) = &step.input_condition {
        out.push_str(&format!("- Input condition: {}\n", condition));
    }
    if step.input_files.is_empty() {
        if step_index > 0 {
            out.push_str(&format!(
                "- Suggested input: {}/summary.md\n",
                step_dir_rel(step_index - 1)
            ));
        }
    } else {
        out.push_str(&format!(
            "- Preferred input files: {}\n",
            step.input_files.join(", ")
        ));
    }
    out.push_str(&format!(
        "- Write your result to: {}\n",
        node_output_rel(step_index, node_index)
    ));
    out.push_str(&format!(
        "- Contribute a short recap to the shared step summary: {}/summary.md\n",
        step_dir
    ));

    out.push_str("\n## Task\n\n");
    out.push_str(&node.prompt);
    out.push('\n');

    if node_count > 1 {
        out.push_str("\n## Shared step goal\n\n");
        out.push_str(&step.prompt);
        out.push('\n');
    }

    out
}

/// Persist the rendered prompt next to the other step artifacts.
pub(crate) fn write_node_task_file(
    repo: &Path,
    step_index: usize,
    node_index: usize,
    rendered: &str,
) -> io::Result<()> {
    fs::write(repo.join(node_task_rel(step_index, node_index)), rendered)
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;
