// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn req(agent: &str, mode: SessionMode) -> CommandRequest {
    CommandRequest {
        agent_id: agent.to_string(),
        executable: agent.to_string(),
        default_args: vec![],
        mode,
        prompt: Some("do the thing".to_string()),
        resume_conversation_id: None,
        auto_exit: false,
    }
}

#[test]
fn generic_create_is_bare_prompt() {
    let plan = build_exec_plan(&req("claude-code", SessionMode::Create));
    assert_eq!(plan.file, "claude-code");
    assert_eq!(plan.args, vec!["do the thing"]);
}

#[test]
fn generic_create_empty_prompt_is_empty_args() {
    let mut r = req("claude-code", SessionMode::Create);
    r.prompt = None;
    assert!(build_exec_plan(&r).args.is_empty());

    r.prompt = Some(String::new());
    assert!(build_exec_plan(&r).args.is_empty());
}

#[test]
fn generic_auto_exit_uses_print_mode() {
    let mut r = req("claude-code", SessionMode::Create);
    r.auto_exit = true;
    assert_eq!(build_exec_plan(&r).args, vec!["-p", "do the thing"]);
}

#[test]
fn generic_resume_with_id() {
    let mut r = req("claude-code", SessionMode::Resume);
    r.resume_conversation_id = Some("conv-9".to_string());
    assert_eq!(
        build_exec_plan(&r).args,
        vec!["--resume", "conv-9", "do the thing"]
    );
}

#[test]
fn generic_resume_without_id_falls_back_to_continue() {
    let r = req("claude-code", SessionMode::Resume);
    assert_eq!(build_exec_plan(&r).args, vec!["--continue", "do the thing"]);
}

#[test]
fn generic_continue() {
    let r = req("claude-code", SessionMode::Continue);
    assert_eq!(build_exec_plan(&r).args, vec!["--continue", "do the thing"]);
}

#[test]
fn default_args_lead() {
    let mut r = req("claude-code", SessionMode::Create);
    r.default_args = vec!["--dangerously-skip-permissions".to_string()];
    assert_eq!(
        build_exec_plan(&r).args,
        vec!["--dangerously-skip-permissions", "do the thing"]
    );
}

#[test]
fn codex_resume_with_id() {
    let mut r = req("codex", SessionMode::Resume);
    r.resume_conversation_id = Some("abc".to_string());
    assert_eq!(build_exec_plan(&r).args, vec!["resume", "abc", "do the thing"]);
}

#[test]
fn codex_continue_uses_last() {
    let r = req("codex", SessionMode::Continue);
    assert_eq!(
        build_exec_plan(&r).args,
        vec!["resume", "--last", "do the thing"]
    );
}

#[test]
fn codex_resume_auto_exit_adds_full_auto() {
    let mut r = req("codex", SessionMode::Resume);
    r.resume_conversation_id = Some("abc".to_string());
    r.auto_exit = true;
    assert_eq!(
        build_exec_plan(&r).args,
        vec!["resume", "abc", "--full-auto", "do the thing"]
    );
}

#[test]
fn codex_create_empty_prompt() {
    let mut r = req("codex", SessionMode::Create);
    r.prompt = None;
    assert_eq!(build_exec_plan(&r).args, vec!["--full-auto"]);
}

#[test]
fn codex_create_auto_exit_uses_exec() {
    let mut r = req("codex", SessionMode::Create);
    r.auto_exit = true;
    assert_eq!(
        build_exec_plan(&r).args,
        vec!["exec", "--full-auto", "do the thing"]
    );
}

#[test]
fn codex_create_interactive_with_prompt() {
    let r = req("codex", SessionMode::Create);
    assert_eq!(build_exec_plan(&r).args, vec!["--full-auto", "do the thing"]);
}

#[parameterized(
    unknown = { "totally-unknown-agent" },
    gemini = { "gemini-cli" },
    aider = { "aider" },
)]
fn unknown_agents_get_generic_rules(agent: &str) {
    let plan = build_exec_plan(&req(agent, SessionMode::Create));
    assert_eq!(plan.args, vec!["do the thing"]);
}

#[test]
fn no_shell_escaping_happens() {
    let mut r = req("claude-code", SessionMode::Create);
    r.prompt = Some("echo \"$HOME\" && `ls`".to_string());
    assert_eq!(build_exec_plan(&r).args, vec!["echo \"$HOME\" && `ls`"]);
}
