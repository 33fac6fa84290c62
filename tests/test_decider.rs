//! Tests for the decider: fact priority, deterministic keyword mapping,
//! timeout defaults, and fallbacks around unusable LLM output.

use async_trait::async_trait;
use serde_json::json;
use setupsh::decider::{ToolRequest, decide_node, default_timeout_for, map_intent_keywords};
use setupsh::facts::Facts;
use setupsh::llm::{CompletionParams, Llm};
use setupsh::state::{AgentState, Mode, Step};
use setupsh::tools::{ToolContext, ToolRegistry, fs, git, pyenv};
use std::sync::Arc;
use tempfile::TempDir;

struct Canned(String);

#[async_trait]
impl Llm for Canned {
    async fn complete(&self, _prompt: &str, _params: CompletionParams) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

fn registry(dir: &TempDir) -> ToolRegistry {
    let ctx = ToolContext {
        work_root: dir.path().canonicalize().unwrap(),
    };
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(fs::FilesExists(ctx.clone())));
    registry.register(Arc::new(fs::FilesList(ctx.clone())));
    registry.register(Arc::new(fs::FilesRead(ctx.clone())));
    registry.register(Arc::new(pyenv::ParsePyproject(ctx.clone())));
    registry.register(Arc::new(git::GitRepoStatus(ctx.clone())));
    registry.register(Arc::new(git::GitEnsureCloned(ctx)));
    registry
}

fn state_with_step(instruction: &str, mode: Mode) -> AgentState {
    let mut state = AgentState::new("install deps", Facts::new());
    state.mode = mode;
    state.task.steps = vec![Step {
        id: 1,
        title: "step".into(),
        instruction: instruction.into(),
        timeout: None,
    }];
    state
}

// ---------------------------------------------------------------------------
// Timeout defaults
// ---------------------------------------------------------------------------

#[test]
fn test_long_intents_get_long_timeout() {
    assert_eq!(default_timeout_for("git clone the repository"), 1800);
    assert_eq!(default_timeout_for("pip install the requirements"), 1800);
    assert_eq!(default_timeout_for("git pull latest changes"), 1800);
}

#[test]
fn test_short_intents_get_short_timeout() {
    assert_eq!(default_timeout_for("list the workspace"), 60);
    assert_eq!(default_timeout_for("read the readme"), 60);
}

// ---------------------------------------------------------------------------
// Keyword mapping
// ---------------------------------------------------------------------------

#[test]
fn test_map_pyproject_intent() {
    let (name, _) =
        map_intent_keywords("parse the pyproject file", Mode::Discover, &Facts::new()).unwrap();
    assert_eq!(name, "pyenv_parse_pyproject");
}

#[test]
fn test_map_python_probe_intent() {
    let (name, _) =
        map_intent_keywords("detect the python version", Mode::Discover, &Facts::new()).unwrap();
    assert_eq!(name, "pyenv_python_info");
}

#[test]
fn test_map_listing_intent_in_discover_only() {
    let (name, args) =
        map_intent_keywords("list the workspace directory", Mode::Discover, &Facts::new()).unwrap();
    assert_eq!(name, "files_list");
    assert_eq!(args["path"], ".");
    assert!(map_intent_keywords("list the workspace directory", Mode::Execute, &Facts::new()).is_none());
}

#[test]
fn test_map_clone_intent_extracts_url() {
    let (name, args) = map_intent_keywords(
        "clone https://github.com/example/demo.git into the workspace",
        Mode::Execute,
        &Facts::new(),
    )
    .unwrap();
    assert_eq!(name, "git_ensure_cloned");
    assert_eq!(args["url"], "https://github.com/example/demo.git");
}

#[test]
fn test_map_repo_status_uses_project_root_fact() {
    let mut facts = Facts::new();
    facts.insert("project_root".into(), json!("/ws/demo"));
    let (name, args) =
        map_intent_keywords("check the repository status and branch", Mode::Discover, &facts)
            .unwrap();
    assert_eq!(name, "git_repo_status");
    assert_eq!(args["path"], "/ws/demo");
}

#[test]
fn test_unmapped_intent_is_none() {
    assert!(map_intent_keywords("install all dependencies", Mode::Execute, &Facts::new()).is_none());
}

// ---------------------------------------------------------------------------
// decide_node
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_no_current_step_requests_replan() {
    let dir = TempDir::new().unwrap();
    let mut state = AgentState::new("goal", Facts::new());
    state.task.steps.clear();
    let request = decide_node(&state, &Canned(String::new()), &registry(&dir)).await;
    assert_eq!(request, ToolRequest::Replan);
}

#[tokio::test]
async fn test_facts_override_clone_intent() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("demo");
    std::fs::create_dir(&project).unwrap();

    let mut state = state_with_step("clone the demo repository", Mode::Execute);
    state
        .facts
        .insert("project_root".into(), json!(project.to_string_lossy()));

    // Whatever the LLM says, an existing project downgrades the clone.
    let llm = Canned(r#"{"action": "call_instruction", "nl_instruction": "git clone ..."}"#.into());
    let request = decide_node(&state, &llm, &registry(&dir)).await;
    match request {
        ToolRequest::CallTool { name, args, .. } => {
            assert_eq!(name, "git_repo_status");
            assert_eq!(args["path"], json!(project.to_string_lossy()));
        }
        other => panic!("expected git_repo_status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_valid_call_tool_decision() {
    let dir = TempDir::new().unwrap();
    let state = state_with_step("list the workspace", Mode::Discover);
    let llm = Canned(r#"{"action": "call_tool", "tool_name": "files_list", "tool_args": {"path": "."}}"#.into());
    let request = decide_node(&state, &llm, &registry(&dir)).await;
    match request {
        ToolRequest::CallTool { name, args, .. } => {
            assert_eq!(name, "files_list");
            assert_eq!(args["path"], ".");
        }
        other => panic!("expected call_tool, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_tool_falls_back_to_keyword_mapping() {
    let dir = TempDir::new().unwrap();
    let state = state_with_step("list the workspace directory", Mode::Discover);
    let llm = Canned(r#"{"action": "call_tool", "tool_name": "no_such_tool", "tool_args": {}}"#.into());
    let request = decide_node(&state, &llm, &registry(&dir)).await;
    match request {
        ToolRequest::CallTool { name, .. } => assert_eq!(name, "files_list"),
        other => panic!("expected files_list fallback, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbled_decision_falls_back_to_instruction() {
    let dir = TempDir::new().unwrap();
    let mut state = state_with_step("install all dependencies", Mode::Execute);
    state.session_id = Some("tok-7".into());
    let llm = Canned("not json at all".into());
    let request = decide_node(&state, &llm, &registry(&dir)).await;
    match request {
        ToolRequest::CallInstruction {
            text,
            timeout,
            session,
        } => {
            assert_eq!(text, "install all dependencies");
            assert_eq!(timeout, 1800);
            assert_eq!(session.as_deref(), Some("tok-7"));
        }
        other => panic!("expected call_instruction fallback, got {other:?}"),
    }
}

#[tokio::test]
async fn test_replan_decision_passed_through() {
    let dir = TempDir::new().unwrap();
    let state = state_with_step("anything", Mode::Execute);
    let llm = Canned(r#"{"action": "replan"}"#.into());
    let request = decide_node(&state, &llm, &registry(&dir)).await;
    assert_eq!(request, ToolRequest::Replan);
}

#[tokio::test]
async fn test_call_instruction_uses_state_session() {
    let dir = TempDir::new().unwrap();
    let mut state = state_with_step("run the test suite", Mode::Execute);
    state.session_id = Some("tok-3".into());
    let llm = Canned(r#"{"action": "call_instruction", "nl_instruction": "run tests", "timeout": 120}"#.into());
    let request = decide_node(&state, &llm, &registry(&dir)).await;
    match request {
        ToolRequest::CallInstruction {
            text,
            timeout,
            session,
        } => {
            assert_eq!(text, "run tests");
            assert_eq!(timeout, 120);
            assert_eq!(session.as_deref(), Some("tok-3"));
        }
        other => panic!("expected call_instruction, got {other:?}"),
    }
}
