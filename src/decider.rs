//! The decider: picks the next tool call for the current step.
//!
//! Facts take priority over the step's written intent: a clone intent is
//! downgraded to a status probe when the project is already on disk. In
//! discover mode specialized probe tools are preferred over the shell; in
//! execute mode install/build/run intents go through `run_instruction`. When
//! the LLM's decision cannot be parsed, a deterministic keyword mapping and
//! finally the raw step instruction keep the loop moving.

use crate::facts::{self, Facts};
use crate::llm::{CompletionParams, Llm, parse_loose_json};
use crate::output;
use crate::state::{AgentState, Mode};
use crate::tools::{Envelope, ToolRegistry};
use crate::trace;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::sync::LazyLock;

/// Default timeout for ordinary commands.
const SHORT_TIMEOUT: u64 = 60;

/// Default timeout for long-running commands (clones, installs).
const LONG_TIMEOUT: u64 = 1800;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+|git@\S+").expect("url regex"));

/// The decider's verdict, carried to the execute node.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    Replan,
    CallTool {
        name: String,
        args: Value,
        timeout: u64,
    },
    CallInstruction {
        text: String,
        timeout: u64,
        session: Option<String>,
    },
}

/// Long-running intents get a generous default timeout.
pub fn default_timeout_for(text: &str) -> u64 {
    let t = text.to_lowercase();
    if t.contains("git clone") || t.contains("git pull") || t.contains("install") || t.contains("clone") {
        LONG_TIMEOUT
    } else {
        SHORT_TIMEOUT
    }
}

/// Deterministic intent-keyword mapping used when the LLM decision is
/// unusable. Conservative on purpose: anything ambiguous falls through to
/// `run_instruction`.
pub fn map_intent_keywords(intent: &str, mode: Mode, facts: &Facts) -> Option<(String, Value)> {
    let t = intent.to_lowercase();

    if t.contains("pyproject") && (t.contains("parse") || t.contains("read") || t.contains("analy")) {
        return Some(("pyenv_parse_pyproject".into(), json!({})));
    }
    if t.contains("python") && (t.contains("version") || t.contains("interpreter") || t.contains("detect") || t.contains("probe")) {
        return Some(("pyenv_python_info".into(), json!({})));
    }
    if t.contains("installer") || t.contains("package manager") {
        let mut args = Map::new();
        if let Some(pr) = facts::get_str(facts, facts::PROJECT_ROOT) {
            args.insert("project_root".into(), json!(pr));
        }
        return Some(("pyenv_select_installer".into(), Value::Object(args)));
    }
    if mode == Mode::Execute && (t.contains("clone") || (t.contains("repository") && t.contains("available"))) {
        if let Some(url) = URL_RE.find(intent) {
            return Some((
                "git_ensure_cloned".into(),
                json!({"url": url.as_str().trim_end_matches(['.', ','])}),
            ));
        }
    }
    if t.contains("branch") || t.contains("origin") || (t.contains("repo") && t.contains("status")) {
        let path = facts::get_str(facts, facts::PROJECT_ROOT).unwrap_or(".");
        return Some(("git_repo_status".into(), json!({"path": path})));
    }
    if mode == Mode::Discover {
        if t.contains("list") || t.contains("directory contents") {
            return Some(("files_list".into(), json!({"path": "."})));
        }
        if t.contains("readme") && t.contains("read") {
            return Some(("files_read".into(), json!({"path": "README.md", "mode": "head"})));
        }
    }
    None
}

/// Envelope-aware summary of the previous result for the decision prompt.
fn summarize_last_result(last: &Envelope) -> String {
    if last.tool == "run_instruction" {
        let cmd = last.field("command").and_then(Value::as_str).unwrap_or_default();
        let exit = last.field("exit_code").cloned().unwrap_or(Value::Null);
        let stdout = last.field("stdout").and_then(Value::as_str).unwrap_or_default();
        let hints = if last.ok {
            String::new()
        } else {
            let lines = output::failure_hints(stdout, 4);
            if lines.is_empty() {
                String::new()
            } else {
                format!("\nfailure hints:\n{}", lines.join("\n"))
            }
        };
        format!(
            "tool: run_instruction\ncommand: {}\nexit code: {}\noutput:\n{}{}\nerror: {}",
            cmd,
            exit,
            output::compact_for_prompt(stdout, 12),
            hints,
            last.error.as_deref().unwrap_or("none"),
        )
    } else {
        // Specialized tools: show the fields the decider keys on.
        let keys = ["path", "exists", "dir", "installer", "reason", "is_repo", "project_root", "existed", "cloned"];
        let mut shown = Map::new();
        if let Some(obj) = last.data.as_object() {
            for k in keys {
                if let Some(v) = obj.get(k) {
                    shown.insert(k.to_string(), v.clone());
                }
            }
        }
        format!(
            "tool: {}\nstatus: {}\nkey data: {}\nerror: {}",
            last.tool,
            if last.ok { "ok" } else { "failed" },
            serde_json::to_string(&shown).unwrap_or_default(),
            last.error.as_deref().unwrap_or("none"),
        )
    }
}

fn build_decision_prompt(state: &AgentState, registry: &ToolRegistry) -> String {
    let mut tool_lines = String::new();
    for name in registry.names() {
        if let Some(tool) = registry.get(name) {
            tool_lines.push_str(&format!(
                "- {}: args {}\n",
                name,
                serde_json::to_string(&tool.schema()).unwrap_or_default()
            ));
        }
    }

    let step = state.current_step();
    let step_line = step
        .map(|s| format!("#{} '{}': {}", s.id, s.title, s.instruction))
        .unwrap_or_else(|| "(no current step)".into());
    let titles = state.task.titles().join(", ");
    let facts_json = serde_json::to_string(&state.facts).unwrap_or_default();
    let facts_short: String = facts_json.chars().take(1000).collect();
    let last = state
        .last_result
        .as_ref()
        .map(summarize_last_result)
        .unwrap_or_else(|| "(none)".into());

    format!(
        "You direct task execution. Given the current step's INTENT and the facts, pick exactly one action. \
         Facts always win over the written intent; prefer specialized tools and use the shell only as a fallback.\n\n\
         Available tools:\n{tool_lines}\n\
         Decision rules:\n\
         - Never contradict the facts. If facts.project_root is set, do not clone or re-discover the workspace root.\n\
         - discover mode: probing intents (list/check/read/find/parse/repo status) map to the matching files_*/pyenv_*/git_repo_status tool.\n\
         - execute mode: repository-availability intents use git_ensure_cloned (omit dest unless one is required; never pass '.'); \
           install/build/run intents use run_instruction.\n\
         - Paths are resolved against the workspace root; use relative paths, and '.' for the root itself. \
           Never paste fact key names as literal paths.\n\
         - Commands inside the project use the PROJECT_ROOT variable (for example an editable install targets it).\n\
         - Long operations (clone, pull, install) need timeout >= 300.\n\
         - If the last step failed and a small adjustment suffices, issue the adjusted instruction; \
           if the plan itself is wrong, request a re-plan.\n\n\
         Task goal: {goal}\n\
         Plan step titles: {titles}\n\
         Current step index: {idx}\n\
         Current step: {step_line}\n\
         Mode: {mode}  Episode: {episode}\n\
         Known facts: {facts_short}\n\
         Last result:\n{last}\n\n\
         Output strict JSON only, one of:\n\
         {{\"action\": \"call_tool\", \"tool_name\": \"files_list\", \"tool_args\": {{\"path\": \".\"}}}}\n\
         {{\"action\": \"call_instruction\", \"nl_instruction\": \"...\", \"timeout\": 300}}\n\
         {{\"action\": \"replan\"}}\n",
        goal = state.goal,
        idx = state.current_step_index,
        mode = state.mode,
        episode = state.episode,
    )
}

/// The decision node.
pub async fn decide_node(
    state: &AgentState,
    llm: &dyn Llm,
    registry: &ToolRegistry,
) -> ToolRequest {
    let Some(step) = state.current_step() else {
        return ToolRequest::Replan;
    };
    let intent = step.instruction.clone();

    // Facts override intent: the project already being on disk turns a clone
    // into a status probe.
    if intent.to_lowercase().contains("clone") {
        if let Some(project_root) = facts::get_str(&state.facts, facts::PROJECT_ROOT) {
            if Path::new(project_root).exists() {
                return ToolRequest::CallTool {
                    name: "git_repo_status".into(),
                    args: json!({"path": project_root}),
                    timeout: SHORT_TIMEOUT,
                };
            }
        }
    }

    let prompt = build_decision_prompt(state, registry);
    let resp = llm
        .complete(&prompt, CompletionParams::new(0.2, 300))
        .await
        .unwrap_or_default();
    trace::note("decide_raw_resp", &resp);

    let fallback = |intent: &str| -> ToolRequest {
        if let Some((name, args)) = map_intent_keywords(intent, state.mode, &state.facts) {
            return ToolRequest::CallTool {
                name,
                args,
                timeout: default_timeout_for(intent),
            };
        }
        ToolRequest::CallInstruction {
            text: intent.to_string(),
            timeout: step.timeout.unwrap_or_else(|| default_timeout_for(intent)),
            session: state.session_id.clone(),
        }
    };

    let Some(data) = parse_loose_json(&resp) else {
        return fallback(&intent);
    };

    match data.get("action").and_then(Value::as_str) {
        Some("replan") => ToolRequest::Replan,
        Some("call_tool") => {
            let name = data
                .get("tool_name")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() || registry.get(&name).is_none() {
                return fallback(&intent);
            }
            let args = data.get("tool_args").cloned().unwrap_or_else(|| json!({}));
            let timeout = data
                .get("timeout")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| default_timeout_for(&intent));
            ToolRequest::CallTool { name, args, timeout }
        }
        _ => {
            let text = data
                .get("nl_instruction")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| intent.clone());
            let timeout = data
                .get("timeout")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| default_timeout_for(&text));
            let session = data
                .get("session_token")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| state.session_id.clone());
            ToolRequest::CallInstruction {
                text,
                timeout,
                session,
            }
        }
    }
}
