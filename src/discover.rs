//! The discover sub-agent: a read-only ReAct loop that seeds facts before
//! main planning.
//!
//! The model alternates `Thought:` / `Action:` lines; actions are calls into
//! a whitelisted set of probe tools (`files_*`, `pyenv_*`, `git_repo_status`)
//! or `finish`. Observations are rendered as compact summaries rather than
//! raw envelopes, and every result is also sniffed for deterministic facts.
//! The loop ends on `finish` or after a turn cap, then writes a short
//! natural-language summary of the project and how to set it up.

use crate::facts::{self, Facts};
use crate::llm::{CompletionParams, Llm, parse_loose_json};
use crate::observer::sniff_boolean_facts;
use crate::state::Mode;
use crate::tools::{Envelope, ToolRegistry};
use crate::trace;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::sync::LazyLock;

/// Read-only tools the discover loop may call.
pub const ALLOWED_TOOLS: &[&str] = &[
    "files_exists",
    "files_stat",
    "files_list",
    "files_read",
    "files_find",
    "files_read_section",
    "files_read_range",
    "files_grep",
    "md_outline",
    "pyenv_python_info",
    "pyenv_tool_versions",
    "pyenv_parse_pyproject",
    "pyenv_select_installer",
    "git_repo_status",
];

/// Files worth calling out in directory listings.
const KEY_FILES: &[&str] = &[
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "requirements.txt",
    "readme.md",
    "readme",
];

/// One ReAct turn.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub thought: String,
    pub action: String,
    pub observation: String,
}

/// Result of a discover run.
#[derive(Debug, Clone)]
pub struct DiscoverOutcome {
    pub transcript: Vec<Turn>,
    pub summary: String,
    pub facts: Facts,
}

/// A parsed action line.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Finish,
    Tool { name: String, args: Value },
    Invalid,
}

static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^([A-Za-z_]\w*)\s*\((.*)\)\s*$").expect("action regex"));

/// Parse an action line like `files_list(path="repo_root")` or `finish`.
pub fn parse_action(line: &str) -> Action {
    let mut text = line.trim();
    loop {
        let lower = text.to_lowercase();
        if let Some(rest) = lower.strip_prefix("action:") {
            text = text[text.len() - rest.len()..].trim();
        } else {
            break;
        }
    }
    if text.is_empty() {
        return Action::Invalid;
    }
    let lower = text.to_lowercase();
    if lower.starts_with("finish") || lower == "done" || lower == "no more actions" {
        return Action::Finish;
    }

    let Some(c) = ACTION_RE.captures(text) else {
        return Action::Invalid;
    };
    let name = c[1].to_string();
    let args_src = c[2].trim();

    let mut args = Map::new();
    for pair in split_top_level(args_src) {
        let Some((key, raw_val)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let raw_val = raw_val.trim();
        let value = serde_json::from_str::<Value>(raw_val).unwrap_or_else(|_| {
            let stripped = raw_val.trim_matches(['"', '\'']);
            json!(stripped)
        });
        args.insert(key, value);
    }
    Action::Tool {
        name,
        args: Value::Object(args),
    }
}

/// Split `a=1, b="x, y"` on commas outside quotes and brackets.
fn split_top_level(src: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in src.char_indices() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                '[' | '(' | '{' => depth += 1,
                ']' | ')' | '}' => depth -= 1,
                ',' if depth == 0 => {
                    if !src[start..i].trim().is_empty() {
                        parts.push(&src[start..i]);
                    }
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    if !src[start..].trim().is_empty() {
        parts.push(&src[start..]);
    }
    parts
}

// ---------------------------------------------------------------------------
// Observation rendering
// ---------------------------------------------------------------------------

/// Render a tool envelope as a compact observation for the model.
pub fn render_observation(env: &Envelope) -> String {
    if !env.ok {
        return format!(
            "tool {} failed: {}",
            env.tool,
            env.error.as_deref().unwrap_or("unknown error")
        );
    }
    match env.tool.as_str() {
        "files_read" => {
            let path = env.field("path").and_then(Value::as_str).unwrap_or_default();
            let content = env.field("content").and_then(Value::as_str).unwrap_or_default();
            let truncated = env.field("truncated").and_then(Value::as_bool).unwrap_or(false);
            format!(
                "read {path} ({} chars){}:\n{content}",
                content.len(),
                if truncated { " [truncated]" } else { "" },
            )
        }
        "files_list" => {
            let dir = env.field("dir").and_then(Value::as_str).unwrap_or_default();
            let entries = env
                .field("entries")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let mut key_files = Vec::new();
            let mut dirs = Vec::new();
            let mut py_files = Vec::new();
            let mut others = Vec::new();
            for e in &entries {
                let name = e.get("name").and_then(Value::as_str).unwrap_or_default();
                let etype = e.get("type").and_then(Value::as_str).unwrap_or("file");
                if KEY_FILES.contains(&name.to_lowercase().as_str()) {
                    key_files.push(format!("{name} [{etype}]"));
                } else if etype == "dir" {
                    dirs.push(format!("{name}/"));
                } else if name.ends_with(".py") {
                    py_files.push(name.to_string());
                } else {
                    others.push(name.to_string());
                }
            }

            let mut parts = vec![format!("directory {dir} has {} entries:", entries.len())];
            if !key_files.is_empty() {
                parts.push(format!("  key files: {}", key_files.join(", ")));
            }
            if !dirs.is_empty() {
                let shown: Vec<_> = dirs.iter().take(10).cloned().collect();
                parts.push(format!(
                    "  subdirectories ({}): {}{}",
                    dirs.len(),
                    shown.join(", "),
                    if dirs.len() > 10 { "..." } else { "" }
                ));
            }
            if !py_files.is_empty() {
                let shown: Vec<_> = py_files.iter().take(8).cloned().collect();
                parts.push(format!(
                    "  python files ({}): {}{}",
                    py_files.len(),
                    shown.join(", "),
                    if py_files.len() > 8 { "..." } else { "" }
                ));
            }
            if !others.is_empty() && others.len() <= 15 {
                parts.push(format!("  other: {}", others.join(", ")));
            }
            parts.join("\n")
        }
        "files_exists" => {
            let path = env.field("path").and_then(Value::as_str).unwrap_or_default();
            let exists = env.field("exists").and_then(Value::as_bool).unwrap_or(false);
            format!("{path} {}", if exists { "exists" } else { "does not exist" })
        }
        "pyenv_parse_pyproject" => {
            if env.field("exists").and_then(Value::as_bool) != Some(true) {
                return format!(
                    "no pyproject.toml at {}",
                    env.field("path").and_then(Value::as_str).unwrap_or_default()
                );
            }
            let name = env
                .field("project_name")
                .and_then(Value::as_str)
                .unwrap_or("(unnamed)");
            let deps = env
                .field("dependencies")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let shown: Vec<&str> = deps.iter().filter_map(Value::as_str).take(10).collect();
            format!(
                "project {name}, {} dependencies: {}{}",
                deps.len(),
                shown.join(", "),
                if deps.len() > 10 { "..." } else { "" }
            )
        }
        _ => {
            let data = serde_json::to_string(&env.data).unwrap_or_default();
            data.chars().take(800).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn system_rules() -> String {
    format!(
        "You are a read-only project scout. Understand the workspace step by step, and when the picture \
         is sufficient, finish so a setup plan can be written.\n\n\
         Rules:\n\
         - Only use these read-only tools: {}\n\
         - Never perform mutating actions (no run_instruction, no git_ensure_cloned).\n\
         - Path arguments are relative to the workspace root, or use the 'repo_root' placeholder.\n\
         - Strategy: files_list first for the overall shape, then follow the key files the listing \
           highlights; avoid blind probing.\n\
         - Finish once dependency information (pyproject or requirements) and README highlights are known.\n\n\
         Reply format, exactly one of each:\n\
         Thought: your reasoning\n\
         Action: tool_name(arg=value, ...)  or  finish\n\n\
         Examples:\n\
         - files_list(path=\"repo_root\")\n\
         - files_read(path=\"repo_root/README.md\", mode=\"head\")\n\
         - md_outline(path=\"repo_root/README.md\")\n\
         - pyenv_parse_pyproject(pyproject_path=\"pyproject.toml\")\n",
        ALLOWED_TOOLS.join(", ")
    )
}

fn build_react_prompt(goal: &str, transcript: &[Turn]) -> String {
    let mut lines = vec![system_rules(), format!("Goal: {goal}\n")];
    let start = transcript.len().saturating_sub(6);
    for turn in &transcript[start..] {
        if !turn.thought.is_empty() {
            lines.push(format!("Thought: {}", turn.thought));
        }
        if !turn.action.is_empty() {
            lines.push(format!("Action: {}", turn.action));
        }
        if !turn.observation.is_empty() {
            let ob: String = turn.observation.chars().take(1500).collect();
            lines.push(format!("Observation: {ob}"));
        }
    }
    lines.push("\nContinue from here: output one Thought and one Action line.".into());
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

/// Run the discover loop and return the transcript, summary, and seeded
/// facts.
pub async fn run_discover(
    goal: &str,
    seed_facts: Facts,
    llm: &dyn Llm,
    registry: &ToolRegistry,
    work_root: &Path,
    max_turns: usize,
) -> DiscoverOutcome {
    let mut transcript: Vec<Turn> = Vec::new();
    let mut facts = seed_facts;
    facts::normalize(&mut facts, work_root);

    for _ in 0..max_turns {
        let prompt = build_react_prompt(goal, &transcript);
        let resp = llm
            .complete(&prompt, CompletionParams::new(0.2, 400))
            .await
            .unwrap_or_default();

        let mut thought = String::new();
        let mut action_line = String::new();
        for line in resp.lines() {
            let t = line.trim();
            let lower = t.to_lowercase();
            if thought.is_empty() && lower.starts_with("thought:") {
                thought = t[8..].trim().to_string();
            }
            if action_line.is_empty() && lower.starts_with("action:") {
                action_line = t.to_string();
            }
        }
        if action_line.is_empty() {
            // Heuristic: any tool-looking line counts as the action.
            if let Some(line) = resp.lines().find(|l| l.contains('(') && l.contains(')')) {
                action_line = format!("Action: {}", line.trim());
            }
        }

        let mut turn = Turn {
            thought,
            action: action_line.clone(),
            observation: String::new(),
        };

        match parse_action(&action_line) {
            Action::Finish => {
                transcript.push(turn);
                break;
            }
            Action::Tool { name, args } => {
                if !ALLOWED_TOOLS.contains(&name.as_str()) {
                    turn.observation = format!("unsupported_action: {name}");
                    transcript.push(turn);
                    continue;
                }
                trace::note("discover_action", format!("{name}({args})"));
                let env = registry.call(&name, args).await;
                turn.observation = render_observation(&env);
                sniff_boolean_facts(&mut facts, &env);
                merge_llm_facts(llm, goal, &mut facts, &env).await;
                facts::normalize(&mut facts, work_root);
                transcript.push(turn);
            }
            Action::Invalid => {
                turn.observation = "invalid_action".to_string();
                transcript.push(turn);
            }
        }
    }

    let summary = summarize(goal, &transcript, llm).await;
    DiscoverOutcome {
        transcript,
        summary,
        facts,
    }
}

/// Ask the model which canonical facts the latest observation establishes,
/// and merge its delta. Best-effort: a garbled reply merges nothing.
async fn merge_llm_facts(llm: &dyn Llm, goal: &str, facts: &mut Facts, env: &Envelope) {
    let env_json = serde_json::to_string(env).unwrap_or_default();
    let env_short: String = env_json.chars().take(1200).collect();
    let facts_json = serde_json::to_string(&*facts).unwrap_or_default();
    let facts_short: String = facts_json.chars().take(800).collect();
    let prompt = format!(
        "During read-only discovery for the goal below, a probe tool returned a result. \
         Report which canonical facts it establishes.\n\
         Goal: {goal}\n\
         Mode: {}  \n\
         Known facts: {facts_short}\n\
         Tool result: {env_short}\n\n\
         Canonical keys: repo_root, project_root, project_name, exec_root, has_pyproject, \
         has_setup_py, has_requirements_txt, has_readme, readme_read.\n\
         Output JSON only: {{\"facts_delta\": {{}} or null}}",
        Mode::Discover,
    );
    let resp = llm
        .complete(&prompt, CompletionParams::new(0.2, 300))
        .await
        .unwrap_or_default();
    if let Some(data) = parse_loose_json(&resp) {
        if let Some(delta) = data.get("facts_delta").and_then(Value::as_object) {
            facts::merge_delta(facts, delta.clone());
        }
    }
}

async fn summarize(goal: &str, transcript: &[Turn], llm: &dyn Llm) -> String {
    let mut lines = vec![
        "Read-only exploration of the project is complete. Write the summary from this excerpt:".to_string(),
        format!("Goal: {goal}"),
        String::new(),
    ];
    let start = transcript.len().saturating_sub(12);
    for t in &transcript[start..] {
        if !t.thought.is_empty() {
            lines.push(format!("Thought: {}", t.thought));
        }
        if !t.action.is_empty() {
            lines.push(format!("Action: {}", t.action));
        }
        if !t.observation.is_empty() {
            let ob: String = t.observation.chars().take(1200).collect();
            lines.push(format!("Observation: {ob}"));
        }
    }
    lines.push(
        "\nProduce a clear, practical project understanding and setup plan, covering:\n\
         - key findings (project type, dependency management, likely entry points)\n\
         - install recommendation (which of uv/pip/poetry/pdm/conda and why, with example commands)\n\
         - run/test suggestions and caveats\n\
         - open gaps and which files to read next, if information is missing"
            .to_string(),
    );

    llm.complete(&lines.join("\n"), CompletionParams::new(0.2, 700))
        .await
        .unwrap_or_else(|_| "(summary unavailable)".to_string())
}
