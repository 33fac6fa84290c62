//! The observer/router: classifies the last tool result, merges fact deltas,
//! and chooses the next edge.
//!
//! The LLM proposes a route and optional fact updates; everything else is
//! deterministic and applied by [`apply_decision`]: legacy-key migration and
//! normalization, git-clone and README post-processing, finished-title
//! bookkeeping, cursor advancement, the repeat-count threshold, and the
//! once-per-episode throttles on re-plans and mode switches. `end` is the
//! only route that terminates the run.

use crate::facts::{self, Facts};
use crate::llm::{CompletionParams, Llm, parse_loose_json};
use crate::output;
use crate::state::{AgentState, Mode, Route};
use crate::tools::Envelope;
use crate::trace;
use regex::Regex;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::LazyLock;

/// Repeats of one step title tolerated before a re-plan is forced.
const MAX_STEP_REPEATS: u32 = 2;

/// The parsed LLM routing decision.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub route: Route,
    pub mode: Option<Mode>,
    pub facts_delta: Option<Facts>,
    pub success: Option<bool>,
    pub notes: String,
}

impl Default for RouteDecision {
    fn default() -> Self {
        Self {
            route: Route::Decide,
            mode: None,
            facts_delta: None,
            success: None,
            notes: "continue".to_string(),
        }
    }
}

/// Parse the observer response, falling back to the default decision.
pub fn parse_route_decision(resp: &str) -> RouteDecision {
    let Some(data) = parse_loose_json(resp) else {
        return RouteDecision::default();
    };

    let route = match data.get("route").and_then(Value::as_str).unwrap_or("decide") {
        "repeat_step" => Route::RepeatStep,
        "skip_step" => Route::SkipStep,
        "plan" => Route::Plan,
        "end" => Route::End,
        // `switch_mode` from older model outputs reads as a plan request;
        // the mode field carries the actual switch.
        "switch_mode" => Route::Plan,
        _ => Route::Decide,
    };
    let mode = match data.get("mode").and_then(Value::as_str) {
        Some("discover") => Some(Mode::Discover),
        Some("execute") => Some(Mode::Execute),
        _ => None,
    };
    let facts_delta = data
        .get("facts_delta")
        .and_then(Value::as_object)
        .cloned();
    let success = data.get("success").and_then(Value::as_bool);
    let notes = data
        .get("notes")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    RouteDecision {
        route,
        mode,
        facts_delta,
        success,
        notes,
    }
}

/// Build the observation prompt.
pub fn build_observer_prompt(state: &AgentState, last: Option<&Envelope>) -> String {
    let titles = state.task.titles().join(", ");
    let last_json = last
        .map(|e| serde_json::to_string(e).unwrap_or_default())
        .unwrap_or_else(|| "null".into());
    let last_short: String = last_json.chars().take(1200).collect();
    let facts_json = serde_json::to_string(&state.facts).unwrap_or_default();
    let facts_short: String = facts_json.chars().take(1200).collect();

    // On a failure, lead with the lines that explain it; they are usually
    // buried deep in the truncated result JSON.
    let hints = last
        .filter(|e| !e.ok)
        .and_then(|e| e.field("stdout").and_then(Value::as_str))
        .map(|s| output::failure_hints(s, 5))
        .unwrap_or_default();
    let hint_block = if hints.is_empty() {
        String::new()
    } else {
        format!("\nFailure hints:\n- {}", hints.join("\n- "))
    };

    format!(
        "You are the observer. Based on the latest result, the mode, and the facts, choose the next route \
         and report any fact updates.\n\
         Mode: {}  Episode: {}\n\
         Goal: {}\n\
         Plan step titles: [{}]\n\
         Current index: {}\n\
         Latest result: {}{hint_block}\n\
         Known facts: {}\n\n\
         Routes: decide | repeat_step | skip_step | plan | end\n\
         - decide: continue; the cursor advances past the current step when the result succeeded\n\
         - repeat_step: retry the current step\n\
         - skip_step: give up on the current step and move on\n\
         - plan: the plan no longer fits, re-plan\n\
         - end: the goal is fully achieved (the only way to finish)\n\
         To switch mode set \"mode\" to discover or execute. Report new facts under canonical keys only \
         (repo_root, project_root, project_name, exec_root, has_pyproject, has_setup_py, \
         has_requirements_txt, has_readme, readme_read).\n\n\
         Output JSON only:\n\
         {{\"route\": \"decide|repeat_step|skip_step|plan|end\", \"mode\": \"discover|execute\" or null, \
         \"facts_delta\": {{}} or null, \"success\": true/false/null, \"notes\": \"one-line reason\"}}",
        state.mode, state.episode, state.goal, titles, state.current_step_index, last_short, facts_short,
    )
}

// ---------------------------------------------------------------------------
// Post-processing: git clone
// ---------------------------------------------------------------------------

static JOIN_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)Join-Path\s+\$env:REPO_ROOT\s+(?:'([^']+)'|"([^"]+)")"#).expect("join regex")
});

static BASH_ROOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""?\$REPO_ROOT/([^\s'"]+)"?"#).expect("bash root regex"));

/// Flags of `git clone` that consume a following value.
const CLONE_VALUE_FLAGS: &[&str] = &["--depth", "-b", "--branch", "-o", "--origin", "--filter"];

/// Parse `<url> [target]` out of a `git clone` command line, skipping flags.
pub fn parse_git_clone(command: &str) -> Option<(String, Option<String>)> {
    let lower = command.to_lowercase();
    let at = lower.find("git clone")?;
    let rest = &command[at + "git clone".len()..];

    // Tokenize, keeping (...) and quoted spans intact.
    let mut tokens: Vec<String> = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut tok = String::new();
        if c == '(' {
            let mut depth = 0;
            for ch in chars.by_ref() {
                tok.push(ch);
                if ch == '(' {
                    depth += 1;
                } else if ch == ')' {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
            }
        } else if c == '"' || c == '\'' {
            let quote = c;
            tok.push(chars.next().unwrap_or(quote));
            for ch in chars.by_ref() {
                tok.push(ch);
                if ch == quote {
                    break;
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                tok.push(ch);
                chars.next();
            }
        }
        tokens.push(tok);
    }

    let mut positional: Vec<String> = Vec::new();
    let mut it = tokens.into_iter().peekable();
    while let Some(tok) = it.next() {
        if tok.starts_with('-') {
            if CLONE_VALUE_FLAGS.contains(&tok.as_str()) {
                it.next();
            }
            continue;
        }
        positional.push(tok);
    }

    let url = positional.first()?.trim_matches(['"', '\'']).to_string();
    let target = positional.get(1).cloned();
    Some((url, target))
}

/// After a successful shell `git clone`, derive `project_root` and
/// `project_name` from the command line and overwrite placeholder values.
pub fn postprocess_git_clone(facts: &mut Facts, command: &str, default_root: &Path) {
    let Some((url, target)) = parse_git_clone(command) else {
        return;
    };
    let repo_name = crate::sanitize::repo_name_from_url(&url);

    let workspace_root = facts::get_str(facts, facts::REPO_ROOT)
        .map(str::to_string)
        .unwrap_or_else(|| default_root.to_string_lossy().into_owned());

    let mut project_root_abs = String::new();
    if let Some(target) = target {
        if let Some(c) = JOIN_PATH_RE.captures(&target) {
            let rel = c.get(1).or_else(|| c.get(2)).map(|m| m.as_str()).unwrap_or("");
            project_root_abs = facts::expand_root_placeholders(&format!("repo_root/{rel}"), &workspace_root);
        } else if let Some(c) = BASH_ROOT_RE.captures(&target) {
            project_root_abs =
                facts::expand_root_placeholders(&format!("repo_root/{}", &c[1]), &workspace_root);
        } else {
            let cleaned = target
                .trim()
                .trim_matches(['(', ')'])
                .trim()
                .trim_matches(['"', '\''])
                .to_string();
            if !cleaned.is_empty() {
                project_root_abs = facts::expand_root_placeholders(&cleaned, &workspace_root);
            }
        }
    }
    if project_root_abs.is_empty() {
        project_root_abs =
            facts::expand_root_placeholders(&format!("repo_root/{repo_name}"), &workspace_root);
    }

    if facts::get_str(facts, facts::REPO_ROOT).is_none() {
        facts.insert(facts::REPO_ROOT.into(), json!(workspace_root));
    }
    // Overwrite a missing or placeholder project_root with the derived path.
    let current = facts::get_str(facts, facts::PROJECT_ROOT).unwrap_or_default();
    let placeholder = current.is_empty()
        || current.to_lowercase().starts_with("repo_root/")
        || current.to_lowercase().starts_with("repo_root\\")
        || current.starts_with("$env:REPO_ROOT")
        || current.starts_with("$REPO_ROOT");
    if placeholder {
        facts.insert(facts::PROJECT_ROOT.into(), json!(project_root_abs));
    }
    if facts::get_str(facts, facts::PROJECT_NAME).is_none() {
        facts.insert(facts::PROJECT_NAME.into(), json!(repo_name));
    }
    if facts::get_str(facts, facts::EXEC_ROOT).is_none() {
        let root = facts::get_str(facts, facts::REPO_ROOT).unwrap_or_default().to_string();
        facts.insert(facts::EXEC_ROOT.into(), json!(root));
    }
}

// ---------------------------------------------------------------------------
// Post-processing: README extraction
// ---------------------------------------------------------------------------

/// Extract a structured projection of a README.
///
/// Fields: `project_name`, `description`, `install_cmds`, `run_cmds`,
/// `python_min_version`, `entry_points`, `links`. Absent evidence simply
/// leaves a field out.
pub fn extract_readme_info(text: &str) -> Facts {
    let mut info = Facts::new();
    let text = text.trim();
    if text.is_empty() {
        return info;
    }

    static TITLE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^\s*#\s+(.+)$").expect("title regex"));
    static INSTALL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?mi)^(?:\s*[-*$>]\s*)*((?:pipx?|pip3|conda|poetry|pdm|uv)\s+[^\n]+)$")
            .expect("install regex")
    });
    static RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?mi)^(?:\s*[-*$>]\s*)*((?:python3?\s+-m\s+\S+[^\n]*|pytest\b[^\n]*|uvicorn\b[^\n]*|streamlit\b[^\n]*|gunicorn\b[^\n]*|make\s+\S+))\s*$",
        )
        .expect("run regex")
    });
    static PYVER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)python\s*(?:>=|=>)?\s*([0-9]+\.[0-9]+)").expect("pyver regex")
    });
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\((https?://[^)]+)\)").expect("link regex"));
    static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^\s*(?:Usage:|\$)\s*([A-Za-z][\w-]+)\b").expect("entry regex")
    });

    if let Some(c) = TITLE_RE.captures(text) {
        info.insert("project_name".into(), json!(c[1].trim()));
    }

    // Description: first non-empty paragraph after the title line.
    let mut hit_title = false;
    let mut desc: Vec<&str> = Vec::new();
    for line in text.lines() {
        if !hit_title {
            if line.trim_start().starts_with("# ") {
                hit_title = true;
            }
            continue;
        }
        if line.trim().is_empty() {
            if !desc.is_empty() {
                break;
            }
            continue;
        }
        desc.push(line.trim());
    }
    if !desc.is_empty() {
        let joined: String = desc.join(" ").chars().take(400).collect();
        info.insert("description".into(), json!(joined));
    }

    let mut install: Vec<String> = INSTALL_RE
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();
    install.sort();
    install.dedup();
    if !install.is_empty() {
        info.insert("install_cmds".into(), json!(install));
    }

    let mut run: Vec<String> = RUN_RE
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();
    run.sort();
    run.dedup();
    if !run.is_empty() {
        info.insert("run_cmds".into(), json!(run));
    }

    if let Some(c) = PYVER_RE.captures(text) {
        info.insert("python_min_version".into(), json!(&c[1]));
    }

    let mut entries: Vec<String> = ENTRY_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    entries.sort();
    entries.dedup();
    if !entries.is_empty() {
        info.insert("entry_points".into(), json!(entries));
    }

    let mut links: Vec<String> = LINK_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    links.sort();
    links.dedup();
    if !links.is_empty() {
        info.insert("links".into(), json!(links));
    }

    info
}

// ---------------------------------------------------------------------------
// Deterministic fact sniffing
// ---------------------------------------------------------------------------

/// Marker files whose presence maps onto a boolean fact.
const MARKER_FACTS: &[(&str, &str)] = &[
    ("pyproject.toml", "has_pyproject"),
    ("setup.py", "has_setup_py"),
    ("requirements.txt", "has_requirements_txt"),
];

/// Harvest boolean facts directly from probe results, independent of the LLM.
pub fn sniff_boolean_facts(facts: &mut Facts, last: &Envelope) {
    if !last.ok {
        return;
    }
    match last.tool.as_str() {
        "files_exists" => {
            let path = last.field("path").and_then(Value::as_str).unwrap_or_default();
            let exists = last.field("exists").and_then(Value::as_bool).unwrap_or(false);
            let lower = path.to_lowercase();
            for (file, key) in MARKER_FACTS {
                if lower.ends_with(file) {
                    facts.insert((*key).into(), json!(exists));
                }
            }
            if lower.ends_with("readme.md") || lower.ends_with("readme") {
                facts.insert("has_readme".into(), json!(exists));
            }
        }
        "files_list" => {
            let Some(entries) = last.field("entries").and_then(Value::as_array) else {
                return;
            };
            let names: Vec<String> = entries
                .iter()
                .filter_map(|e| e.get("name").and_then(Value::as_str))
                .map(str::to_lowercase)
                .collect();
            for (file, key) in MARKER_FACTS {
                if names.iter().any(|n| n == file) {
                    facts.insert((*key).into(), json!(true));
                }
            }
            if names.iter().any(|n| n == "readme.md" || n == "readme" || n == "readme.rst") {
                facts.insert("has_readme".into(), json!(true));
            }
        }
        "pyenv_parse_pyproject" => {
            if let Some(exists) = last.field("exists").and_then(Value::as_bool) {
                facts.insert("has_pyproject".into(), json!(exists));
            }
        }
        "git_ensure_cloned" => {
            for key in [facts::PROJECT_ROOT, facts::PROJECT_NAME, facts::REPO_ROOT] {
                if let Some(v) = last.field(key).and_then(Value::as_str) {
                    if !v.trim().is_empty() {
                        facts.insert(key.into(), json!(v));
                    }
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Decision application
// ---------------------------------------------------------------------------

fn result_succeeded(last: Option<&Envelope>) -> bool {
    let Some(env) = last else {
        return false;
    };
    match env.field("exit_code").and_then(Value::as_i64) {
        Some(code) => code == 0,
        None => env.ok,
    }
}

/// Apply a routing decision to the state. Pure with respect to the LLM: all
/// throttles, merges, and advancement rules live here.
pub fn apply_decision(state: &mut AgentState, decision: RouteDecision, default_root: &Path) {
    let mut route = decision.route;
    let mut notes = decision.notes.clone();
    let last = state.last_result.clone();

    // Fact merge: delta, deterministic sniffing, post-processing, normalize.
    if let Some(delta) = decision.facts_delta {
        facts::merge_delta(&mut state.facts, delta);
    }
    if let Some(last) = &last {
        sniff_boolean_facts(&mut state.facts, last);

        let command = last
            .field("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if result_succeeded(Some(last)) && command.to_lowercase().contains("git clone") {
            postprocess_git_clone(&mut state.facts, &command, default_root);
        }

        let stdout = last
            .field("stdout")
            .or_else(|| last.field("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let head: String = stdout.chars().take(50).collect();
        let mentions_readme = command.to_uppercase().contains("README")
            || head.to_uppercase().contains("README")
            || last
                .field("path")
                .and_then(Value::as_str)
                .map(|p| p.to_lowercase().contains("readme"))
                .unwrap_or(false);
        if last.ok && !stdout.is_empty() && mentions_readme {
            let parsed = extract_readme_info(stdout);
            if !parsed.is_empty() {
                for (k, v) in parsed {
                    state.readme_info.insert(k, v);
                }
                state.facts.insert("has_readme".into(), json!(true));
                state.facts.insert("readme_read".into(), json!(true));
            }
        }
    }
    facts::normalize(&mut state.facts, default_root);

    // Finished titles: a step completes when its executing call succeeded.
    let success = decision.success.unwrap_or_else(|| result_succeeded(last.as_ref()));
    let current_title = state.current_step().map(|s| s.title.clone());
    if let Some(title) = &current_title {
        if success && !state.finished_titles.contains(title) {
            state.finished_titles.push(title.clone());
        }
    }

    // Repeat-count threshold: more than MAX_STEP_REPEATS retries of one step
    // title forces a re-plan.
    let mut forced_plan = false;
    if route == Route::RepeatStep {
        if let Some(title) = current_title.clone() {
            let count = state.repeat_counts.entry(title).or_insert(0);
            *count += 1;
            if *count > MAX_STEP_REPEATS {
                route = Route::Plan;
                forced_plan = true;
                notes.push_str(" (repeat limit reached, re-planning)");
            }
        }
    }

    // Mode switch, throttled to once per episode. A suggestion arriving in
    // an episode that already switched (or re-planned) is ignored, including
    // a redundant suggestion of the mode just switched to.
    let mut mode_switched = false;
    if let Some(new_mode) = decision.mode {
        let throttled = state.last_replan_episode == state.episode;
        if new_mode != state.mode && !throttled {
            state.mode = new_mode;
            state.episode += 1;
            state.last_replan_episode = state.episode;
            mode_switched = true;
            if route != Route::End {
                route = Route::Plan;
            }
        } else if throttled {
            notes.push_str(" mode_switch_throttled");
        }
    }

    // Plain re-plan throttle: at most one LLM-requested re-plan per episode.
    if route == Route::Plan && !mode_switched {
        if !forced_plan && state.last_replan_episode == state.episode {
            route = Route::Decide;
            notes.push_str(" replan_throttled");
        } else {
            state.last_replan_episode = state.episode;
        }
    }

    // Cursor advancement.
    match route {
        Route::Decide => {
            if success {
                state.current_step_index += 1;
            }
        }
        Route::SkipStep => {
            state.current_step_index += 1;
        }
        Route::RepeatStep | Route::Plan => {}
        Route::End => {
            state.is_complete = true;
            if decision.success == Some(false) {
                state.failed = true;
            }
        }
    }

    // A rebuilt session surfaces through the result's token.
    if let Some(token) = last
        .as_ref()
        .and_then(|e| e.field("session_token"))
        .and_then(Value::as_str)
    {
        state.session_id = Some(token.to_string());
    }

    state.replan_requested = route == Route::Plan;
    state.route = match route {
        Route::RepeatStep | Route::SkipStep => Route::Decide,
        other => other,
    };
    state.observation = notes;
}

/// The observation node: pull the latest tool result, ask the LLM for a
/// route, and apply it.
pub async fn observe_node(state: &mut AgentState, llm: &dyn Llm, default_root: &Path) {
    if let Some(latest) = state.last_tool_result().cloned() {
        state.last_result = Some(latest);
    }

    let prompt = build_observer_prompt(state, state.last_result.as_ref());
    let resp = llm
        .complete(&prompt, CompletionParams::new(0.2, 400))
        .await
        .unwrap_or_default();
    trace::note("observer_raw_resp", &resp);

    let decision = parse_route_decision(&resp);
    apply_decision(state, decision, default_root);
    trace::note(
        "summary_observe",
        format!("{} | route {:?}", state.observation, state.route),
    );

    // Keep long stdout out of the audit trail copy used by later prompts.
    if let Some(last) = &mut state.last_result {
        if let Some(stdout) = last.data.get_mut("stdout") {
            let compacted = stdout
                .as_str()
                .filter(|s| s.len() > 8000)
                .map(|s| output::compact_for_prompt(s, 60));
            if let Some(c) = compacted {
                *stdout = json!(c);
            }
        }
    }
}
