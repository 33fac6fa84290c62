//! LLM planning: goal + facts in, a linear list of intent-only steps out.
//!
//! The planner's JSON contract also carries an environment selection (which
//! installer the plan assumes, justified by fact keys) and a self-check. A
//! garbled response degrades to a single-step plan executing the goal
//! verbatim. Re-plans are incremental by default: the already-executed prefix
//! of the step list is preserved and new steps are appended after it; only a
//! mode switch replaces the whole list and resets the cursor.

use crate::llm::{CompletionParams, Llm, parse_loose_json};
use crate::output;
use crate::sanitize::ShellFlavor;
use crate::state::{AgentState, Mode, Step};
use crate::trace;
use serde_json::Value;
use std::path::Path;

/// One step as returned by the LLM.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub title: String,
    pub instruction: String,
    pub timeout: Option<u64>,
}

/// Parsed planner response.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub title: String,
    pub steps: Vec<PlannedStep>,
    pub environment_selection: Option<Value>,
    pub self_check: Option<Value>,
    /// True when parsing failed and the single-step fallback was used.
    pub fallback: bool,
}

/// Build the planning prompt from the current state.
pub fn build_plan_prompt(state: &AgentState, work_root: &Path, flavor: ShellFlavor) -> String {
    let shell = match flavor {
        ShellFlavor::PowerShell => "PowerShell on Windows",
        ShellFlavor::Bash => "bash on a POSIX host",
    };
    let facts_json = serde_json::to_string(&state.facts).unwrap_or_default();
    let facts_short: String = facts_json.chars().take(1200).collect();
    let finished = if state.finished_titles.is_empty() {
        "(none)".to_string()
    } else {
        state.finished_titles.join(", ")
    };

    let mut prompt = format!(
        "You are a task planner. Produce a linear list of steps for the task below.\n\n\
         Output format:\n\
         - Output ONLY JSON, no explanations or extra text.\n\
         - Structure: {{\"title\": \"episode label\", \
           \"environment_selection\": {{\"installer\": \"uv|pip|poetry|pdm|conda|pipenv|custom|none\", \"reason\": \"...\", \"evidence_fact_keys\": [\"...\"]}}, \
           \"steps\": [{{\"title\": \"...\", \"instruction\": \"...\"}}], \
           \"self_check\": {{\"ok\": true, \"violations\": []}}}}\n\n\
         Environment:\n\
         - Workspace root: {}\n\
         - Host shell: {}\n\
         - Mode: {}  Episode: {}\n\n\
         Known facts (the only source of truth): {}\n\
         Already finished step titles: {}\n\n\
         Step requirements:\n\
         - Each instruction describes WHAT to do, never a literal shell command or tool name.\n\
         - Each step must be completable by a single command.\n\
         - Never repeat a finished step title.\n\
         - Never contradict the facts: if project_root is set, do not plan to clone or re-locate the project.\n\
         - environment_selection.reason must cite the fact keys listed in evidence_fact_keys.\n",
        work_root.to_string_lossy(),
        shell,
        state.mode,
        state.episode,
        facts_short,
        finished,
    );

    if state.mode == Mode::Execute {
        prompt.push_str(
            "- Execute mode: no exploratory steps. Every step must reference the fact key that proves its precondition.\n",
        );
    }

    // Incremental context: completed prefix, pending suffix, last result.
    let idx = state.current_step_index.min(state.task.steps.len());
    if !state.task.steps.is_empty() {
        let completed: Vec<&str> = state.task.steps[..idx].iter().map(|s| s.title.as_str()).collect();
        let remaining: Vec<&str> = state.task.steps[idx..].iter().map(|s| s.title.as_str()).collect();
        prompt.push_str(&format!(
            "\nRe-planning context (incremental): keep completed steps untouched and output ONLY the remaining steps, \
             inserting repair steps first when needed.\n\
             Completed step titles: {}\n\
             Prior remaining step titles: {}\n",
            if completed.is_empty() { "(none)".into() } else { completed.join(", ") },
            if remaining.is_empty() { "(none)".into() } else { remaining.join(", ") },
        ));
        if let Some(last) = &state.last_result {
            let exit = last.field("exit_code").cloned().unwrap_or(Value::Null);
            let cmd = last
                .field("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let stdout = last
                .field("stdout")
                .and_then(Value::as_str)
                .unwrap_or_default();
            prompt.push_str(&format!(
                "Last result: tool={} ok={} exit={} cmd={}\nOutput excerpt:\n{}\n",
                last.tool,
                last.ok,
                exit,
                &cmd.chars().take(200).collect::<String>(),
                output::compact_for_prompt(stdout, 12),
            ));
        }
    }

    prompt.push_str(&format!("\nTask: {}\n\nOutput the JSON now.", state.goal));
    prompt
}

/// Parse the planner response, degrading to the single-step fallback.
pub fn parse_plan(resp: &str, goal: &str) -> PlanOutcome {
    let parsed = parse_loose_json(resp);

    let mut title = goal.to_string();
    let mut steps: Vec<PlannedStep> = Vec::new();
    let mut environment_selection = None;
    let mut self_check = None;

    if let Some(data) = parsed {
        if let Some(t) = data.get("title").and_then(Value::as_str) {
            if !t.trim().is_empty() {
                title = t.trim().to_string();
            }
        }
        environment_selection = data.get("environment_selection").cloned();
        self_check = data.get("self_check").cloned();
        if let Some(raw_steps) = data.get("steps").and_then(Value::as_array) {
            for (idx, s) in raw_steps.iter().enumerate() {
                let instruction = s
                    .get("instruction")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default();
                if instruction.is_empty() {
                    continue;
                }
                let step_title = s
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("step {}", idx + 1));
                steps.push(PlannedStep {
                    title: step_title,
                    instruction: instruction.to_string(),
                    timeout: s.get("timeout").and_then(Value::as_u64),
                });
            }
        }
    }

    if steps.is_empty() {
        return PlanOutcome {
            title: goal.to_string(),
            steps: vec![PlannedStep {
                title: "execute goal".to_string(),
                instruction: goal.to_string(),
                timeout: None,
            }],
            environment_selection: None,
            self_check: None,
            fallback: true,
        };
    }

    PlanOutcome {
        title,
        steps,
        environment_selection,
        self_check,
        fallback: false,
    }
}

/// Merge planned steps into the task.
///
/// `replace` swaps the whole list and resets the cursor (mode-switched
/// re-plan); otherwise the executed prefix up to the cursor is preserved and
/// new steps are appended after it with fresh ids. Steps whose titles were
/// already finished are dropped either way.
pub fn merge_steps(
    state: &mut AgentState,
    mut new_steps: Vec<PlannedStep>,
    replace: bool,
) {
    new_steps.retain(|s| !state.finished_titles.contains(&s.title));

    let prefix: Vec<Step> = if replace {
        Vec::new()
    } else {
        let idx = state.current_step_index.min(state.task.steps.len());
        state.task.steps[..idx].to_vec()
    };

    let mut steps = prefix;
    let base = steps.len() as u32;
    for (i, s) in new_steps.into_iter().enumerate() {
        steps.push(Step {
            id: base + i as u32 + 1,
            title: s.title,
            instruction: s.instruction,
            timeout: s.timeout,
        });
    }

    state.task.steps = steps;
    if replace {
        state.current_step_index = 0;
    }
}

/// The planning node: prompt the LLM, merge the result, reset per-plan state.
pub async fn plan_node(
    state: &mut AgentState,
    llm: &dyn Llm,
    work_root: &Path,
    flavor: ShellFlavor,
) -> String {
    let prompt = build_plan_prompt(state, work_root, flavor);
    let resp = llm
        .complete(&prompt, CompletionParams::new(0.1, 1000))
        .await
        .unwrap_or_default();
    trace::note("planner_raw_resp", &resp);

    let outcome = parse_plan(&resp, &state.goal);
    if let Some(env_sel) = &outcome.environment_selection {
        trace::note("planner_env_selection", env_sel);
    }
    if let Some(check) = &outcome.self_check {
        trace::note("planner_self_check", check);
    }

    let replace = state
        .last_plan_mode
        .map(|m| m != state.mode)
        .unwrap_or(false);
    merge_steps(state, outcome.steps, replace);
    state.last_plan_mode = Some(state.mode);
    state.replan_requested = false;
    state.last_result = None;

    let titles: Vec<&str> = state.task.titles();
    let summary = format!(
        "plan '{}': {} steps ({})",
        outcome.title,
        state.task.steps.len(),
        titles.join(" -> ")
    );
    trace::note("summary_plan", &summary);
    summary
}
