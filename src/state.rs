//! The mutable agent state shared by every graph node.

use crate::facts::Facts;
use crate::tools::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Operating mode of the agent.
///
/// `Discover` is read-only fact gathering; `Execute` is where mutating shell
/// commands are allowed. Every switch increments the episode counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Discover,
    Execute,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Discover => write!(f, "discover"),
            Mode::Execute => write!(f, "execute"),
        }
    }
}

/// Outgoing edge chosen by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Decide,
    RepeatStep,
    SkipStep,
    Plan,
    End,
}

/// One planned step. `instruction` is always intent-level natural language,
/// never a literal shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: u32,
    pub title: String,
    pub instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// The current task: goal plus an ordered linear plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal: String,
    pub steps: Vec<Step>,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            goal: goal.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn titles(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.title.as_str()).collect()
    }
}

/// Append-only audit record. The log is never consulted for decisions beyond
/// extracting the most recent tool result.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageRecord {
    ToolCall { tool: String, args: Value },
    ToolResult { envelope: Envelope },
}

/// The sole mutable object cycled through the graph. Created once per run,
/// mutated in place by each node, discarded at process exit.
#[derive(Debug)]
pub struct AgentState {
    pub goal: String,
    pub task: Task,
    pub current_step_index: usize,
    pub last_result: Option<Envelope>,
    pub mode: Mode,
    /// Monotonically increasing; bumped on every mode switch.
    pub episode: u32,
    pub facts: Facts,
    /// Step titles already completed, kept in order for re-plan dedup.
    pub finished_titles: Vec<String>,
    /// Per-step-title repeat counter; more than two repeats forces a re-plan.
    pub repeat_counts: HashMap<String, u32>,
    pub session_id: Option<String>,
    pub messages: Vec<MessageRecord>,
    pub route: Route,
    pub replan_requested: bool,
    pub is_complete: bool,
    pub failed: bool,
    pub observation: String,
    /// Structured projection of a project README once one has been read.
    pub readme_info: Facts,
    /// Mode at the time of the last planning pass; a difference means the
    /// next plan replaces the step list instead of extending it.
    pub last_plan_mode: Option<Mode>,
    /// Episode in which the last re-plan or mode switch was applied.
    pub last_replan_episode: u32,
}

impl AgentState {
    pub fn new(goal: impl Into<String>, seed_facts: Facts) -> Self {
        let goal = goal.into();
        Self {
            task: Task::new(goal.clone()),
            goal,
            current_step_index: 0,
            last_result: None,
            mode: Mode::Discover,
            episode: 1,
            facts: seed_facts,
            finished_titles: Vec::new(),
            repeat_counts: HashMap::new(),
            session_id: None,
            messages: Vec::new(),
            route: Route::Plan,
            replan_requested: false,
            is_complete: false,
            failed: false,
            observation: String::new(),
            readme_info: Facts::new(),
            last_plan_mode: None,
            last_replan_episode: 0,
        }
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.task.step(self.current_step_index)
    }

    pub fn record_tool_call(&mut self, tool: &str, args: Value) {
        self.messages.push(MessageRecord::ToolCall {
            tool: tool.to_string(),
            args,
        });
    }

    pub fn record_tool_result(&mut self, envelope: Envelope) {
        self.messages.push(MessageRecord::ToolResult { envelope });
    }

    /// Most recent tool result from the audit log.
    pub fn last_tool_result(&self) -> Option<&Envelope> {
        self.messages.iter().rev().find_map(|m| match m {
            MessageRecord::ToolResult { envelope } => Some(envelope),
            _ => None,
        })
    }
}
