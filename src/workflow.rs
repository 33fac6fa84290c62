//! The graph driver: discover, then cycle plan -> decide -> execute ->
//! observe until the observer asserts `end` or the hop limit trips.

use crate::config::AgentConfig;
use crate::decider::{self, ToolRequest};
use crate::discover;
use crate::facts::{self, Facts};
use crate::llm::Llm;
use crate::observer;
use crate::planner;
use crate::sanitize::EnvSnapshot;
use crate::session::SessionManager;
use crate::state::{AgentState, Route};
use crate::tools::shell::{RunInstruction, SharedEnv};
use crate::tools::{ToolContext, ToolRegistry, fs, git, pyenv};
use crate::trace;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

/// Final report of one agent run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub completed: bool,
    pub failed: bool,
    pub note: String,
    pub hops: usize,
    pub step_summaries: Vec<String>,
    pub facts: Facts,
}

/// Long-lived wiring for one agent process: config, LLM handle, session
/// manager, tool registry, and the env snapshot shared with the shell tool.
pub struct Workflow {
    config: AgentConfig,
    llm: Arc<dyn Llm>,
    registry: ToolRegistry,
    sessions: SessionManager,
    shared_env: SharedEnv,
}

impl Workflow {
    pub fn new(config: AgentConfig, llm: Arc<dyn Llm>) -> Self {
        let sessions = SessionManager::new(config.work_root.clone());
        let shared_env: SharedEnv = Arc::new(Mutex::new(EnvSnapshot {
            repo_root: config.work_root.to_string_lossy().into_owned(),
            project_root: None,
        }));
        let registry = build_registry(&config, &sessions, &llm, &shared_env);
        Self {
            config,
            llm,
            registry,
            sessions,
            shared_env,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the agent to completion for one goal.
    pub async fn run(&self, goal: &str) -> RunReport {
        // Seed facts: the workspace root is pinned before any tool fires.
        let mut seed = Facts::new();
        seed.insert(
            facts::REPO_ROOT.into(),
            json!(self.config.work_root.to_string_lossy()),
        );
        facts::normalize(&mut seed, &self.config.work_root);

        // Read-only discovery seeds the fact store.
        tracing::info!("discover: scouting the workspace");
        let discovered = discover::run_discover(
            goal,
            seed,
            self.llm.as_ref(),
            &self.registry,
            &self.config.work_root,
            self.config.max_discover_turns,
        )
        .await;
        trace::note("discover_summary", &discovered.summary);
        tracing::info!(turns = discovered.transcript.len(), "discover finished");

        let mut state = AgentState::new(goal, discovered.facts);
        let mut summaries: Vec<String> = Vec::new();
        let mut hops = 0usize;

        while hops < self.config.recursion_limit {
            hops += 1;
            match state.route {
                Route::Plan => {
                    let summary = planner::plan_node(
                        &mut state,
                        self.llm.as_ref(),
                        &self.config.work_root,
                        self.sessions.flavor(),
                    )
                    .await;
                    tracing::info!(%summary, "planned");
                    summaries.push(summary);
                    state.route = Route::Decide;
                }
                Route::Decide => {
                    let request =
                        decider::decide_node(&state, self.llm.as_ref(), &self.registry).await;
                    match request {
                        ToolRequest::Replan => {
                            state.route = Route::Plan;
                            continue;
                        }
                        ToolRequest::CallTool { name, args, .. } => {
                            self.execute(&mut state, &name, args).await;
                        }
                        ToolRequest::CallInstruction {
                            text,
                            timeout,
                            session,
                        } => {
                            let args = json!({
                                "intent": text,
                                "timeout": timeout,
                                "session_token": session,
                            });
                            self.execute(&mut state, "run_instruction", args).await;
                        }
                    }

                    observer::observe_node(&mut state, self.llm.as_ref(), &self.config.work_root)
                        .await;
                    let step_line = format!(
                        "step {}/{} | {} | route {:?}",
                        state.current_step_index,
                        state.task.steps.len(),
                        state.observation,
                        state.route,
                    );
                    tracing::info!("{step_line}");
                    summaries.push(step_line);

                    if state.is_complete {
                        break;
                    }
                }
                Route::End => break,
                // The observer only ever leaves Plan/Decide/End in the route
                // slot; repeat/skip are folded into Decide.
                Route::RepeatStep | Route::SkipStep => {
                    state.route = Route::Decide;
                }
            }
        }

        self.sessions.close_all().await;

        let exhausted = hops >= self.config.recursion_limit && !state.is_complete;
        RunReport {
            completed: state.is_complete && !state.failed,
            failed: state.failed || exhausted,
            note: if exhausted {
                format!("recursion limit ({}) exceeded", self.config.recursion_limit)
            } else {
                state.observation.clone()
            },
            hops,
            step_summaries: summaries,
            facts: state.facts,
        }
    }

    /// Execute one tool call: refresh the shared env from the facts, record
    /// the call and its result in the audit log.
    async fn execute(&self, state: &mut AgentState, name: &str, args: Value) {
        if let Ok(mut env) = self.shared_env.lock() {
            *env = EnvSnapshot::from_facts(&state.facts);
        }
        state.record_tool_call(name, args.clone());
        let envelope = self.registry.call(name, args).await;
        state.last_result = Some(envelope.clone());
        state.record_tool_result(envelope);
    }
}

fn build_registry(
    config: &AgentConfig,
    sessions: &SessionManager,
    llm: &Arc<dyn Llm>,
    shared_env: &SharedEnv,
) -> ToolRegistry {
    let ctx = ToolContext {
        work_root: config.work_root.clone(),
    };
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(fs::FilesExists(ctx.clone())));
    registry.register(Arc::new(fs::FilesStat(ctx.clone())));
    registry.register(Arc::new(fs::FilesList(ctx.clone())));
    registry.register(Arc::new(fs::FilesRead(ctx.clone())));
    registry.register(Arc::new(fs::FilesFind(ctx.clone())));
    registry.register(Arc::new(fs::FilesReadSection(ctx.clone())));
    registry.register(Arc::new(fs::FilesReadRange(ctx.clone())));
    registry.register(Arc::new(fs::FilesGrep(ctx.clone())));
    registry.register(Arc::new(fs::MdOutline(ctx.clone())));
    registry.register(Arc::new(pyenv::PythonInfo(ctx.clone())));
    registry.register(Arc::new(pyenv::ToolVersions(ctx.clone())));
    registry.register(Arc::new(pyenv::ParsePyproject(ctx.clone())));
    registry.register(Arc::new(pyenv::SelectInstaller(ctx.clone())));
    registry.register(Arc::new(git::GitRepoStatus(ctx.clone())));
    registry.register(Arc::new(git::GitEnsureCloned(ctx)));
    registry.register(Arc::new(RunInstruction {
        sessions: sessions.clone(),
        llm: llm.clone(),
        env: shared_env.clone(),
    }));
    registry
}
