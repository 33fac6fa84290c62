//! CLI entry point for the setupsh agent.
//!
//! Initializes tracing to stderr, builds the workflow from the environment,
//! runs the goal to completion, and exits 0 only when the observer ended the
//! run without a recorded failure.

use anyhow::Result;
use clap::Parser;
use setupsh::config::AgentConfig;
use setupsh::llm::OpenAiClient;
use setupsh::workflow::Workflow;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Autonomous task-execution agent: give it a goal, it drives the shell.
#[derive(Debug, Parser)]
#[command(name = "setupsh", version, about)]
struct Cli {
    /// The task to accomplish, e.g. "install all dependencies of this repo".
    #[arg(long)]
    goal: String,

    /// Maximum node hops in the task graph before giving up.
    #[arg(long, default_value_t = 100)]
    recursion_limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::from_env();
    config.recursion_limit = cli.recursion_limit;

    tracing::info!(
        work_root = %config.work_root.display(),
        model = %config.llm.model,
        "starting setupsh v{}",
        env!("CARGO_PKG_VERSION")
    );

    let llm = Arc::new(OpenAiClient::new(config.llm.clone()));
    let workflow = Workflow::new(config, llm);
    let report = workflow.run(&cli.goal).await;

    for line in &report.step_summaries {
        println!("{line}");
    }
    println!(
        "{}: {}",
        if report.completed { "done" } else { "failed" },
        report.note
    );

    if report.completed {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
