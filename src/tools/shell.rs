//! The `run_instruction` tool: natural language in, shell execution out.
//!
//! The instruction is translated into a single self-contained command (a
//! pass-through heuristic skips translation when the text already looks like
//! one), sanitized, and executed in a persistent shell session. The envelope
//! carries the session token back so the caller can keep reusing the same
//! session; a dead or timed-out session comes back as a fresh token.

use super::{Envelope, Tool, arg_str, arg_u64};
use crate::llm::{CompletionParams, Llm};
use crate::sanitize::{EnvSnapshot, ShellFlavor};
use crate::session::SessionManager;
use crate::trace;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

/// Default per-command timeout in seconds.
pub const DEFAULT_TIMEOUT: u64 = 60;

/// Root facts shared between the workflow (writer) and the shell tool
/// (reader). Re-read before every command so fact updates propagate.
pub type SharedEnv = Arc<Mutex<EnvSnapshot>>;

pub struct RunInstruction {
    pub sessions: SessionManager,
    pub llm: Arc<dyn Llm>,
    pub env: SharedEnv,
}

/// Command-looking prefixes that skip LLM translation.
const COMMAND_PREFIXES: &[&str] = &[
    "$", "./", "git ", "pip", "python", "uv ", "poetry", "pdm", "conda", "pipenv", "cd ", "ls",
    "echo ", "mkdir ", "cat ", "export ", "source ", "bash ", "sh ", "make", "pytest", "cp ",
    "mv ", "touch ", "Get-", "Set-", "New-", "Remove-", "Test-", "Write-", "dir ", "if ",
    "foreach",
];

/// True when the text already reads as a shell command rather than intent.
pub fn looks_like_command(text: &str) -> bool {
    let t = text.trim();
    COMMAND_PREFIXES.iter().any(|p| t.starts_with(p))
}

fn translation_prompt(instruction: &str, cwd: &str, flavor: ShellFlavor) -> String {
    let (shell, path_rules) = match flavor {
        ShellFlavor::PowerShell => (
            "PowerShell on Windows",
            "- Build all paths from $env:REPO_ROOT, or $env:PROJECT_ROOT for project-scoped work; never emit disk-rooted absolute paths.\n\
             - Prefer Join-Path with -LiteralPath for file and directory arguments.\n\
             - For an editable install use: pip install -e $env:PROJECT_ROOT",
        ),
        ShellFlavor::Bash => (
            "bash on a POSIX host",
            "- Build all paths from \"$REPO_ROOT\", or \"$PROJECT_ROOT\" for project-scoped work; never emit absolute paths outside them.\n\
             - For an editable install use: pip install -e \"$PROJECT_ROOT\"",
        ),
    };
    format!(
        "You translate natural language into a single, self-contained shell command.\n\
         Rules:\n\
         - Output ONLY the command, no explanation, no surrounding quotes.\n\
         - Target shell: {shell}. Current directory: {cwd}.\n\
         - Do not use interactive tools (vim, nano, pagers).\n\
         - Keep the command simple, non-interactive, and safe.\n\
         {path_rules}\n\n\
         User request: {instruction}\n"
    )
}

/// Translate an instruction into a command, falling back to the raw text when
/// translation is unavailable or fails.
pub async fn translate(
    llm: &dyn Llm,
    instruction: &str,
    cwd: &str,
    flavor: ShellFlavor,
) -> String {
    if looks_like_command(instruction) {
        return instruction.trim().to_string();
    }
    let prompt = translation_prompt(instruction, cwd, flavor);
    match llm.complete(&prompt, CompletionParams::new(0.0, 300)).await {
        Ok(cmd) => {
            let cmd = cmd.trim();
            if cmd.is_empty() {
                instruction.trim().to_string()
            } else {
                // Models occasionally wrap the command in a code fence.
                cmd.trim_matches('`').trim().to_string()
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "translation failed, using raw instruction");
            instruction.trim().to_string()
        }
    }
}

#[async_trait]
impl Tool for RunInstruction {
    fn name(&self) -> &'static str {
        "run_instruction"
    }

    fn schema(&self) -> Value {
        json!({
            "intent": "what to do, in natural language (a literal command also works)",
            "timeout": "seconds, default 60",
            "session_token": "optional token of the session to reuse",
        })
    }

    async fn call(&self, args: Value) -> Envelope {
        let intent = arg_str(&args, "intent")
            .or_else(|| arg_str(&args, "nl_instruction"))
            .unwrap_or_default();
        let timeout = arg_u64(&args, "timeout", DEFAULT_TIMEOUT);
        let token = arg_str(&args, "session_token");

        let env = self.env.lock().map(|e| e.clone()).unwrap_or_default();
        trace::note("run_instruction_intent", &intent);

        let command = translate(
            self.llm.as_ref(),
            &intent,
            &env.repo_root,
            self.sessions.flavor(),
        )
        .await;
        trace::note("translated_command", &command);

        match self
            .sessions
            .run(token.as_deref(), &command, timeout, &env)
            .await
        {
            Ok((session_token, out)) => {
                let ok = out.exit_code == 0;
                let data = json!({
                    "exit_code": out.exit_code,
                    "stdout": out.stdout,
                    "command": out.command,
                    "start_dir": out.start_dir,
                    "end_dir": out.end_dir,
                    "timed_out": out.timed_out,
                    "session_token": session_token,
                });
                if ok {
                    Envelope::success(self.name(), data)
                } else if out.timed_out {
                    Envelope::failure(self.name(), data, "timeout")
                } else {
                    Envelope::failure(self.name(), data, "nonzero_exit")
                }
            }
            Err(e) => Envelope::failure(
                self.name(),
                json!({
                    "exit_code": 1,
                    "stdout": "",
                    "command": "",
                    "session_token": token,
                }),
                e,
            ),
        }
    }
}
