//! Persistent shell sessions with marker-sentinel framing.
//!
//! Each session is a long-lived interactive shell subprocess (PowerShell on
//! Windows, bash elsewhere) with piped stdin/stdout. Commands are wrapped so
//! that stderr merges into stdout and a unique `__END_<uuid>:<code>` line
//! delimits the output and carries the exit code over the shared stream.
//! Working directory, environment variables, and shell state persist between
//! commands; `REPO_ROOT`/`PROJECT_ROOT` are re-asserted before every run so
//! fact updates propagate into the child.
//!
//! Timeouts are two-layered: a per-line read timeout (networked installs can
//! be silent for long stretches) and the caller's overall command timeout.
//! Breach of either tears the session down and yields a synthetic
//! `exit_code=124` result; the next run transparently opens a fresh session
//! and returns its new token.

use crate::output;
use crate::sanitize::{self, EnvSnapshot, ShellFlavor};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Maximum output lines kept per command. Prevents OOM from commands that
/// produce unbounded output.
const MAX_OUTPUT_LINES: usize = 100_000;

/// Per-line read timeout. Large clones and installs may be silent for long
/// stretches, so this is deliberately generous.
const READ_LINE_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for internal probes (pwd, env sync).
const PROBE_TIMEOUT: u64 = 10;

/// Marker prefix for the end-of-command sentinel.
const MARKER_PREFIX: &str = "__END_";

/// Result of one command executed through [`SessionManager::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    /// The command actually executed, after sanitization.
    pub command: String,
    pub start_dir: String,
    pub end_dir: String,
    pub timed_out: bool,
}

struct ExecOutcome {
    exit_code: i32,
    lines: Vec<String>,
    timed_out: bool,
}

/// One persistent shell subprocess.
struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    flavor: ShellFlavor,
}

impl ShellSession {
    async fn spawn(cwd: &Path, env: &EnvSnapshot, flavor: ShellFlavor) -> Result<Self, String> {
        let mut cmd = match flavor {
            ShellFlavor::Bash => {
                let mut c = Command::new("/bin/bash");
                c.arg("--norc").arg("--noprofile");
                c
            }
            ShellFlavor::PowerShell => {
                let mut c = Command::new("powershell");
                c.args(["-NoProfile", "-NoExit", "-Command", "-"]);
                c
            }
        };
        cmd.current_dir(cwd)
            .env("REPO_ROOT", &env.repo_root)
            .env(
                "PROJECT_ROOT",
                env.project_root.as_deref().unwrap_or(&env.repo_root),
            )
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // New process group so teardown can kill the whole tree.
        // SAFETY: pre_exec runs between fork and exec in the child.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn shell: {e}"))?;
        let stdin = child.stdin.take().ok_or("shell stdin was not piped")?;
        let stdout = child.stdout.take().ok_or("shell stdout was not piped")?;

        // The shell's own stderr (wrapper parse errors and the like) is
        // drained in the background so the pipe can never fill and block the
        // child. Command stderr is merged into stdout by the wrapper.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "setupsh::session", stderr = %line);
                }
            });
        }

        let mut session = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            flavor,
        };

        // Null prompt, merged streams, and a cd to the workspace root. The
        // init drain below swallows any startup output.
        let init = match flavor {
            ShellFlavor::Bash => {
                "exec 2>&1\nPS1=''; PS2=''; PROMPT_COMMAND=''\ncd \"$REPO_ROOT\"\n".to_string()
            }
            ShellFlavor::PowerShell => {
                "function prompt {''}\n$ErrorActionPreference='Continue'\nSet-Location -LiteralPath $env:REPO_ROOT\n"
                    .to_string()
            }
        };
        session.raw_send(&init).await?;
        session.drain_startup().await;

        Ok(session)
    }

    async fn raw_send(&mut self, text: &str) -> Result<(), String> {
        self.stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| format!("failed to write to shell stdin: {e}"))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("failed to flush shell stdin: {e}"))
    }

    /// Swallow startup output by echoing a sentinel and reading up to it,
    /// bounded by a short total timeout so a broken shell cannot hang us.
    async fn drain_startup(&mut self) {
        let marker = format!("{MARKER_PREFIX}init_{}", uuid::Uuid::new_v4().simple());
        let echo = match self.flavor {
            ShellFlavor::Bash => format!("echo {marker}\n"),
            ShellFlavor::PowerShell => format!("Write-Output '{marker}'\n"),
        };
        if self.raw_send(&echo).await.is_err() {
            return;
        }
        let reader = &mut self.stdout;
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if clean_line(&line).contains(&marker) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .await;
    }

    /// Execute one wrapped command and read until its sentinel.
    async fn exec(&mut self, command: &str, timeout: u64) -> Result<ExecOutcome, String> {
        let marker = format!("{MARKER_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let wrapper = match self.flavor {
            ShellFlavor::Bash => {
                format!("{{ {command}; }} 2>&1; __setupsh_ec=$?; echo \"{marker}:$__setupsh_ec\"\n")
            }
            ShellFlavor::PowerShell => format!(
                "$ErrorActionPreference='Continue'; {command} 2>&1 | Out-Host; \
                 $code = if ($LASTEXITCODE -ne $null) {{ $LASTEXITCODE }} else {{ if ($?) {{ 0 }} else {{ 1 }} }}; \
                 Write-Output \"{marker}:$code\" | Out-Host\n"
            ),
        };
        self.raw_send(&wrapper).await?;

        let deadline = Instant::now() + Duration::from_secs(timeout.max(1));
        let mut lines: Vec<String> = Vec::new();
        let mut line = String::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ExecOutcome {
                    exit_code: 124,
                    lines,
                    timed_out: true,
                });
            }
            let read_timeout = remaining.min(READ_LINE_TIMEOUT);

            line.clear();
            match tokio::time::timeout(read_timeout, self.stdout.read_line(&mut line)).await {
                Ok(Ok(0)) => return Err("shell process exited unexpectedly".to_string()),
                Ok(Ok(_)) => {
                    let cleaned = clean_line(&line);
                    if let Some(pos) = cleaned.find(&marker) {
                        let code = cleaned[pos + marker.len()..]
                            .trim_start_matches(':')
                            .trim()
                            .parse::<i32>()
                            .unwrap_or(-1);
                        return Ok(ExecOutcome {
                            exit_code: code,
                            lines,
                            timed_out: false,
                        });
                    }
                    if cleaned.contains(MARKER_PREFIX) {
                        continue;
                    }
                    if lines.len() < MAX_OUTPUT_LINES {
                        lines.push(cleaned);
                    }
                }
                Ok(Err(e)) => return Err(format!("error reading shell output: {e}")),
                Err(_) => {
                    // Per-line or overall timeout; the caller tears us down.
                    return Ok(ExecOutcome {
                        exit_code: 124,
                        lines,
                        timed_out: true,
                    });
                }
            }
        }
    }

    /// Current working directory of the shell, best effort.
    async fn pwd(&mut self) -> String {
        let probe = match self.flavor {
            ShellFlavor::Bash => "pwd",
            ShellFlavor::PowerShell => "Get-Location | Select-Object -ExpandProperty Path",
        };
        match self.exec(probe, PROBE_TIMEOUT).await {
            Ok(out) if !out.timed_out => out
                .lines
                .iter()
                .rev()
                .find(|l| !l.trim().is_empty())
                .cloned()
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Re-assert the root variables inside the session.
    async fn sync_env(&mut self, env: &EnvSnapshot) {
        let project = env.project_root.as_deref().unwrap_or(&env.repo_root);
        let script = match self.flavor {
            ShellFlavor::Bash => format!(
                "export REPO_ROOT='{}'; export PROJECT_ROOT='{}'",
                shq(&env.repo_root),
                shq(project)
            ),
            ShellFlavor::PowerShell => format!(
                "$env:REPO_ROOT = '{}'; $env:PROJECT_ROOT = '{}'",
                psq(&env.repo_root),
                psq(project)
            ),
        };
        if let Err(e) = self.exec(&script, PROBE_TIMEOUT).await {
            tracing::debug!(error = %e, "env sync failed");
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the whole process group, then the child itself.
    async fn teardown(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(-(pid as i32)),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await;
    }

    /// Graceful close: ask the shell to exit, then drop the pipes (which
    /// unblocks a shell waiting on stdin) and fall back to a kill.
    async fn close(mut self) {
        let _ = self.raw_send("exit\n").await;
        let ShellSession {
            mut child,
            stdin,
            stdout,
            ..
        } = self;
        drop(stdin);
        drop(stdout);
        if tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
        }
    }
}

/// Single-quote escaping for bash.
fn shq(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Single-quote escaping for PowerShell.
fn psq(s: &str) -> String {
    s.replace('\'', "''")
}

/// Strip ANSI noise and trailing line endings from one raw line.
fn clean_line(raw: &str) -> String {
    output::strip_ansi(raw)
        .trim_end_matches('\n')
        .trim_end_matches('\r')
        .to_string()
}

/// Owner of all shell sessions, keyed by opaque token.
///
/// The map-level mutex serializes commands: one command at a time per
/// process, which also guarantees one at a time per session.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, ShellSession>>>,
    work_root: PathBuf,
    flavor: ShellFlavor,
}

impl SessionManager {
    pub fn new(work_root: PathBuf) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            work_root,
            flavor: ShellFlavor::host(),
        }
    }

    pub fn flavor(&self) -> ShellFlavor {
        self.flavor
    }

    /// Open a fresh session anchored at the workspace root.
    pub async fn open(&self, env: &EnvSnapshot) -> Result<String, String> {
        let session = ShellSession::spawn(&self.work_root, env, self.flavor).await?;
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.lock().await.insert(token.clone(), session);
        Ok(token)
    }

    /// Close a session. Idempotent: closing an unknown token is a no-op.
    pub async fn close(&self, token: &str) {
        if let Some(session) = self.sessions.lock().await.remove(token) {
            session.close().await;
        }
    }

    /// Re-assert `REPO_ROOT`/`PROJECT_ROOT` inside an open session.
    ///
    /// `run` does this automatically before every command; this entry point
    /// exists for callers that mutate the facts between commands and want the
    /// session updated eagerly.
    pub async fn sync_env(&self, token: &str, env: &EnvSnapshot) -> Result<(), String> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(token)
            .ok_or_else(|| format!("no session with token '{token}'"))?;
        session.sync_env(env).await;
        Ok(())
    }

    /// Close every session (graph shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in drained {
            session.close().await;
        }
    }

    /// Execute a raw command in the session identified by `token`.
    ///
    /// A missing or dead session is replaced transparently; the returned
    /// token identifies the session that actually ran the command. The
    /// command is validated against the destructive-command guard and
    /// sanitized before execution; start/end directories are captured around
    /// it. Timeout breach tears the session down and returns the synthetic
    /// `exit_code=124` outcome.
    pub async fn run(
        &self,
        token: Option<&str>,
        raw_command: &str,
        timeout: u64,
        env: &EnvSnapshot,
    ) -> Result<(String, RunOutcome), String> {
        let mut sessions = self.sessions.lock().await;

        // Resolve or replace the session.
        let current = match token {
            Some(t) if sessions.get_mut(t).map(|s| s.is_alive()).unwrap_or(false) => t.to_string(),
            stale => {
                if let Some(t) = stale {
                    if let Some(dead) = sessions.remove(t) {
                        dead.teardown().await;
                    }
                }
                let session = ShellSession::spawn(&self.work_root, env, self.flavor).await?;
                let fresh = uuid::Uuid::new_v4().simple().to_string();
                sessions.insert(fresh.clone(), session);
                fresh
            }
        };

        // Refuse destructive commands before they ever reach the shell.
        if let Err(reason) = sanitize::validate_command(raw_command) {
            tracing::warn!(command = %raw_command, reason = %reason, "destructive command refused");
            return Ok((
                current,
                RunOutcome {
                    exit_code: -1,
                    stdout: reason,
                    command: raw_command.to_string(),
                    start_dir: String::new(),
                    end_dir: String::new(),
                    timed_out: false,
                },
            ));
        }

        let session = sessions.get_mut(&current).ok_or("session vanished")?;
        let start_dir = session.pwd().await;
        session.sync_env(env).await;

        let command = sanitize::sanitize(raw_command, env, self.flavor);
        tracing::debug!(raw = %raw_command, sanitized = %command, "running command");

        let outcome = session.exec(&command, timeout).await;

        match outcome {
            Ok(out) if out.timed_out => {
                if let Some(dead) = sessions.remove(&current) {
                    dead.teardown().await;
                }
                Ok((
                    current,
                    RunOutcome {
                        exit_code: 124,
                        stdout: format!("Timed out after {timeout}s"),
                        command,
                        start_dir: start_dir.clone(),
                        end_dir: start_dir,
                        timed_out: true,
                    },
                ))
            }
            Ok(out) => {
                let end_dir = session.pwd().await;
                Ok((
                    current,
                    RunOutcome {
                        exit_code: out.exit_code,
                        stdout: out.lines.join("\n"),
                        command,
                        start_dir,
                        end_dir,
                        timed_out: false,
                    },
                ))
            }
            Err(e) => {
                // The shell died mid-command; drop it so the next run starts
                // fresh.
                if let Some(dead) = sessions.remove(&current) {
                    dead.teardown().await;
                }
                Err(e)
            }
        }
    }
}
