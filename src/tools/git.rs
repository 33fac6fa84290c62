//! Git helpers: repository status and idempotent clone-into-workspace.

use super::{Envelope, Tool, ToolContext, arg_bool, arg_str, arg_u64, resolve_guard};
use crate::sanitize::repo_name_from_url;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Timeout for quick status probes.
const STATUS_TIMEOUT: Duration = Duration::from_secs(8);

/// Timeout for a clone.
const CLONE_TIMEOUT: Duration = Duration::from_secs(900);

async fn run_git(args: &[&str], cwd: Option<&Path>, timeout: Duration) -> (i32, String, String) {
    let mut cmd = tokio::process::Command::new("git");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let fut = async {
        match cmd.output().await {
            Ok(out) => (
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stdout).trim().to_string(),
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ),
            Err(e) => (1, String::new(), format!("IoError: {e}")),
        }
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => (124, String::new(), "git timed out".to_string()),
    }
}

async fn git_available() -> bool {
    run_git(&["--version"], None, STATUS_TIMEOUT).await.0 == 0
}

async fn is_git_repo(path: &Path) -> bool {
    let (code, out, _) = run_git(
        &["-C", &path.to_string_lossy(), "rev-parse", "--is-inside-work-tree"],
        None,
        STATUS_TIMEOUT,
    )
    .await;
    code == 0 && out.eq_ignore_ascii_case("true")
}

async fn origin_url(path: &Path) -> Option<String> {
    let (code, out, _) = run_git(
        &["-C", &path.to_string_lossy(), "remote", "get-url", "origin"],
        None,
        STATUS_TIMEOUT,
    )
    .await;
    (code == 0 && !out.is_empty()).then_some(out)
}

async fn current_branch(path: &Path) -> Option<String> {
    let (code, out, _) = run_git(
        &["-C", &path.to_string_lossy(), "rev-parse", "--abbrev-ref", "HEAD"],
        None,
        STATUS_TIMEOUT,
    )
    .await;
    if code == 0 && !out.is_empty() && out != "HEAD" {
        Some(out)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// git_repo_status
// ---------------------------------------------------------------------------

pub struct GitRepoStatus(pub ToolContext);

#[async_trait]
impl Tool for GitRepoStatus {
    fn name(&self) -> &'static str {
        "git_repo_status"
    }

    fn schema(&self) -> Value {
        json!({"path": "directory to inspect; defaults to the workspace root"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_else(|| ".".into());
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => return Envelope::failure(self.name(), json!({"path": raw}), kind),
        };
        if !git_available().await {
            return Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy()}),
                "git_not_available",
            );
        }

        let is_repo = is_git_repo(&p).await;
        let origin = if is_repo { origin_url(&p).await } else { None };
        let branch = if is_repo { current_branch(&p).await } else { None };
        Envelope::success(
            self.name(),
            json!({
                "path": p.to_string_lossy(),
                "is_repo": is_repo,
                "origin_url": origin,
                "branch": branch,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// git_ensure_cloned
// ---------------------------------------------------------------------------

pub struct GitEnsureCloned(pub ToolContext);

impl GitEnsureCloned {
    /// Resolve the clone destination. `.`, an empty dest, and the workspace
    /// root itself all fall back to `<root>/<repo-name>` so a clone can never
    /// collide with the root.
    fn resolve_dest(&self, dest: Option<&str>, repo_name: &str) -> Result<PathBuf, &'static str> {
        let default = || self.0.work_root.join(repo_name);
        let Some(dest) = dest else {
            return Ok(default());
        };
        let trimmed = dest.trim();
        if matches!(trimmed, "" | "." | "./") {
            return Ok(default());
        }
        let p = resolve_guard(&self.0.work_root, trimmed)?;
        let root = self
            .0
            .work_root
            .canonicalize()
            .unwrap_or_else(|_| self.0.work_root.clone());
        if p == root {
            return Ok(default());
        }
        Ok(p)
    }
}

#[async_trait]
impl Tool for GitEnsureCloned {
    fn name(&self) -> &'static str {
        "git_ensure_cloned"
    }

    fn schema(&self) -> Value {
        json!({
            "url": "repository URL",
            "dest": "optional target directory (omit for <root>/<repo-name>)",
            "depth": "shallow clone depth, default 1",
            "sparse": "bool, minimize transferred blobs, default true",
            "branch": "optional branch",
        })
    }

    async fn call(&self, args: Value) -> Envelope {
        let Some(url) = arg_str(&args, "url") else {
            return Envelope::failure(self.name(), json!({"url": ""}), "invalid_url");
        };
        if !git_available().await {
            return Envelope::failure(self.name(), json!({"url": url}), "git_not_available");
        }

        let repo_name = repo_name_from_url(&url);
        let dest = arg_str(&args, "dest");
        let target = match self.resolve_dest(dest.as_deref(), &repo_name) {
            Ok(t) => t,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"url": url, "dest": dest}), kind);
            }
        };

        let work_root = self.0.work_root.to_string_lossy().into_owned();

        // Existing target: never clone over it, whatever it contains. The
        // caller decides what to do with a non-repo directory.
        if target.exists() {
            let is_repo = is_git_repo(&target).await;
            let origin = if is_repo { origin_url(&target).await } else { None };
            let branch = if is_repo { current_branch(&target).await } else { None };
            return Envelope::success(
                self.name(),
                json!({
                    "existed": true,
                    "cloned": false,
                    "repo_root": work_root,
                    "project_root": target.to_string_lossy(),
                    "project_name": repo_name,
                    "remote_url": origin.unwrap_or_else(|| url.clone()),
                    "branch": branch,
                    "is_repo": is_repo,
                }),
            );
        }

        let depth = arg_u64(&args, "depth", 1);
        let sparse = arg_bool(&args, "sparse", true);
        let branch = arg_str(&args, "branch");

        let depth_s = depth.to_string();
        let target_s = target.to_string_lossy().into_owned();
        let mut cli: Vec<&str> = vec!["clone"];
        if depth > 0 {
            cli.extend(["--depth", depth_s.as_str()]);
        }
        if sparse {
            cli.push("--filter=blob:none");
        }
        if let Some(b) = branch.as_deref() {
            cli.extend(["-b", b]);
        }
        cli.push(url.as_str());
        cli.push(target_s.as_str());

        let (code, stdout, stderr) = run_git(&cli, Some(&self.0.work_root), CLONE_TIMEOUT).await;
        if code != 0 {
            return Envelope::failure(
                self.name(),
                json!({
                    "existed": false,
                    "cloned": false,
                    "repo_root": work_root,
                    "project_root": target_s,
                    "project_name": repo_name,
                    "remote_url": url,
                    "branch": Value::Null,
                    "stdout": stdout,
                    "stderr": stderr,
                }),
                "git_clone_failed",
            );
        }

        let is_repo = is_git_repo(&target).await;
        let origin = origin_url(&target).await;
        let branch_now = current_branch(&target).await;
        Envelope::success(
            self.name(),
            json!({
                "existed": false,
                "cloned": true,
                "repo_root": work_root,
                "project_root": target_s,
                "project_name": repo_name,
                "remote_url": origin.unwrap_or(url),
                "branch": branch_now,
                "is_repo": is_repo,
                "stdout": stdout,
                "stderr": stderr,
            }),
        )
    }
}
