//! Tool infrastructure: the uniform envelope, the `Tool` trait, the registry,
//! and workspace path containment.
//!
//! Every tool returns the same JSON envelope `{ok, tool, data, error?}` with
//! stable error-kind strings; tools never panic across this boundary and
//! never surface raw errors. All path arguments resolve against the workspace
//! root and are rejected with `path_out_of_root` when they escape it, whether
//! by `..` traversal or through a symlink.

pub mod fs;
pub mod git;
pub mod pyenv;
pub mod shell;

use crate::facts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Uniform tool response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    pub tool: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn success(tool: &str, data: Value) -> Self {
        Self {
            ok: true,
            tool: tool.to_string(),
            data,
            error: None,
        }
    }

    pub fn failure(tool: &str, data: Value, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            tool: tool.to_string(),
            data,
            error: Some(error.into()),
        }
    }

    /// Fetch a field out of `data`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Stable error kind for an unexpected tool-internal failure.
pub fn internal_error(e: &dyn std::fmt::Display, kind: &str) -> String {
    format!("{kind}: {e}")
}

/// A named capability with a JSON-argument calling convention.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    /// One-line argument summary shown to the decider LLM.
    fn schema(&self) -> Value;
    async fn call(&self, args: Value) -> Envelope;
}

/// Shared context handed to tools at construction time.
///
/// Process-wide resources (workspace root, session manager, LLM handle) are
/// threaded through explicitly rather than read from hidden globals.
#[derive(Clone)]
pub struct ToolContext {
    pub work_root: PathBuf,
}

/// Name-keyed set of tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Sorted tool names, for prompts and whitelists.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Dispatch a call by name. Unknown names come back as a failure
    /// envelope rather than an error, so the observer can route on it.
    pub async fn call(&self, name: &str, args: Value) -> Envelope {
        match self.get(name) {
            Some(tool) => tool.call(args).await,
            None => Envelope::failure(name, Value::Object(Map::new()), "unknown_tool"),
        }
    }
}

// ---------------------------------------------------------------------------
// Path containment
// ---------------------------------------------------------------------------

/// Resolve a raw path argument safely within the workspace root.
///
/// Placeholders (`repo_root/...`, `$env:REPO_ROOT/...`) are expanded first;
/// relative paths are joined onto the root. The result is canonicalized when
/// it exists (so symlinks cannot escape) and lexically normalized otherwise,
/// then checked to be the root or a descendant of it.
pub fn resolve_guard(root: &Path, raw: &str) -> Result<PathBuf, &'static str> {
    let root_str = root.to_string_lossy();
    let expanded = facts::expand_root_placeholders(raw, &root_str);

    let joined = {
        let p = Path::new(&expanded);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };

    let canonical_root = root.canonicalize().map_err(|_| "resolve_error")?;
    let resolved = match joined.canonicalize() {
        Ok(p) => p,
        // The target may not exist yet (e.g. a clone destination); fall back
        // to lexical normalization, which still defuses `..` traversal.
        Err(_) => facts::normalize_lexical(&joined),
    };

    if resolved == canonical_root || resolved.starts_with(&canonical_root) {
        Ok(resolved)
    } else {
        Err("path_out_of_root")
    }
}

/// String argument helper: missing and null both read as `None`.
pub fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn arg_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn arg_u64(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key).and_then(Value::as_u64).unwrap_or(default)
}

pub fn arg_str_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
