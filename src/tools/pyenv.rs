//! Python environment probes: interpreters, installer tooling, pyproject
//! parsing, and the deterministic installer-selection rule.

use super::{Envelope, Tool, ToolContext, arg_str, arg_str_list, internal_error, resolve_guard};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

/// Timeout for version probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Installer names probed by default.
const INSTALLER_TOOLS: &[&str] = &["uv", "poetry", "pdm", "pip", "conda", "pipenv"];

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+\.\d+(?:\.\d+)?\b").expect("version regex"));

/// Run a probe command, capturing merged output. Never errors: failures come
/// back as a nonzero code with the message in the output.
async fn run_probe(program: &Path, args: &[&str]) -> (i32, String) {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let fut = async {
        match cmd.output().await {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if text.is_empty() {
                    text = String::from_utf8_lossy(&out.stderr).trim().to_string();
                }
                (out.status.code().unwrap_or(-1), text)
            }
            Err(e) => (1, format!("{}: {e}", "IoError")),
        }
    };
    match tokio::time::timeout(PROBE_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => (124, "probe timed out".to_string()),
    }
}

/// First `X.Y[.Z]` looking token in probe output, else the first line.
fn extract_version(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    VERSION_RE
        .find(text)
        .map(|m| m.as_str().to_string())
        .or_else(|| text.lines().next().map(|l| l.trim().to_string()))
}

/// Presence/version of one executable.
#[derive(Debug, Clone)]
pub struct ToolProbe {
    pub exists: bool,
    pub path: Option<String>,
    pub version: Option<String>,
}

/// Probed availability of installer executables, keyed by name.
///
/// Kept as its own type so the installer-selection rule can be driven by a
/// synthetic map in tests instead of the host's PATH.
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability(pub BTreeMap<String, ToolProbe>);

impl ToolAvailability {
    pub fn has(&self, name: &str) -> bool {
        self.0.get(name).map(|p| p.exists).unwrap_or(false)
    }

    /// Build an availability map claiming the given tools exist (tests).
    pub fn assume(names: &[&str]) -> Self {
        let mut map = BTreeMap::new();
        for n in names {
            map.insert(
                n.to_string(),
                ToolProbe {
                    exists: true,
                    path: Some(format!("/usr/bin/{n}")),
                    version: None,
                },
            );
        }
        Self(map)
    }

    /// Probe the host PATH for the given executables.
    pub async fn probe(names: &[&str]) -> Self {
        let mut map = BTreeMap::new();
        for name in names {
            let Some(path) = which::which(name).ok() else {
                map.insert(
                    name.to_string(),
                    ToolProbe {
                        exists: false,
                        path: None,
                        version: None,
                    },
                );
                continue;
            };
            let (_, out) = run_probe(&path, &["--version"]).await;
            map.insert(
                name.to_string(),
                ToolProbe {
                    exists: true,
                    path: Some(path.to_string_lossy().into_owned()),
                    version: extract_version(&out),
                },
            );
        }
        Self(map)
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for (name, probe) in &self.0 {
            let entry = if probe.exists {
                json!({"exists": true, "path": probe.path, "version": probe.version})
            } else {
                json!({"exists": false})
            };
            obj.insert(name.clone(), entry);
        }
        Value::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// pyenv_python_info
// ---------------------------------------------------------------------------

pub struct PythonInfo(pub ToolContext);

#[async_trait]
impl Tool for PythonInfo {
    fn name(&self) -> &'static str {
        "pyenv_python_info"
    }

    fn schema(&self) -> Value {
        json!({})
    }

    async fn call(&self, _args: Value) -> Envelope {
        let mut candidates: Vec<Value> = Vec::new();
        let mut seen: Vec<PathBuf> = Vec::new();

        for name in ["python3", "python"] {
            for path in which::which_all(name).map(|it| it.collect::<Vec<_>>()).unwrap_or_default() {
                if seen.contains(&path) {
                    continue;
                }
                let (_, out) = run_probe(&path, &["--version"]).await;
                candidates.push(json!({
                    "path": path.to_string_lossy(),
                    "version": extract_version(&out),
                }));
                seen.push(path);
            }
        }

        // The Windows launcher enumerates extra interpreters when present.
        let mut launcher = json!({});
        if let Ok(py) = which::which("py") {
            let (code, out) = run_probe(&py, &["-0p"]).await;
            if code == 0 && !out.is_empty() {
                let paths: Vec<String> = out
                    .lines()
                    .filter_map(|l| l.rsplit_once(':').map(|(_, p)| p.trim().to_string()))
                    .filter(|p| !p.is_empty())
                    .collect();
                launcher = json!({"paths": paths});
            } else if !out.is_empty() {
                launcher = json!({"error": out});
            }
        }

        let active = candidates.first().cloned().unwrap_or(Value::Null);
        let executable = active.get("path").cloned().unwrap_or(Value::Null);
        let version = active.get("version").cloned().unwrap_or(Value::Null);
        Envelope::success(
            self.name(),
            json!({
                "active": active,
                "candidates": candidates,
                "launcher": launcher,
                "executable": executable,
                "version": version,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// pyenv_tool_versions
// ---------------------------------------------------------------------------

pub struct ToolVersions(pub ToolContext);

#[async_trait]
impl Tool for ToolVersions {
    fn name(&self) -> &'static str {
        "pyenv_tool_versions"
    }

    fn schema(&self) -> Value {
        json!({"tools": "executable names to probe, e.g. [\"uv\", \"pip\"]"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let requested = arg_str_list(&args, "tools");
        let names: Vec<&str> = if requested.is_empty() {
            INSTALLER_TOOLS.to_vec()
        } else {
            requested.iter().map(String::as_str).collect()
        };
        let avail = ToolAvailability::probe(&names).await;
        Envelope::success(self.name(), json!({"tools": avail.to_json()}))
    }
}

// ---------------------------------------------------------------------------
// pyenv_parse_pyproject
// ---------------------------------------------------------------------------

pub struct ParsePyproject(pub ToolContext);

/// Convert a TOML value into JSON for the envelope.
fn toml_to_json(v: &toml::Value) -> Value {
    match v {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => json!(i),
        toml::Value::Float(f) => json!(f),
        toml::Value::Boolean(b) => json!(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(t) => {
            Value::Object(t.iter().map(|(k, v)| (k.clone(), toml_to_json(v))).collect())
        }
    }
}

#[async_trait]
impl Tool for ParsePyproject {
    fn name(&self) -> &'static str {
        "pyenv_parse_pyproject"
    }

    fn schema(&self) -> Value {
        json!({"pyproject_path": "path to pyproject.toml; defaults to the workspace root"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "pyproject_path").unwrap_or_else(|| "pyproject.toml".into());
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"path": raw, "exists": false}), kind);
            }
        };
        if !p.exists() {
            return Envelope::success(
                self.name(),
                json!({"path": p.to_string_lossy(), "exists": false}),
            );
        }

        let text = match std::fs::read_to_string(&p) {
            Ok(t) => t,
            Err(e) => {
                return Envelope::failure(
                    self.name(),
                    json!({"path": p.to_string_lossy(), "exists": true}),
                    internal_error(&e, "IoError"),
                );
            }
        };
        let doc: toml::Value = match text.parse() {
            Ok(d) => d,
            Err(e) => {
                return Envelope::failure(
                    self.name(),
                    json!({"path": p.to_string_lossy(), "exists": true}),
                    internal_error(&e, "parse_error"),
                );
            }
        };

        let backend = doc
            .get("build-system")
            .and_then(|b| b.get("build-backend"))
            .and_then(toml::Value::as_str);
        let project = doc.get("project").and_then(toml::Value::as_table);
        let dependencies: Vec<Value> = project
            .and_then(|p| p.get("dependencies"))
            .and_then(toml::Value::as_array)
            .map(|a| a.iter().map(toml_to_json).collect())
            .unwrap_or_default();
        let optional = project
            .and_then(|p| p.get("optional-dependencies"))
            .map(toml_to_json)
            .unwrap_or_else(|| json!({}));
        let scripts = project
            .and_then(|p| p.get("scripts"))
            .map(toml_to_json)
            .unwrap_or_else(|| json!({}));
        let tool_section = doc.get("tool").and_then(toml::Value::as_table);
        let has_tool = |name: &str| tool_section.map(|t| t.contains_key(name)).unwrap_or(false);

        Envelope::success(
            self.name(),
            json!({
                "path": p.to_string_lossy(),
                "exists": true,
                "backend": backend,
                "project_name": project.and_then(|p| p.get("name")).and_then(toml::Value::as_str),
                "project_version": project.and_then(|p| p.get("version")).and_then(toml::Value::as_str),
                "has_dependencies": !dependencies.is_empty(),
                "dependencies": dependencies,
                "optional_dependencies": optional,
                "scripts": scripts,
                "has_poetry_section": has_tool("poetry"),
                "has_pdm_section": has_tool("pdm"),
                "has_uv_section": has_tool("uv"),
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// pyenv_select_installer
// ---------------------------------------------------------------------------

/// File and pyproject evidence the selection rule runs on.
#[derive(Debug, Clone, Default)]
pub struct InstallerEvidence {
    pub poetry_lock: bool,
    pub pdm_lock: bool,
    pub uv_lock: bool,
    pub requirements: bool,
    pub conda_env: bool,
    pub uv_declared: bool,
    pub poetry_declared: bool,
    pub pdm_declared: bool,
    pub pyproject_has_deps: bool,
    pub build_backend: Option<String>,
}

impl InstallerEvidence {
    /// Collect evidence from files under the project root.
    pub fn gather(root: &Path) -> Self {
        let exists = |name: &str| root.join(name).exists();
        let mut ev = Self {
            poetry_lock: exists("poetry.lock"),
            pdm_lock: exists("pdm.lock") || exists("pdm.lock.json") || exists("pdm.lock.yml"),
            uv_lock: exists("uv.lock"),
            requirements: ["requirements.txt", "requirements.in", "requirements-dev.txt"]
                .iter()
                .any(|&n| exists(n)),
            conda_env: exists("environment.yml") || exists("environment.yaml"),
            ..Self::default()
        };
        if let Ok(text) = std::fs::read_to_string(root.join("pyproject.toml")) {
            if let Ok(doc) = text.parse::<toml::Value>() {
                let tools = doc.get("tool").and_then(toml::Value::as_table);
                let declared = |name: &str| tools.map(|t| t.contains_key(name)).unwrap_or(false);
                ev.uv_declared = declared("uv");
                ev.poetry_declared = declared("poetry");
                ev.pdm_declared = declared("pdm");
                ev.pyproject_has_deps = doc
                    .get("project")
                    .and_then(|p| p.get("dependencies"))
                    .and_then(toml::Value::as_array)
                    .map(|a| !a.is_empty())
                    .unwrap_or(false);
                ev.build_backend = doc
                    .get("build-system")
                    .and_then(|b| b.get("build-backend"))
                    .and_then(toml::Value::as_str)
                    .map(str::to_string);
            }
        }
        ev
    }

    pub fn to_json(&self) -> Value {
        json!({
            "poetry_lock": self.poetry_lock,
            "pdm_lock": self.pdm_lock,
            "uv_lock": self.uv_lock,
            "requirements": self.requirements,
            "conda_env": self.conda_env,
            "tool_declared": {
                "uv": self.uv_declared,
                "poetry": self.poetry_declared,
                "pdm": self.pdm_declared,
            },
            "build_backend": self.build_backend,
        })
    }
}

/// Deterministic installer selection: declared tool + lock file + host
/// availability, in fixed precedence. No LLM involvement.
pub fn choose_installer(ev: &InstallerEvidence, avail: &ToolAvailability) -> (String, String) {
    let mut reasons: Vec<String> = Vec::new();
    let mut installer = "none";

    if ev.uv_declared || ev.uv_lock {
        if avail.has("uv") {
            installer = "uv";
            reasons.push("tool.uv or uv.lock present and uv is available".into());
        } else {
            reasons.push("uv is indicated but not installed".into());
        }
    } else if ev.poetry_declared || ev.poetry_lock {
        if avail.has("poetry") {
            installer = "poetry";
            reasons.push("tool.poetry or poetry.lock present and poetry is available".into());
        } else {
            reasons.push("poetry is indicated but not installed".into());
        }
    } else if ev.pdm_declared || ev.pdm_lock {
        if avail.has("pdm") {
            installer = "pdm";
            reasons.push("tool.pdm or pdm.lock present and pdm is available".into());
        } else {
            reasons.push("pdm is indicated but not installed".into());
        }
    } else if ev.conda_env && avail.has("conda") {
        installer = "conda";
        reasons.push("environment.yml present and conda is available".into());
    } else if ev.requirements {
        if avail.has("uv") {
            installer = "uv";
            reasons.push("requirements file present, preferring uv".into());
        } else if avail.has("pip") {
            installer = "pip";
            reasons.push("requirements file present, using pip".into());
        }
    } else if ev.pyproject_has_deps {
        if avail.has("uv") {
            installer = "uv";
            reasons.push("pyproject declares dependencies and uv is available".into());
        } else if avail.has("pip") {
            installer = "pip";
            reasons.push("pyproject declares dependencies, using pip".into());
        }
    }

    if reasons.is_empty() {
        reasons.push("no clear evidence, returning none".into());
    }
    (installer.to_string(), reasons.join("; "))
}

pub struct SelectInstaller(pub ToolContext);

#[async_trait]
impl Tool for SelectInstaller {
    fn name(&self) -> &'static str {
        "pyenv_select_installer"
    }

    fn schema(&self) -> Value {
        json!({"project_root": "project directory; defaults to the workspace root"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let root = match arg_str(&args, "project_root") {
            Some(raw) => match resolve_guard(&self.0.work_root, &raw) {
                Ok(p) => p,
                Err(kind) => {
                    return Envelope::failure(self.name(), json!({"installer": "none"}), kind);
                }
            },
            None => self.0.work_root.clone(),
        };

        let evidence = InstallerEvidence::gather(&root);
        let avail = ToolAvailability::probe(INSTALLER_TOOLS).await;
        let (installer, reason) = choose_installer(&evidence, &avail);

        let mut evidence_json = evidence.to_json();
        if let Some(obj) = evidence_json.as_object_mut() {
            obj.insert("tools".into(), avail.to_json());
            obj.insert(
                "pyproject".into(),
                json!(root.join("pyproject.toml").to_string_lossy()),
            );
        }
        Envelope::success(
            self.name(),
            json!({
                "installer": installer,
                "reason": reason,
                "evidence": evidence_json,
            }),
        )
    }
}
