//! The fact store: canonical keys, placeholder expansion, and normalization.
//!
//! Facts are the only source of truth consulted by the planner and decider.
//! LLM-produced deltas arrive with inconsistent spellings (`repo_path`,
//! `clone_path`, `$env:REPO_ROOT\...` placeholders, relative paths), so every
//! merge runs the same migration + normalization pass: legacy keys map onto
//! canonical ones, placeholders expand to absolute paths, and derived keys
//! (`project_root` from `project_name`, `exec_root` from `repo_root`) are
//! filled in.

use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};

pub type Facts = Map<String, Value>;

pub const REPO_ROOT: &str = "repo_root";
pub const PROJECT_ROOT: &str = "project_root";
pub const PROJECT_NAME: &str = "project_name";
pub const EXEC_ROOT: &str = "exec_root";

/// Legacy key -> canonical key. The legacy key is removed on merge and only
/// fills the canonical slot when that slot is empty.
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("repo_path", REPO_ROOT),
    ("clone_path", PROJECT_ROOT),
    ("work_dir", EXEC_ROOT),
];

/// Expand workspace-root placeholders in a path string.
///
/// Handles `repo_root/...`, `$env:REPO_ROOT/...`, `%REPO_ROOT%/...`,
/// `$REPO_ROOT/...` and the bare placeholder forms, in either separator
/// style. A relative path is joined onto the root; an absolute path and an
/// empty root pass through untouched.
pub fn expand_root_placeholders(path: &str, repo_root: &str) -> String {
    let s = path.trim();
    let rr = repo_root.trim();
    if rr.is_empty() {
        return s.to_string();
    }
    if s.is_empty() {
        return rr.to_string();
    }

    let lowered = s.to_lowercase();
    if lowered.starts_with("repo_root/") || lowered.starts_with("repo_root\\") {
        return join(rr, &s["repo_root/".len()..]);
    }
    for prefix in [
        "$env:REPO_ROOT\\",
        "$env:REPO_ROOT/",
        "%REPO_ROOT%\\",
        "%REPO_ROOT%/",
        "${REPO_ROOT}/",
        "$REPO_ROOT/",
    ] {
        if s.starts_with(prefix) {
            return join(rr, &s[prefix.len()..]);
        }
    }
    if matches!(s, "repo_root" | "$env:REPO_ROOT" | "%REPO_ROOT%" | "$REPO_ROOT" | ".") {
        return rr.to_string();
    }
    if Path::new(s).is_absolute() {
        return s.to_string();
    }
    join(rr, s)
}

fn join(root: &str, tail: &str) -> String {
    let tail = tail.trim_start_matches(['/', '\\']);
    normalize_lexical(&Path::new(root).join(tail))
        .to_string_lossy()
        .into_owned()
}

/// Lexical path normalization: resolves `.` and `..` components without
/// touching the filesystem, so guards work for paths that do not exist yet.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Merge an observer delta into the fact map, migrating legacy keys.
///
/// Within one merge the delta is last-writer-wins per key; legacy synonyms
/// only fill canonical keys that are still empty.
pub fn merge_delta(facts: &mut Facts, delta: Facts) {
    for (k, v) in delta {
        facts.insert(k, v);
    }
    for (legacy, canonical) in LEGACY_KEYS {
        if let Some(v) = facts.remove(*legacy) {
            let vacant = facts
                .get(*canonical)
                .and_then(Value::as_str)
                .map(|s| s.trim().is_empty())
                .unwrap_or(true);
            if vacant {
                facts.insert((*canonical).to_string(), v);
            }
        }
    }
}

/// Normalize the canonical path facts in place.
///
/// - `repo_root` becomes absolute, falling back to `default_root`.
/// - `project_root` has placeholders expanded; when absent it is derived from
///   `project_name`, and otherwise left equal to the workspace root.
/// - `exec_root` defaults to `repo_root`.
pub fn normalize(facts: &mut Facts, default_root: &Path) {
    let repo_root = get_str(facts, REPO_ROOT)
        .map(str::to_string)
        .unwrap_or_else(|| default_root.to_string_lossy().into_owned());
    let repo_root_abs = if Path::new(&repo_root).is_absolute() {
        normalize_lexical(Path::new(&repo_root))
    } else {
        normalize_lexical(&default_root.join(&repo_root))
    };
    let repo_root_str = repo_root_abs.to_string_lossy().into_owned();
    facts.insert(REPO_ROOT.into(), Value::String(repo_root_str.clone()));

    let project_root_abs = match get_str(facts, PROJECT_ROOT).map(str::to_string) {
        Some(p) => expand_root_placeholders(&p, &repo_root_str),
        None => match get_str(facts, PROJECT_NAME) {
            Some(name) => join(&repo_root_str, &name.to_string()),
            None => repo_root_str.clone(),
        },
    };
    facts.insert(PROJECT_ROOT.into(), Value::String(project_root_abs));

    let exec_root = get_str(facts, EXEC_ROOT)
        .map(|s| expand_root_placeholders(&s.to_string(), &repo_root_str))
        .unwrap_or_else(|| repo_root_str.clone());
    facts.insert(EXEC_ROOT.into(), Value::String(exec_root));
}

/// Fetch a non-empty string fact.
pub fn get_str<'a>(facts: &'a Facts, key: &str) -> Option<&'a str> {
    facts
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
