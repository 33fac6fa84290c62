//! Tests for fact normalization, placeholder expansion, and legacy-key
//! migration.

use serde_json::json;
use setupsh::facts::{self, Facts};
use std::path::Path;

fn facts_of(pairs: &[(&str, serde_json::Value)]) -> Facts {
    let mut f = Facts::new();
    for (k, v) in pairs {
        f.insert((*k).to_string(), v.clone());
    }
    f
}

// ---------------------------------------------------------------------------
// Placeholder expansion
// ---------------------------------------------------------------------------

#[test]
fn test_expand_literal_placeholder_round_trip() {
    assert_eq!(facts::expand_root_placeholders("repo_root/foo", "/ws"), "/ws/foo");
    assert_eq!(facts::expand_root_placeholders("repo_root\\foo", "/ws"), "/ws/foo");
}

#[test]
fn test_expand_variable_spellings() {
    assert_eq!(facts::expand_root_placeholders("$env:REPO_ROOT/x", "/ws"), "/ws/x");
    assert_eq!(facts::expand_root_placeholders("%REPO_ROOT%/x", "/ws"), "/ws/x");
    assert_eq!(facts::expand_root_placeholders("$REPO_ROOT/x", "/ws"), "/ws/x");
}

#[test]
fn test_expand_bare_placeholder_is_root() {
    for bare in ["repo_root", "$env:REPO_ROOT", "%REPO_ROOT%", ".", ""] {
        assert_eq!(facts::expand_root_placeholders(bare, "/ws"), "/ws", "for {bare:?}");
    }
}

#[test]
fn test_expand_relative_path_joined() {
    assert_eq!(facts::expand_root_placeholders("demo/sub", "/ws"), "/ws/demo/sub");
}

#[test]
fn test_expand_absolute_path_untouched() {
    assert_eq!(facts::expand_root_placeholders("/elsewhere/x", "/ws"), "/elsewhere/x");
}

#[test]
fn test_expand_with_empty_root_passthrough() {
    assert_eq!(facts::expand_root_placeholders("repo_root/foo", ""), "repo_root/foo");
}

// ---------------------------------------------------------------------------
// Legacy-key migration
// ---------------------------------------------------------------------------

#[test]
fn test_merge_migrates_repo_path() {
    let mut f = Facts::new();
    facts::merge_delta(&mut f, facts_of(&[("repo_path", json!("/ws"))]));
    assert_eq!(f.get("repo_root"), Some(&json!("/ws")));
    assert!(!f.contains_key("repo_path"));
}

#[test]
fn test_merge_migrates_clone_path_and_work_dir() {
    let mut f = Facts::new();
    facts::merge_delta(
        &mut f,
        facts_of(&[("clone_path", json!("/ws/demo")), ("work_dir", json!("/ws"))]),
    );
    assert_eq!(f.get("project_root"), Some(&json!("/ws/demo")));
    assert_eq!(f.get("exec_root"), Some(&json!("/ws")));
    assert!(!f.contains_key("clone_path"));
    assert!(!f.contains_key("work_dir"));
}

#[test]
fn test_merge_legacy_never_overwrites_canonical() {
    let mut f = facts_of(&[("repo_root", json!("/ws"))]);
    facts::merge_delta(&mut f, facts_of(&[("repo_path", json!("/elsewhere"))]));
    assert_eq!(f.get("repo_root"), Some(&json!("/ws")));
    assert!(!f.contains_key("repo_path"));
}

#[test]
fn test_merge_is_last_writer_wins_per_key() {
    let mut f = facts_of(&[("has_pyproject", json!(false))]);
    facts::merge_delta(&mut f, facts_of(&[("has_pyproject", json!(true))]));
    assert_eq!(f.get("has_pyproject"), Some(&json!(true)));
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[test]
fn test_normalize_defaults_root_and_exec_root() {
    let mut f = Facts::new();
    facts::normalize(&mut f, Path::new("/ws"));
    assert_eq!(f.get("repo_root"), Some(&json!("/ws")));
    assert_eq!(f.get("exec_root"), Some(&json!("/ws")));
    assert_eq!(f.get("project_root"), Some(&json!("/ws")));
}

#[test]
fn test_normalize_derives_project_root_from_name() {
    let mut f = facts_of(&[("repo_root", json!("/ws")), ("project_name", json!("demo"))]);
    facts::normalize(&mut f, Path::new("/ws"));
    assert_eq!(f.get("project_root"), Some(&json!("/ws/demo")));
}

#[test]
fn test_normalize_expands_project_root_placeholder() {
    let mut f = facts_of(&[
        ("repo_root", json!("/ws")),
        ("project_root", json!("repo_root/demo")),
    ]);
    facts::normalize(&mut f, Path::new("/ws"));
    assert_eq!(f.get("project_root"), Some(&json!("/ws/demo")));
    // Round-trip property: normalize(expand("repo_root/foo", R)) == R + "/foo".
    assert_eq!(
        facts::expand_root_placeholders("repo_root/demo", "/ws"),
        "/ws/demo"
    );
}

#[test]
fn test_normalize_resolves_relative_repo_root() {
    let mut f = facts_of(&[("repo_root", json!("sub"))]);
    facts::normalize(&mut f, Path::new("/ws"));
    assert_eq!(f.get("repo_root"), Some(&json!("/ws/sub")));
}

#[test]
fn test_normalize_keeps_booleans() {
    let mut f = facts_of(&[("repo_root", json!("/ws")), ("has_readme", json!(true))]);
    facts::normalize(&mut f, Path::new("/ws"));
    assert_eq!(f.get("has_readme"), Some(&json!(true)));
}

#[test]
fn test_normalize_lexical_defuses_dotdot() {
    let p = facts::normalize_lexical(Path::new("/ws/a/../b/./c"));
    assert_eq!(p, Path::new("/ws/b/c"));
}
