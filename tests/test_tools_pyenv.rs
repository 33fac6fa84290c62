//! Tests for the Python environment tools, driving the installer-selection
//! rule with synthetic availability instead of the host PATH.

use serde_json::json;
use setupsh::tools::pyenv::{
    InstallerEvidence, ParsePyproject, ToolAvailability, choose_installer,
};
use setupsh::tools::{Tool, ToolContext};
use tempfile::TempDir;

fn ctx(dir: &TempDir) -> ToolContext {
    ToolContext {
        work_root: dir.path().canonicalize().unwrap(),
    }
}

// ---------------------------------------------------------------------------
// choose_installer: the deterministic rule chain
// ---------------------------------------------------------------------------

#[test]
fn test_uv_lock_with_uv_available() {
    let ev = InstallerEvidence {
        uv_lock: true,
        ..Default::default()
    };
    let (installer, reason) = choose_installer(&ev, &ToolAvailability::assume(&["uv", "pip"]));
    assert_eq!(installer, "uv");
    assert!(reason.contains("uv"));
}

#[test]
fn test_uv_declared_but_missing_yields_none() {
    let ev = InstallerEvidence {
        uv_declared: true,
        ..Default::default()
    };
    let (installer, reason) = choose_installer(&ev, &ToolAvailability::assume(&["pip"]));
    assert_eq!(installer, "none");
    assert!(reason.contains("not installed"));
}

#[test]
fn test_poetry_lock_beats_requirements() {
    let ev = InstallerEvidence {
        poetry_lock: true,
        requirements: true,
        ..Default::default()
    };
    let (installer, _) = choose_installer(&ev, &ToolAvailability::assume(&["poetry", "uv", "pip"]));
    assert_eq!(installer, "poetry");
}

#[test]
fn test_pdm_declared_selects_pdm() {
    let ev = InstallerEvidence {
        pdm_declared: true,
        ..Default::default()
    };
    let (installer, _) = choose_installer(&ev, &ToolAvailability::assume(&["pdm", "pip"]));
    assert_eq!(installer, "pdm");
}

#[test]
fn test_conda_env_with_conda() {
    let ev = InstallerEvidence {
        conda_env: true,
        ..Default::default()
    };
    let (installer, _) = choose_installer(&ev, &ToolAvailability::assume(&["conda", "pip"]));
    assert_eq!(installer, "conda");
}

#[test]
fn test_requirements_prefers_uv_over_pip() {
    let ev = InstallerEvidence {
        requirements: true,
        ..Default::default()
    };
    let (with_uv, _) = choose_installer(&ev, &ToolAvailability::assume(&["uv", "pip"]));
    assert_eq!(with_uv, "uv");
    let (pip_only, _) = choose_installer(&ev, &ToolAvailability::assume(&["pip"]));
    assert_eq!(pip_only, "pip");
}

#[test]
fn test_pyproject_deps_fall_back_to_pip() {
    let ev = InstallerEvidence {
        pyproject_has_deps: true,
        ..Default::default()
    };
    let (installer, _) = choose_installer(&ev, &ToolAvailability::assume(&["pip"]));
    assert_eq!(installer, "pip");
}

#[test]
fn test_no_evidence_is_none() {
    let (installer, reason) =
        choose_installer(&InstallerEvidence::default(), &ToolAvailability::assume(&["uv", "pip"]));
    assert_eq!(installer, "none");
    assert!(reason.contains("no clear evidence"));
}

// ---------------------------------------------------------------------------
// InstallerEvidence::gather
// ---------------------------------------------------------------------------

#[test]
fn test_gather_reads_lock_files_and_pyproject() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("poetry.lock"), "").unwrap();
    std::fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
    std::fs::write(
        dir.path().join("pyproject.toml"),
        "[project]\nname = \"demo\"\ndependencies = [\"requests\"]\n\n[tool.poetry]\nname = \"demo\"\n\n[build-system]\nbuild-backend = \"poetry.core.masonry.api\"\n",
    )
    .unwrap();

    let ev = InstallerEvidence::gather(dir.path());
    assert!(ev.poetry_lock);
    assert!(ev.requirements);
    assert!(ev.poetry_declared);
    assert!(!ev.uv_declared);
    assert!(ev.pyproject_has_deps);
    assert_eq!(ev.build_backend.as_deref(), Some("poetry.core.masonry.api"));
}

#[test]
fn test_gather_empty_directory() {
    let dir = TempDir::new().unwrap();
    let ev = InstallerEvidence::gather(dir.path());
    assert!(!ev.poetry_lock && !ev.uv_lock && !ev.pdm_lock);
    assert!(!ev.requirements && !ev.conda_env);
    assert!(!ev.pyproject_has_deps);
}

// ---------------------------------------------------------------------------
// pyenv_parse_pyproject
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parse_pyproject_extracts_fields() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("pyproject.toml"),
        "[build-system]\nbuild-backend = \"hatchling.build\"\n\n\
         [project]\nname = \"demo\"\nversion = \"0.1.0\"\ndependencies = [\"requests>=2\", \"click\"]\n\n\
         [project.scripts]\ndemo = \"demo.cli:main\"\n\n\
         [tool.uv]\ndev-dependencies = []\n",
    )
    .unwrap();

    let env = ParsePyproject(ctx(&dir)).call(json!({})).await;
    assert!(env.ok);
    assert_eq!(env.data["exists"], json!(true));
    assert_eq!(env.data["project_name"], "demo");
    assert_eq!(env.data["project_version"], "0.1.0");
    assert_eq!(env.data["backend"], "hatchling.build");
    assert_eq!(env.data["has_dependencies"], json!(true));
    assert_eq!(env.data["dependencies"].as_array().unwrap().len(), 2);
    assert_eq!(env.data["has_uv_section"], json!(true));
    assert_eq!(env.data["has_poetry_section"], json!(false));
    assert!(env.data["scripts"].get("demo").is_some());
}

#[tokio::test]
async fn test_parse_pyproject_missing_is_ok_with_exists_false() {
    let dir = TempDir::new().unwrap();
    let env = ParsePyproject(ctx(&dir)).call(json!({})).await;
    assert!(env.ok);
    assert_eq!(env.data["exists"], json!(false));
}

#[tokio::test]
async fn test_parse_pyproject_garbled_is_parse_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("pyproject.toml"), "not toml [[[").unwrap();
    let env = ParsePyproject(ctx(&dir)).call(json!({})).await;
    assert!(!env.ok);
    assert!(env.error.as_deref().unwrap().starts_with("parse_error"));
}

#[tokio::test]
async fn test_parse_pyproject_escape_rejected() {
    let dir = TempDir::new().unwrap();
    let env = ParsePyproject(ctx(&dir))
        .call(json!({"pyproject_path": "../outside/pyproject.toml"}))
        .await;
    assert!(!env.ok);
    assert_eq!(env.error.as_deref(), Some("path_out_of_root"));
}
