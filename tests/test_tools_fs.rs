//! Tests for the filesystem probe tools: envelope invariants, path
//! containment, read modes, listings, search, and the Markdown outline.

use serde_json::json;
use setupsh::tools::fs::{
    FilesExists, FilesFind, FilesGrep, FilesList, FilesRead, FilesReadRange, FilesReadSection,
    FilesStat, MdOutline,
};
use setupsh::tools::{Envelope, Tool, ToolContext};
use tempfile::TempDir;

fn workspace() -> (TempDir, ToolContext) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("README.md"), "# Demo\n\nA demo project.\n\n## Install\n\npip install demo\n").unwrap();
    std::fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"demo\"\n").unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/main.py"), "print('hi')\n").unwrap();
    let ctx = ToolContext {
        work_root: dir.path().canonicalize().unwrap(),
    };
    (dir, ctx)
}

/// The envelope invariant every tool must satisfy.
fn assert_envelope(env: &Envelope) {
    assert!(!env.tool.is_empty());
    assert!(env.data.is_object());
    assert_eq!(env.error.is_some(), !env.ok, "error present iff ok=false: {env:?}");
}

// ---------------------------------------------------------------------------
// Path containment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_read_escape_attempt_rejected() {
    let (_dir, ctx) = workspace();
    let env = FilesRead(ctx).call(json!({"path": "../../etc/passwd"})).await;
    assert_envelope(&env);
    assert!(!env.ok);
    assert_eq!(env.error.as_deref(), Some("path_out_of_root"));
    assert_eq!(env.data["path"], "../../etc/passwd");
    assert_eq!(env.data["content"], "");
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_escape_rejected() {
    let (dir, ctx) = workspace();
    std::os::unix::fs::symlink("/etc", dir.path().join("escape")).unwrap();
    let env = FilesRead(ctx).call(json!({"path": "escape/passwd"})).await;
    assert!(!env.ok);
    assert_eq!(env.error.as_deref(), Some("path_out_of_root"));
}

#[tokio::test]
async fn test_relative_paths_resolve_against_root() {
    let (_dir, ctx) = workspace();
    let env = FilesExists(ctx).call(json!({"path": "README.md"})).await;
    assert_envelope(&env);
    assert!(env.ok);
    assert_eq!(env.data["exists"], json!(true));
}

#[tokio::test]
async fn test_repo_root_placeholder_accepted() {
    let (_dir, ctx) = workspace();
    let env = FilesExists(ctx).call(json!({"path": "repo_root/README.md"})).await;
    assert!(env.ok);
    assert_eq!(env.data["exists"], json!(true));
}

// ---------------------------------------------------------------------------
// files_exists / files_stat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_exists_missing_file() {
    let (_dir, ctx) = workspace();
    let env = FilesExists(ctx).call(json!({"path": "nope.txt"})).await;
    assert!(env.ok);
    assert_eq!(env.data["exists"], json!(false));
}

#[tokio::test]
async fn test_stat_file_and_missing() {
    let (_dir, ctx) = workspace();
    let tool = FilesStat(ctx);
    let env = tool.call(json!({"path": "README.md"})).await;
    assert!(env.ok);
    assert_eq!(env.data["type"], "file");
    assert!(env.data["size"].as_u64().unwrap() > 0);

    let env = tool.call(json!({"path": "ghost"})).await;
    assert!(env.ok);
    assert_eq!(env.data["type"], "missing");
}

// ---------------------------------------------------------------------------
// files_list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_list_top_level() {
    let (_dir, ctx) = workspace();
    let env = FilesList(ctx).call(json!({"path": "."})).await;
    assert_envelope(&env);
    assert!(env.ok);
    let names: Vec<&str> = env.data["entries"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert!(names.contains(&"README.md"));
    assert!(names.contains(&"src"));
    assert_eq!(env.data["truncated"], json!(false));
}

#[tokio::test]
async fn test_list_recursive_with_pattern() {
    let (_dir, ctx) = workspace();
    let env = FilesList(ctx)
        .call(json!({"path": ".", "recurse": true, "files_only": true, "patterns": ["*.py"]}))
        .await;
    assert!(env.ok);
    let entries = env.data["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "main.py");
}

#[tokio::test]
async fn test_list_not_a_directory() {
    let (_dir, ctx) = workspace();
    let env = FilesList(ctx).call(json!({"path": "README.md"})).await;
    assert!(!env.ok);
    assert_eq!(env.error.as_deref(), Some("not_a_directory"));
}

// ---------------------------------------------------------------------------
// files_read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_read_raw() {
    let (_dir, ctx) = workspace();
    let env = FilesRead(ctx).call(json!({"path": "README.md"})).await;
    assert!(env.ok);
    let content = env.data["content"].as_str().unwrap();
    assert!(content.starts_with("# Demo"));
    assert_eq!(env.data["truncated"], json!(false));
    assert_eq!(env.data["encoding"], "utf-8");
}

#[tokio::test]
async fn test_read_head_caps_bytes() {
    let (_dir, ctx) = workspace();
    let env = FilesRead(ctx)
        .call(json!({"path": "README.md", "mode": "head", "max_bytes": 6}))
        .await;
    assert!(env.ok);
    assert_eq!(env.data["content"], "# Demo");
    assert_eq!(env.data["truncated"], json!(true));
}

#[tokio::test]
async fn test_read_tail() {
    let (dir, ctx) = workspace();
    std::fs::write(dir.path().join("log.txt"), "aaaa\nbbbb\n").unwrap();
    let env = FilesRead(ctx)
        .call(json!({"path": "log.txt", "mode": "tail", "max_bytes": 5}))
        .await;
    assert!(env.ok);
    assert_eq!(env.data["content"], "bbbb\n");
    assert_eq!(env.data["truncated"], json!(true));
}

#[tokio::test]
async fn test_read_directory_is_not_a_file() {
    let (_dir, ctx) = workspace();
    let env = FilesRead(ctx).call(json!({"path": "src"})).await;
    assert!(!env.ok);
    assert_eq!(env.error.as_deref(), Some("not_a_file"));
}

// ---------------------------------------------------------------------------
// files_find / files_grep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_find_by_glob() {
    let (_dir, ctx) = workspace();
    let env = FilesFind(ctx)
        .call(json!({"start_dir": ".", "include_globs": ["*.toml"]}))
        .await;
    assert!(env.ok);
    let matches = env.data["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert!(matches[0].as_str().unwrap().ends_with("pyproject.toml"));
}

#[tokio::test]
async fn test_find_first_only() {
    let (_dir, ctx) = workspace();
    let env = FilesFind(ctx)
        .call(json!({"start_dir": ".", "include_globs": ["*.md", "*.toml"], "first_only": true}))
        .await;
    assert!(env.ok);
    assert_eq!(env.data["matches"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_grep_finds_line() {
    let (_dir, ctx) = workspace();
    let env = FilesGrep(ctx)
        .call(json!({"start_dir": ".", "patterns": ["^name\\s*="], "include_globs": ["*.toml"]}))
        .await;
    assert!(env.ok);
    let matches = env.data["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["line_no"], json!(2));
    assert!(matches[0]["line"].as_str().unwrap().contains("demo"));
}

#[tokio::test]
async fn test_grep_invalid_regex_is_parse_error() {
    let (_dir, ctx) = workspace();
    let env = FilesGrep(ctx)
        .call(json!({"start_dir": ".", "patterns": ["("]}))
        .await;
    assert!(!env.ok);
    assert!(env.error.as_deref().unwrap().starts_with("parse_error"));
}

// ---------------------------------------------------------------------------
// files_read_section / files_read_range
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_read_section_inclusive_lines() {
    let (dir, ctx) = workspace();
    std::fs::write(dir.path().join("nums.txt"), "one\ntwo\nthree\nfour\n").unwrap();
    let env = FilesReadSection(ctx)
        .call(json!({"path": "nums.txt", "start_line": 2, "end_line": 3}))
        .await;
    assert!(env.ok);
    assert_eq!(env.data["content"], "two\nthree\n");
}

#[tokio::test]
async fn test_read_section_empty_range() {
    let (_dir, ctx) = workspace();
    let env = FilesReadSection(ctx)
        .call(json!({"path": "README.md", "start_line": 5, "end_line": 2}))
        .await;
    assert!(env.ok);
    assert_eq!(env.data["content"], "");
    assert_eq!(env.data["truncated"], json!(false));
}

#[tokio::test]
async fn test_read_range_bytes() {
    let (dir, ctx) = workspace();
    std::fs::write(dir.path().join("bytes.txt"), "0123456789").unwrap();
    let env = FilesReadRange(ctx)
        .call(json!({"path": "bytes.txt", "offset": 2, "length": 3}))
        .await;
    assert!(env.ok);
    assert_eq!(env.data["content"], "234");
    assert_eq!(env.data["truncated"], json!(true));
}

#[tokio::test]
async fn test_read_range_past_end() {
    let (dir, ctx) = workspace();
    std::fs::write(dir.path().join("bytes.txt"), "0123").unwrap();
    let env = FilesReadRange(ctx)
        .call(json!({"path": "bytes.txt", "offset": 10, "length": 5}))
        .await;
    assert!(env.ok);
    assert_eq!(env.data["content"], "");
    assert_eq!(env.data["truncated"], json!(false));
}

// ---------------------------------------------------------------------------
// md_outline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_md_outline_sections_and_ranges() {
    let (_dir, ctx) = workspace();
    let env = MdOutline(ctx).call(json!({"path": "README.md"})).await;
    assert!(env.ok);
    let sections = env.data["sections"].as_array().unwrap();
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0]["title"], "Demo");
    assert_eq!(sections[0]["level"], json!(1));
    assert_eq!(sections[1]["title"], "Install");
    // The level-1 section runs to the end of the file.
    assert_eq!(sections[0]["end_line"], env.data["sections"][1]["end_line"]);
}

#[tokio::test]
async fn test_md_outline_missing_file() {
    let (_dir, ctx) = workspace();
    let env = MdOutline(ctx).call(json!({"path": "nope.md"})).await;
    assert!(!env.ok);
    assert_eq!(env.error.as_deref(), Some("not_a_file"));
}

// ---------------------------------------------------------------------------
// Envelope invariants across tools
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_envelope_invariant_holds_for_failures_and_successes() {
    let (_dir, ctx) = workspace();
    let cases: Vec<Envelope> = vec![
        FilesExists(ctx.clone()).call(json!({"path": "README.md"})).await,
        FilesRead(ctx.clone()).call(json!({"path": "../escape"})).await,
        FilesList(ctx.clone()).call(json!({"path": "README.md"})).await,
        FilesGrep(ctx.clone()).call(json!({"start_dir": ".", "patterns": ["x"]})).await,
        MdOutline(ctx).call(json!({"path": "src"})).await,
    ];
    for env in &cases {
        assert_envelope(env);
    }
}

/// Absolute paths reported by the tools stay inside the workspace root.
#[tokio::test]
async fn test_reported_paths_are_under_root() {
    let (_dir, ctx) = workspace();
    let root = ctx.work_root.clone();
    let env = FilesList(ctx).call(json!({"path": ".", "recurse": true})).await;
    for entry in env.data["entries"].as_array().unwrap() {
        let p = entry["path"].as_str().unwrap();
        assert!(
            std::path::Path::new(p).starts_with(&root),
            "{p} escapes {}",
            root.display()
        );
    }
}
