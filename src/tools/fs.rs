//! Read-only filesystem probe tools.
//!
//! All paths resolve against the workspace root and are rejected with
//! `path_out_of_root` when they escape it. Reads are byte-capped and report
//! truncation; listings and searches carry result limits so a pathological
//! tree cannot blow up an LLM prompt.

use super::{Envelope, Tool, ToolContext, arg_bool, arg_str, arg_str_list, internal_error, resolve_guard};
use async_trait::async_trait;
use glob::Pattern;
use regex::Regex;
use serde_json::{Value, json};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Default byte cap for file reads.
const DEFAULT_MAX_BYTES: u64 = 262_144;

/// Result limits per tool.
const LIST_LIMIT: usize = 1000;
const FIND_LIMIT: usize = 2000;
const GREP_LIMIT: usize = 500;

/// Cap on a single grep match line.
const GREP_LINE_CAP: usize = 400;

fn kind_of(p: &Path) -> &'static str {
    if p.is_dir() {
        "dir"
    } else if p.is_file() {
        "file"
    } else {
        "other"
    }
}

fn matches_any(patterns: &[Pattern], name: &str, full: &str) -> bool {
    patterns
        .iter()
        .any(|p| p.matches(name) || p.matches(full))
}

fn compile_globs(globs: &[String]) -> Vec<Pattern> {
    globs
        .iter()
        .filter_map(|g| Pattern::new(g).ok())
        .collect()
}

/// Depth-first walk that never follows a symlink out of the root.
fn walk_within(root: &Path, start: &Path, mut visit: impl FnMut(&Path) -> bool) {
    let mut stack: Vec<PathBuf> = vec![start.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let contained = path
                .canonicalize()
                .map(|c| c == root || c.starts_with(root))
                .unwrap_or(false);
            if !contained {
                continue;
            }
            if !visit(&path) {
                return;
            }
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
}

fn read_text_lossy(path: &Path) -> std::io::Result<String> {
    let data = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

// ---------------------------------------------------------------------------
// files_exists / files_stat
// ---------------------------------------------------------------------------

pub struct FilesExists(pub ToolContext);

#[async_trait]
impl Tool for FilesExists {
    fn name(&self) -> &'static str {
        "files_exists"
    }

    fn schema(&self) -> Value {
        json!({"path": "file or directory path, relative to the workspace root"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_default();
        match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => Envelope::success(
                self.name(),
                json!({"exists": p.exists(), "path": p.to_string_lossy()}),
            ),
            Err(kind) => Envelope::failure(self.name(), json!({"path": raw}), kind),
        }
    }
}

pub struct FilesStat(pub ToolContext);

#[async_trait]
impl Tool for FilesStat {
    fn name(&self) -> &'static str {
        "files_stat"
    }

    fn schema(&self) -> Value {
        json!({"path": "path to stat"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_default();
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"path": raw, "type": "missing"}), kind);
            }
        };
        if !p.exists() {
            return Envelope::success(
                self.name(),
                json!({"path": p.to_string_lossy(), "type": "missing"}),
            );
        }
        match p.metadata() {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                Envelope::success(
                    self.name(),
                    json!({
                        "path": p.to_string_lossy(),
                        "type": kind_of(&p),
                        "size": meta.len(),
                        "mtime": mtime,
                        "is_symlink": p.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false),
                    }),
                )
            }
            Err(e) => Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy()}),
                internal_error(&e, "IoError"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// files_list
// ---------------------------------------------------------------------------

pub struct FilesList(pub ToolContext);

#[async_trait]
impl Tool for FilesList {
    fn name(&self) -> &'static str {
        "files_list"
    }

    fn schema(&self) -> Value {
        json!({
            "path": "directory to list",
            "recurse": "bool, default false",
            "files_only": "bool, default false",
            "patterns": "optional glob filters",
        })
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_else(|| ".".into());
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"dir": raw, "entries": []}), kind);
            }
        };
        if !p.is_dir() {
            return Envelope::failure(
                self.name(),
                json!({"dir": p.to_string_lossy(), "entries": []}),
                "not_a_directory",
            );
        }

        let files_only = arg_bool(&args, "files_only", false);
        let recurse = arg_bool(&args, "recurse", false);
        let patterns = compile_globs(&arg_str_list(&args, "patterns"));
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(LIST_LIMIT as u64) as usize;

        let mut entries = Vec::new();
        let mut truncated = false;
        let root = self.0.work_root.canonicalize().unwrap_or_else(|_| self.0.work_root.clone());

        let mut consider = |child: &Path| -> bool {
            if files_only && !child.is_file() {
                return true;
            }
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !patterns.is_empty() && !matches_any(&patterns, &name, &child.to_string_lossy()) {
                return true;
            }
            entries.push(json!({
                "name": name,
                "path": child.to_string_lossy(),
                "type": kind_of(child),
            }));
            if entries.len() >= limit {
                truncated = true;
                return false;
            }
            true
        };

        if recurse {
            walk_within(&root, &p, &mut consider);
        } else if let Ok(dir) = std::fs::read_dir(&p) {
            for entry in dir.flatten() {
                if !consider(&entry.path()) {
                    break;
                }
            }
        }

        Envelope::success(
            self.name(),
            json!({"dir": p.to_string_lossy(), "entries": entries, "truncated": truncated}),
        )
    }
}

// ---------------------------------------------------------------------------
// files_read
// ---------------------------------------------------------------------------

pub struct FilesRead(pub ToolContext);

#[async_trait]
impl Tool for FilesRead {
    fn name(&self) -> &'static str {
        "files_read"
    }

    fn schema(&self) -> Value {
        json!({"path": "file to read", "mode": "raw|head|tail", "max_bytes": "byte cap"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_default();
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"path": raw, "content": ""}), kind);
            }
        };
        if !p.is_file() {
            return Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy(), "content": ""}),
                "not_a_file",
            );
        }

        let mode = arg_str(&args, "mode").unwrap_or_else(|| "raw".into());
        let max_bytes = args
            .get("max_bytes")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_BYTES);

        let result = (|| -> std::io::Result<(Vec<u8>, bool)> {
            let mut f = std::fs::File::open(&p)?;
            let size = f.metadata()?.len();
            let mut buf = Vec::new();
            let truncated = match mode.as_str() {
                "tail" if size > max_bytes => {
                    f.seek(SeekFrom::Start(size - max_bytes))?;
                    f.take(max_bytes).read_to_end(&mut buf)?;
                    true
                }
                _ => {
                    f.take(max_bytes).read_to_end(&mut buf)?;
                    size > max_bytes
                }
            };
            Ok((buf, truncated))
        })();

        match result {
            Ok((data, truncated)) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                Envelope::success(
                    self.name(),
                    json!({
                        "path": p.to_string_lossy(),
                        "content": text,
                        "encoding": "utf-8",
                        "size": text.len(),
                        "truncated": truncated,
                    }),
                )
            }
            Err(e) => Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy(), "content": ""}),
                internal_error(&e, "IoError"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// files_find
// ---------------------------------------------------------------------------

pub struct FilesFind(pub ToolContext);

#[async_trait]
impl Tool for FilesFind {
    fn name(&self) -> &'static str {
        "files_find"
    }

    fn schema(&self) -> Value {
        json!({
            "start_dir": "directory to search from",
            "include_globs": "globs matched against name or full path; empty means all",
            "exclude_globs": "globs removed after include",
            "first_only": "bool, stop at the first match",
        })
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "start_dir").unwrap_or_else(|| ".".into());
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"start_dir": raw, "matches": []}), kind);
            }
        };
        if !p.is_dir() {
            return Envelope::failure(
                self.name(),
                json!({"start_dir": p.to_string_lossy(), "matches": []}),
                "not_a_directory",
            );
        }

        let include = arg_str_list(&args, "include_globs");
        let inc = compile_globs(&include);
        let exc = compile_globs(&arg_str_list(&args, "exclude_globs"));
        let first_only = arg_bool(&args, "first_only", false);
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(FIND_LIMIT as u64) as usize;

        let mut matches: Vec<String> = Vec::new();
        let mut truncated = false;
        let root = self.0.work_root.canonicalize().unwrap_or_else(|_| self.0.work_root.clone());

        walk_within(&root, &p, |child| {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let full = child.to_string_lossy().into_owned();
            let included = inc.is_empty() || matches_any(&inc, &name, &full);
            if included && !matches_any(&exc, &name, &full) {
                matches.push(full);
                if first_only {
                    return false;
                }
                if matches.len() >= limit {
                    truncated = true;
                    return false;
                }
            }
            true
        });

        Envelope::success(
            self.name(),
            json!({
                "start_dir": p.to_string_lossy(),
                "matches": matches,
                "pattern": format!("{include:?}"),
                "truncated": truncated,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// files_read_section / files_read_range
// ---------------------------------------------------------------------------

pub struct FilesReadSection(pub ToolContext);

#[async_trait]
impl Tool for FilesReadSection {
    fn name(&self) -> &'static str {
        "files_read_section"
    }

    fn schema(&self) -> Value {
        json!({"path": "file", "start_line": "1-based inclusive", "end_line": "inclusive", "max_chars": "char cap"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_default();
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"path": raw, "content": ""}), kind);
            }
        };
        if !p.is_file() {
            return Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy(), "content": ""}),
                "not_a_file",
            );
        }

        let start = args.get("start_line").and_then(Value::as_i64).unwrap_or(1).max(1) as usize;
        let end = args.get("end_line").and_then(Value::as_i64).unwrap_or(0).max(0) as usize;
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_BYTES) as usize;

        if end < start {
            return Envelope::success(
                self.name(),
                json!({
                    "path": p.to_string_lossy(),
                    "start_line": start, "end_line": end,
                    "content": "", "encoding": "utf-8", "size": 0, "truncated": false,
                }),
            );
        }

        let text = match read_text_lossy(&p) {
            Ok(t) => t,
            Err(e) => {
                return Envelope::failure(
                    self.name(),
                    json!({"path": p.to_string_lossy(), "content": ""}),
                    internal_error(&e, "IoError"),
                );
            }
        };

        let mut collected = String::new();
        let mut truncated = false;
        for (no, line) in text.lines().enumerate() {
            let line_no = no + 1;
            if line_no < start {
                continue;
            }
            if line_no > end {
                break;
            }
            let budget = max_chars.saturating_sub(collected.len());
            if budget == 0 {
                truncated = true;
                break;
            }
            let mut piece = line.to_string();
            piece.push('\n');
            if piece.len() > budget {
                collected.extend(piece.chars().take(budget));
                truncated = true;
                break;
            }
            collected.push_str(&piece);
        }

        Envelope::success(
            self.name(),
            json!({
                "path": p.to_string_lossy(),
                "start_line": start,
                "end_line": end,
                "content": collected,
                "encoding": "utf-8",
                "size": collected.len(),
                "truncated": truncated,
            }),
        )
    }
}

pub struct FilesReadRange(pub ToolContext);

#[async_trait]
impl Tool for FilesReadRange {
    fn name(&self) -> &'static str {
        "files_read_range"
    }

    fn schema(&self) -> Value {
        json!({"path": "file", "offset": "byte offset", "length": "byte count"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_default();
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"path": raw, "content": ""}), kind);
            }
        };
        if !p.is_file() {
            return Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy(), "content": ""}),
                "not_a_file",
            );
        }

        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0);
        let length = args.get("length").and_then(Value::as_u64).unwrap_or(0);

        let result = (|| -> std::io::Result<(Vec<u8>, u64)> {
            let mut f = std::fs::File::open(&p)?;
            let size = f.metadata()?.len();
            if length == 0 || offset >= size {
                return Ok((Vec::new(), size));
            }
            f.seek(SeekFrom::Start(offset))?;
            let mut buf = Vec::new();
            f.take(length).read_to_end(&mut buf)?;
            Ok((buf, size))
        })();

        match result {
            Ok((data, size)) => {
                let truncated = !data.is_empty() && offset + (data.len() as u64) < size;
                let text = String::from_utf8_lossy(&data).into_owned();
                Envelope::success(
                    self.name(),
                    json!({
                        "path": p.to_string_lossy(),
                        "offset": offset,
                        "length": length,
                        "content": text,
                        "encoding": "utf-8",
                        "size": text.len(),
                        "truncated": truncated,
                    }),
                )
            }
            Err(e) => Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy(), "content": ""}),
                internal_error(&e, "IoError"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// files_grep
// ---------------------------------------------------------------------------

pub struct FilesGrep(pub ToolContext);

#[async_trait]
impl Tool for FilesGrep {
    fn name(&self) -> &'static str {
        "files_grep"
    }

    fn schema(&self) -> Value {
        json!({
            "start_dir": "directory to search",
            "patterns": "regex list",
            "include_globs": "optional file filters",
            "first_only": "bool, stop at the first match",
        })
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "start_dir").unwrap_or_else(|| ".".into());
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"start_dir": raw, "matches": []}), kind);
            }
        };
        if !p.is_dir() {
            return Envelope::failure(
                self.name(),
                json!({"start_dir": p.to_string_lossy(), "matches": []}),
                "not_a_directory",
            );
        }

        let raw_patterns = arg_str_list(&args, "patterns");
        let mut regexes = Vec::new();
        for pat in &raw_patterns {
            match Regex::new(pat) {
                Ok(re) => regexes.push(re),
                Err(e) => {
                    return Envelope::failure(
                        self.name(),
                        json!({"start_dir": p.to_string_lossy(), "matches": []}),
                        internal_error(&e, "parse_error"),
                    );
                }
            }
        }
        let globs = compile_globs(&arg_str_list(&args, "include_globs"));
        let first_only = arg_bool(&args, "first_only", false);
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(GREP_LIMIT as u64) as usize;

        let mut matches: Vec<Value> = Vec::new();
        let mut truncated = false;
        let root = self.0.work_root.canonicalize().unwrap_or_else(|_| self.0.work_root.clone());

        walk_within(&root, &p, |child| {
            if !child.is_file() {
                return true;
            }
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let full = child.to_string_lossy().into_owned();
            if !globs.is_empty() && !matches_any(&globs, &name, &full) {
                return true;
            }
            let Ok(text) = read_text_lossy(child) else {
                return true;
            };
            for (no, line) in text.lines().enumerate() {
                for re in &regexes {
                    if re.is_match(line) {
                        let shown: String = line.chars().take(GREP_LINE_CAP).collect();
                        matches.push(json!({
                            "path": full.clone(),
                            "line_no": no + 1,
                            "line": shown,
                            "pattern": re.as_str(),
                        }));
                        if first_only {
                            return false;
                        }
                        if matches.len() >= limit {
                            truncated = true;
                            return false;
                        }
                    }
                }
            }
            true
        });

        Envelope::success(
            self.name(),
            json!({
                "start_dir": p.to_string_lossy(),
                "matches": matches,
                "truncated": truncated,
                "patterns": raw_patterns,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// md_outline
// ---------------------------------------------------------------------------

pub struct MdOutline(pub ToolContext);

#[async_trait]
impl Tool for MdOutline {
    fn name(&self) -> &'static str {
        "md_outline"
    }

    fn schema(&self) -> Value {
        json!({"path": "markdown file to outline"})
    }

    async fn call(&self, args: Value) -> Envelope {
        let raw = arg_str(&args, "path").unwrap_or_default();
        let p = match resolve_guard(&self.0.work_root, &raw) {
            Ok(p) => p,
            Err(kind) => {
                return Envelope::failure(self.name(), json!({"path": raw, "sections": []}), kind);
            }
        };
        if !p.is_file() {
            return Envelope::failure(
                self.name(),
                json!({"path": p.to_string_lossy(), "sections": []}),
                "not_a_file",
            );
        }

        let text = match read_text_lossy(&p) {
            Ok(t) => t,
            Err(e) => {
                return Envelope::failure(
                    self.name(),
                    json!({"path": p.to_string_lossy(), "sections": []}),
                    internal_error(&e, "IoError"),
                );
            }
        };

        let heading = Regex::new(r"^(#{1,6})\s+(.+?)\s*$").expect("heading regex");
        let lines: Vec<&str> = text.lines().collect();
        let mut headers: Vec<(usize, usize, String)> = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if let Some(c) = heading.captures(line) {
                headers.push((c[1].len(), idx + 1, c[2].trim().to_string()));
            }
        }

        // A section runs until the next heading of equal or shallower level.
        let mut sections = Vec::new();
        for (i, (level, line_no, title)) in headers.iter().enumerate() {
            let mut end_line = lines.len();
            for (next_level, next_line, _) in &headers[i + 1..] {
                if next_level <= level {
                    end_line = next_line - 1;
                    break;
                }
            }
            sections.push(json!({
                "level": level,
                "title": title,
                "line_no": line_no,
                "start_line": line_no,
                "end_line": end_line,
            }));
        }

        Envelope::success(
            self.name(),
            json!({
                "path": p.to_string_lossy(),
                "sections": sections,
                "count": sections.len(),
            }),
        )
    }
}
