//! Command sanitization: pure rewrites applied to every shell line before it
//! reaches a session.
//!
//! LLM-translated commands are full of portability hazards: hard-coded
//! absolute paths that break when the session is reopened elsewhere,
//! placeholder spellings (`repo_root/...`, `%REPO_ROOT%`), editable installs
//! against `.`, and `git clone` targets that collide with the workspace root.
//! [`sanitize`] rewrites them into a root-anchored, re-runnable form. The
//! transform is idempotent: `sanitize(sanitize(x)) == sanitize(x)`.
//!
//! [`validate_command`] is the companion guard refusing outright destructive
//! commands (fork bombs, `mkfs`, recursive deletes of system paths) before
//! they execute.

use crate::facts::{self, Facts};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Which host shell dialect a command is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlavor {
    PowerShell,
    Bash,
}

impl ShellFlavor {
    /// Flavor of the host this process runs on.
    pub fn host() -> Self {
        if cfg!(windows) {
            ShellFlavor::PowerShell
        } else {
            ShellFlavor::Bash
        }
    }
}

/// Snapshot of the root facts a command is sanitized against.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub repo_root: String,
    pub project_root: Option<String>,
}

impl EnvSnapshot {
    pub fn from_facts(f: &Facts) -> Self {
        Self {
            repo_root: facts::get_str(f, facts::REPO_ROOT).unwrap_or_default().to_string(),
            project_root: facts::get_str(f, facts::PROJECT_ROOT).map(str::to_string),
        }
    }
}

/// Sanitize a raw command line. Rules, in order:
///
/// 1. placeholder expansion (`%REPO_ROOT%`, `repo_root/...`, cross-flavor
///    variable spellings) into the flavor's canonical variable reference;
/// 2. re-anchoring of absolute workspace paths into a root-variable join
///    form, so commands survive session reopen under a moved root;
/// 3. `pip install -e .` rewritten against the project root when known;
/// 4. `-LiteralPath` injection for PowerShell cmdlets that take a bare path;
/// 5. `git clone` targets equal to the workspace root redirected into a
///    subdirectory named after the repository.
pub fn sanitize(raw: &str, env: &EnvSnapshot, flavor: ShellFlavor) -> String {
    let text = raw.trim();
    if text.is_empty() {
        return String::new();
    }
    let mut text = expand_placeholders(text, flavor);
    text = reanchor_absolute_paths(&text, env, flavor);
    text = rewrite_editable_install(&text, env, flavor);
    if flavor == ShellFlavor::PowerShell {
        text = inject_literal_path(&text);
    }
    normalize_git_clone_target(&text, flavor)
}

/// Canonical variable reference for a root name in the given flavor.
fn var_ref(name: &str, flavor: ShellFlavor) -> String {
    match flavor {
        ShellFlavor::PowerShell => format!("$env:{name}"),
        ShellFlavor::Bash => format!("${name}"),
    }
}

// ---------------------------------------------------------------------------
// Rule 1: placeholder expansion
// ---------------------------------------------------------------------------

fn expand_placeholders(text: &str, flavor: ShellFlavor) -> String {
    let mut out = text.to_string();
    for name in ["REPO_ROOT", "PROJECT_ROOT"] {
        let canonical = var_ref(name, flavor);
        // Cross-flavor and percent spellings all converge on the canonical
        // reference. The PowerShell spelling is only rewritten for bash; the
        // reverse direction is left alone because `$REPO_ROOT` is also a
        // legal (if unusual) PowerShell variable.
        if flavor == ShellFlavor::Bash {
            out = out.replace(&format!("$env:{name}"), &canonical);
            out = out.replace(&format!("${{{name}}}"), &canonical);
        }
        out = out.replace(&format!("%{name}%"), &canonical);

        // Literal lowercase placeholder as used inside facts: `repo_root/...`.
        let lowered = name.to_lowercase();
        let pat = Regex::new(&format!(r#"(^|[\s='"(]){lowered}([/\\]|\b)"#))
            .expect("placeholder regex");
        out = pat
            .replace_all(&out, |c: &Captures<'_>| {
                format!("{}{}{}", &c[1], canonical, &c[2])
            })
            .into_owned();
    }
    out
}

// ---------------------------------------------------------------------------
// Rule 2: absolute-path re-anchoring
// ---------------------------------------------------------------------------

fn join_form(rel: &str, flavor: ShellFlavor) -> String {
    let rel = rel.trim_start_matches(['/', '\\']);
    match flavor {
        ShellFlavor::PowerShell => {
            format!("(Join-Path $env:REPO_ROOT '{}')", rel.replace('\'', "''"))
        }
        ShellFlavor::Bash => format!("\"$REPO_ROOT/{rel}\""),
    }
}

fn reanchor_absolute_paths(text: &str, env: &EnvSnapshot, flavor: ShellFlavor) -> String {
    let root = env.repo_root.trim_end_matches(['/', '\\']);
    let mut out = text.to_string();

    if !root.is_empty() {
        // A workspace-absolute path not already inside a quoted or joined
        // form. The preceding character must not be part of a longer path or
        // an enclosing quote.
        let pat = Regex::new(&format!(
            r#"(^|[^'"\w]){}([/\\][^\s'"()]+)"#,
            regex::escape(root)
        ))
        .expect("reanchor regex");
        out = pat
            .replace_all(&out, |c: &Captures<'_>| {
                format!("{}{}", &c[1], join_form(&c[2], flavor))
            })
            .into_owned();
    }

    // Variable-prefixed paths produced by placeholder expansion converge on
    // the same join form.
    let var_pat = match flavor {
        ShellFlavor::PowerShell => Regex::new(r#"(^|[^'"])\$env:REPO_ROOT([/\\][^\s'"()]+)"#),
        ShellFlavor::Bash => Regex::new(r#"(^|[^'"])\$REPO_ROOT(/[^\s'"()]+)"#),
    }
    .expect("var reanchor regex");
    var_pat
        .replace_all(&out, |c: &Captures<'_>| {
            format!("{}{}", &c[1], join_form(&c[2], flavor))
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Rule 3: editable install
// ---------------------------------------------------------------------------

static EDITABLE_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)pip(3?)\s+install\s+-e\s+\.(\s|$)").expect("editable regex"));

fn rewrite_editable_install(text: &str, env: &EnvSnapshot, flavor: ShellFlavor) -> String {
    if env.project_root.is_none() {
        return text.to_string();
    }
    let target = var_ref("PROJECT_ROOT", flavor);
    let target = match flavor {
        ShellFlavor::PowerShell => target,
        ShellFlavor::Bash => format!("\"{target}\""),
    };
    EDITABLE_DOT
        .replace_all(text, |c: &Captures<'_>| {
            format!("pip{} install -e {}{}", &c[1], target, &c[2])
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Rule 4: -LiteralPath injection (PowerShell only)
// ---------------------------------------------------------------------------

/// Cmdlets known to accept `-LiteralPath` for their first positional argument.
const LITERAL_PATH_CMDLETS: &[&str] = &["Get-Content", "Get-ChildItem"];

fn inject_literal_path(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;

    'outer: while !rest.is_empty() {
        let hit = LITERAL_PATH_CMDLETS
            .iter()
            .filter_map(|c| rest.find(*c).map(|i| (i, *c)))
            .min_by_key(|(i, _)| *i);
        let Some((idx, cmdlet)) = hit else {
            out.push_str(rest);
            break 'outer;
        };

        let after_idx = idx + cmdlet.len();
        out.push_str(&rest[..after_idx]);
        rest = &rest[after_idx..];

        // Examine the first following token; flags (anything starting with
        // `-`, including an already-present -LiteralPath) are left alone.
        let ws_len = rest.len() - rest.trim_start().len();
        let token_start = &rest[ws_len..];
        let needs_flag = !matches!(
            token_start.chars().next(),
            Some('-' | '|' | ';' | '&' | ')' | '<' | '>') | None
        );
        if needs_flag {
            out.push_str(&rest[..ws_len]);
            out.push_str("-LiteralPath ");
            rest = token_start;
        }
    }

    // Collapse a doubled flag if one slipped through from earlier passes.
    out.replace("-LiteralPath -LiteralPath", "-LiteralPath")
}

// ---------------------------------------------------------------------------
// Rule 5: git clone target normalization
// ---------------------------------------------------------------------------

/// Derive a repository directory name from a clone URL.
pub fn repo_name_from_url(url: &str) -> String {
    let mut name = url.trim().trim_end_matches('/');
    if let Some(idx) = name.rfind(['/', '\\']) {
        name = &name[idx + 1..];
    }
    let name = name.strip_suffix(".git").unwrap_or(name);
    if name.is_empty() {
        "repo".to_string()
    } else {
        name.to_string()
    }
}

fn normalize_git_clone_target(text: &str, flavor: ShellFlavor) -> String {
    let pat = match flavor {
        ShellFlavor::PowerShell => {
            Regex::new(r#"(?i)\bgit\s+clone\s+(\S+)\s+("?\$env:REPO_ROOT"?)(\s|$)"#)
        }
        ShellFlavor::Bash => Regex::new(r#"(?i)\bgit\s+clone\s+(\S+)\s+("?\$REPO_ROOT"?)(\s|$)"#),
    }
    .expect("git clone regex");

    pat.replace_all(text, |c: &Captures<'_>| {
        let url = &c[1];
        let name = repo_name_from_url(url);
        let target = match flavor {
            ShellFlavor::PowerShell => {
                format!("(Join-Path $env:REPO_ROOT '{}')", name.replace('\'', "''"))
            }
            ShellFlavor::Bash => format!("\"$REPO_ROOT/{name}\""),
        };
        format!("git clone {url} {target}{}", &c[3])
    })
    .into_owned()
}

// ---------------------------------------------------------------------------
// Destructive-command guard
// ---------------------------------------------------------------------------

/// System paths that must never be the target of a recursive delete, chmod,
/// or chown.
const PROTECTED_PATHS: &[&str] = &[
    "/", "/*", "/bin", "/sbin", "/usr", "/etc", "/var", "/home", "/root", "/lib", "/lib64",
    "/opt", "/boot", "/dev", "/sys", "/proc", "/System", "/Library", "/Applications", "/Users",
    "/private", "/private/var", "/private/etc",
];

struct DangerousPattern {
    regex: Regex,
    description: &'static str,
}

static DANGEROUS_PATTERNS: LazyLock<Vec<DangerousPattern>> = LazyLock::new(|| {
    let rules: &[(&str, &str)] = &[
        (r":\(\)\s*\{.*\|.*&\s*\}\s*;", "fork bomb"),
        (r"\bmkfs\b", "filesystem format"),
        (r"\bdd\b.*\bof=/dev/", "raw write to block device"),
        (r">\s*/dev/(sd|nvme|hd|vd|xvd|disk|mapper/)", "redirect to block device"),
        (r"\b(shutdown|reboot|halt|poweroff)\b", "system shutdown/reboot"),
        (r"\binit\s+[06]\b", "system halt/reboot via init"),
    ];
    rules
        .iter()
        .map(|(p, d)| DangerousPattern {
            regex: Regex::new(p).expect("invalid dangerous pattern"),
            description: d,
        })
        .collect()
});

/// Refuse commands that are destructive regardless of path containment.
///
/// Returns `Err(reason)` when the command matches a dangerous pattern or
/// performs a recursive delete/chmod/chown against a protected system path.
pub fn validate_command(command: &str) -> Result<(), String> {
    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.regex.is_match(command) {
            return Err(format!(
                "blocked: command matches dangerous pattern ({})",
                pattern.description
            ));
        }
    }

    for subcmd in split_subcommands(command) {
        for prog in ["rm", "chmod", "chown"] {
            if recursive_on_protected(subcmd, prog) {
                return Err(format!(
                    "blocked: recursive {prog} targeting a protected system path: {}",
                    subcmd.trim()
                ));
            }
        }
    }
    Ok(())
}

/// Split on `;`, `&&`, `||` so each piece is checked independently. Not a
/// shell parser; catches the obvious compositions.
fn split_subcommands(cmd: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = cmd;
    loop {
        let next = ["&&", "||", ";"]
            .iter()
            .filter_map(|sep| rest.find(sep).map(|i| (i, sep.len())))
            .min();
        match next {
            Some((pos, sep_len)) => {
                parts.push(&rest[..pos]);
                rest = &rest[pos + sep_len..];
            }
            None => {
                parts.push(rest);
                return parts;
            }
        }
    }
}

fn recursive_on_protected(subcmd: &str, prog: &str) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();
    let Some(pos) = words.iter().position(|w| *w == prog) else {
        return false;
    };
    let args = &words[pos + 1..];

    let recursive = args.iter().any(|a| {
        *a == "--recursive"
            || (a.starts_with('-')
                && !a.starts_with("--")
                && (a.contains('r') || a.contains('R')))
    });
    if !recursive {
        return false;
    }

    args.iter()
        .filter(|a| !a.starts_with('-'))
        .any(|arg| {
            if *arg == "/*" {
                return true;
            }
            let trimmed = arg.trim_end_matches('/');
            let target = if trimmed.is_empty() { "/" } else { trimmed };
            PROTECTED_PATHS.iter().any(|p| {
                let pt = p.trim_end_matches('/');
                target == if pt.is_empty() { "/" } else { pt }
            })
        })
}
