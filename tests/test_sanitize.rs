//! Tests for the command sanitizer and the destructive-command guard.

use setupsh::sanitize::{EnvSnapshot, ShellFlavor, repo_name_from_url, sanitize, validate_command};

fn env() -> EnvSnapshot {
    EnvSnapshot {
        repo_root: "/ws".into(),
        project_root: Some("/ws/demo".into()),
    }
}

fn env_no_project() -> EnvSnapshot {
    EnvSnapshot {
        repo_root: "/ws".into(),
        project_root: None,
    }
}

// ---------------------------------------------------------------------------
// Placeholder expansion
// ---------------------------------------------------------------------------

#[test]
fn test_percent_placeholder_becomes_join_form() {
    let out = sanitize("type %REPO_ROOT%\\demo", &env(), ShellFlavor::PowerShell);
    assert_eq!(out, "type (Join-Path $env:REPO_ROOT 'demo')");
}

#[test]
fn test_literal_repo_root_prefix_bash() {
    let out = sanitize("cat repo_root/demo/README.md", &env(), ShellFlavor::Bash);
    assert_eq!(out, "cat \"$REPO_ROOT/demo/README.md\"");
}

#[test]
fn test_env_spelling_converges_on_bash_variable() {
    let out = sanitize("ls $env:REPO_ROOT/demo", &env(), ShellFlavor::Bash);
    assert_eq!(out, "ls \"$REPO_ROOT/demo\"");
}

#[test]
fn test_bare_variable_reference_untouched() {
    let out = sanitize("echo $REPO_ROOT", &env(), ShellFlavor::Bash);
    assert_eq!(out, "echo $REPO_ROOT");
}

// ---------------------------------------------------------------------------
// Absolute-path re-anchoring
// ---------------------------------------------------------------------------

#[test]
fn test_absolute_path_reanchored_powershell() {
    let out = sanitize("Get-Content /ws/demo/file.txt", &env(), ShellFlavor::PowerShell);
    assert_eq!(
        out,
        "Get-Content -LiteralPath (Join-Path $env:REPO_ROOT 'demo/file.txt')"
    );
}

#[test]
fn test_absolute_path_reanchored_bash() {
    let out = sanitize("cat /ws/demo/file.txt", &env(), ShellFlavor::Bash);
    assert_eq!(out, "cat \"$REPO_ROOT/demo/file.txt\"");
}

#[test]
fn test_unrelated_absolute_path_kept() {
    let out = sanitize("cat /opt/other/file.txt", &env(), ShellFlavor::Bash);
    assert_eq!(out, "cat /opt/other/file.txt");
}

#[test]
fn test_longer_prefix_not_mangled() {
    // /wsx is not under /ws even though it shares a byte prefix.
    let out = sanitize("cat /wsx/file.txt", &env(), ShellFlavor::Bash);
    assert_eq!(out, "cat /wsx/file.txt");
}

// ---------------------------------------------------------------------------
// Editable install
// ---------------------------------------------------------------------------

#[test]
fn test_editable_install_rewritten_powershell() {
    let out = sanitize("pip install -e .", &env(), ShellFlavor::PowerShell);
    assert_eq!(out, "pip install -e $env:PROJECT_ROOT");
}

#[test]
fn test_editable_install_rewritten_bash() {
    let out = sanitize("pip install -e .", &env(), ShellFlavor::Bash);
    assert_eq!(out, "pip install -e \"$PROJECT_ROOT\"");
}

#[test]
fn test_editable_install_kept_without_project_root() {
    let out = sanitize("pip install -e .", &env_no_project(), ShellFlavor::Bash);
    assert_eq!(out, "pip install -e .");
}

#[test]
fn test_editable_install_with_explicit_dir_kept() {
    let out = sanitize("pip install -e ./sub", &env(), ShellFlavor::Bash);
    assert_eq!(out, "pip install -e ./sub");
}

// ---------------------------------------------------------------------------
// -LiteralPath injection (PowerShell)
// ---------------------------------------------------------------------------

#[test]
fn test_literal_path_injected_for_bare_argument() {
    let out = sanitize("Get-ChildItem demo", &env(), ShellFlavor::PowerShell);
    assert_eq!(out, "Get-ChildItem -LiteralPath demo");
}

#[test]
fn test_literal_path_not_duplicated() {
    let out = sanitize(
        "Get-Content -LiteralPath (Join-Path $env:REPO_ROOT 'README.md') -Raw",
        &env(),
        ShellFlavor::PowerShell,
    );
    assert_eq!(
        out,
        "Get-Content -LiteralPath (Join-Path $env:REPO_ROOT 'README.md') -Raw"
    );
}

#[test]
fn test_literal_path_skips_flag_argument() {
    let out = sanitize("Get-ChildItem -Recurse", &env(), ShellFlavor::PowerShell);
    assert_eq!(out, "Get-ChildItem -Recurse");
}

#[test]
fn test_literal_path_not_applied_to_bash() {
    let out = sanitize("Get-Content README.md", &env(), ShellFlavor::Bash);
    // bash flavor leaves PowerShell cmdlets alone.
    assert_eq!(out, "Get-Content README.md");
}

// ---------------------------------------------------------------------------
// git clone target normalization
// ---------------------------------------------------------------------------

#[test]
fn test_clone_into_root_redirected_powershell() {
    let out = sanitize(
        "git clone https://github.com/example/demo.git $env:REPO_ROOT",
        &env_no_project(),
        ShellFlavor::PowerShell,
    );
    assert_eq!(
        out,
        "git clone https://github.com/example/demo.git (Join-Path $env:REPO_ROOT 'demo')"
    );
}

#[test]
fn test_clone_into_root_redirected_bash() {
    let out = sanitize(
        "git clone https://github.com/example/demo.git $env:REPO_ROOT",
        &env_no_project(),
        ShellFlavor::Bash,
    );
    assert_eq!(
        out,
        "git clone https://github.com/example/demo.git \"$REPO_ROOT/demo\""
    );
}

#[test]
fn test_clone_with_explicit_target_kept() {
    let cmd = "git clone https://github.com/example/demo.git \"$REPO_ROOT/elsewhere\"";
    assert_eq!(sanitize(cmd, &env_no_project(), ShellFlavor::Bash), cmd);
}

#[test]
fn test_repo_name_from_url() {
    assert_eq!(repo_name_from_url("https://github.com/example/demo.git"), "demo");
    assert_eq!(repo_name_from_url("https://github.com/example/demo/"), "demo");
    assert_eq!(repo_name_from_url("git@github.com:example/demo.git"), "demo");
    assert_eq!(repo_name_from_url(""), "repo");
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[test]
fn test_sanitize_is_idempotent() {
    let inputs = [
        "pip install -e .",
        "cat repo_root/demo/README.md",
        "Get-Content /ws/demo/file.txt",
        "git clone https://github.com/example/demo.git $env:REPO_ROOT",
        "ls $env:REPO_ROOT/demo",
        "echo plain",
        "cat /opt/other/file.txt",
        "pip install -r repo_root/demo/requirements.txt",
    ];
    for flavor in [ShellFlavor::PowerShell, ShellFlavor::Bash] {
        for input in inputs {
            let once = sanitize(input, &env(), flavor);
            let twice = sanitize(&once, &env(), flavor);
            assert_eq!(once, twice, "not idempotent for {input:?} ({flavor:?})");
        }
    }
}

// ---------------------------------------------------------------------------
// Destructive-command guard
// ---------------------------------------------------------------------------

#[test]
fn test_guard_blocks_recursive_delete_of_protected_paths() {
    assert!(validate_command("rm -rf /").is_err());
    assert!(validate_command("rm -rf /usr").is_err());
    assert!(validate_command("sudo rm -rf /etc/").is_err());
    assert!(validate_command("echo ok && rm -rf /home").is_err());
    // macOS spellings of the system directories.
    assert!(validate_command("rm -rf /private/etc").is_err());
    assert!(validate_command("rm -rf /private/var/").is_err());
}

#[test]
fn test_guard_allows_scoped_delete() {
    assert!(validate_command("rm -rf ./build").is_ok());
    assert!(validate_command("rm -rf /ws/demo/dist").is_ok());
    assert!(validate_command("rm file.txt").is_ok());
}

#[test]
fn test_guard_blocks_dangerous_patterns() {
    assert!(validate_command(":(){ :|:& };:").is_err());
    assert!(validate_command("mkfs.ext4 /dev/sda1").is_err());
    assert!(validate_command("dd if=/dev/zero of=/dev/sda").is_err());
    assert!(validate_command("shutdown now").is_err());
    assert!(validate_command("init 0").is_err());
}

#[test]
fn test_guard_blocks_recursive_chmod_chown() {
    assert!(validate_command("chmod -R 777 /").is_err());
    assert!(validate_command("chown -R nobody /etc").is_err());
    assert!(validate_command("chmod -R 755 ./scripts").is_ok());
}

#[test]
fn test_guard_allows_ordinary_commands() {
    assert!(validate_command("git status").is_ok());
    assert!(validate_command("pip install -e \"$PROJECT_ROOT\"").is_ok());
    assert!(validate_command("python -m pytest").is_ok());
}
