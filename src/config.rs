//! Runtime configuration derived from the process environment.
//!
//! The agent is configured entirely through environment variables so it can be
//! dropped into CI or a scratch container without a config file. Several
//! provider-specific spellings are accepted for the LLM settings; the first
//! one present wins.

use std::path::PathBuf;

/// Env var precedence for the LLM API key.
const API_KEY_VARS: &[&str] = &["OPENAI_API_KEY", "LLM_API_KEY", "MOONSHOT_API_KEY"];

/// Env var precedence for the model name.
const MODEL_VARS: &[&str] = &["OPENAI_MODEL", "LLM_MODEL_NAME", "MOONSHOT_MODEL"];

/// Env var precedence for the API base URL.
const BASE_URL_VARS: &[&str] = &["OPENAI_BASE_URL", "LLM_BASE_URL", "MOONSHOT_BASE_URL"];

/// LLM connection and sampling settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// HTTP request timeout in seconds.
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "kimi-k2-0905-preview".into(),
            base_url: "https://api.moonshot.cn/v1".into(),
            temperature: 0.7,
            max_tokens: 1000,
            timeout: 30,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = first_env(API_KEY_VARS) {
            cfg.api_key = v;
        }
        if let Some(v) = first_env(MODEL_VARS) {
            cfg.model = v;
        }
        if let Some(v) = first_env(BASE_URL_VARS) {
            cfg.base_url = v;
        }
        if let Some(t) = first_env(&["OPENAI_TEMPERATURE", "LLM_TEMPERATURE"]).and_then(|v| v.parse().ok()) {
            cfg.temperature = t;
        }
        if let Some(t) = first_env(&["OPENAI_MAX_TOKENS", "LLM_MAX_TOKENS"]).and_then(|v| v.parse().ok()) {
            cfg.max_tokens = t;
        }
        if let Some(t) = first_env(&["OPENAI_TIMEOUT", "LLM_TIMEOUT"]).and_then(|v| v.parse().ok()) {
            cfg.timeout = t;
        }
        cfg
    }
}

/// Top-level agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Workspace root: all filesystem activity is confined beneath it.
    pub work_root: PathBuf,
    /// Maximum node hops in the main graph before the run is aborted.
    pub recursion_limit: usize,
    /// Maximum LLM turns in the discover loop before a forced summary.
    pub max_discover_turns: usize,
    pub llm: LlmConfig,
}

impl AgentConfig {
    /// Build the config from the environment. The workspace root is taken
    /// from `REPO_ROOT`, then `AGENT_WORK_DIR`, then the process cwd, and is
    /// created if missing.
    pub fn from_env() -> Self {
        let work_root = first_env(&["REPO_ROOT", "AGENT_WORK_DIR"])
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let _ = std::fs::create_dir_all(&work_root);
        let work_root = work_root.canonicalize().unwrap_or(work_root);

        Self {
            work_root,
            recursion_limit: 100,
            max_discover_turns: 40,
            llm: LlmConfig::from_env(),
        }
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .find(|v| !v.trim().is_empty())
}
