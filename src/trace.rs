//! Best-effort append-only trace files.
//!
//! Two files are written in the process working directory: `.agent_debug.log`
//! collects keyed notes from every node, and `.agent_llm.log` records LLM
//! requests and responses with the API key redacted and long messages
//! truncated. Both are diagnostics only: every write error is swallowed so a
//! read-only cwd never affects a run.

use serde_json::Value;
use std::io::Write;

/// Debug trace file name (cwd-relative).
const DEBUG_LOG: &str = ".agent_debug.log";

/// LLM request/response trace file name (cwd-relative).
const LLM_LOG: &str = ".agent_llm.log";

/// Cap applied to message content in the LLM trace.
const LLM_LOG_TRUNCATE: usize = 4096;

fn timestamp() -> String {
    // Seconds since the epoch; enough to correlate with the tracing output
    // without pulling in a date-time dependency.
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{secs}")
}

fn append(path: &str, line: &str) {
    let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(f, "{line}");
}

/// Record a keyed note in the debug trace.
pub fn note(key: &str, value: impl std::fmt::Display) {
    let text = value.to_string();
    let short: String = text.chars().take(2000).collect();
    append(DEBUG_LOG, &format!("[{}] {key} {short}", timestamp()));
}

/// Record an LLM request or response in the LLM trace.
///
/// `payload` is logged as compact JSON after redaction: any `api_key` field is
/// masked and string content fields are truncated to 4 KB.
pub fn llm_log(kind: &str, payload: &Value) {
    let safe = redact(payload.clone());
    let body = serde_json::to_string(&safe).unwrap_or_default();
    append(LLM_LOG, &format!("[{}] {kind} {body}", timestamp()));
}

fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if k == "api_key" {
                    out.insert(k, Value::String("***".into()));
                } else {
                    out.insert(k, redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        Value::String(s) if s.len() > LLM_LOG_TRUNCATE => {
            let cut: String = s.chars().take(LLM_LOG_TRUNCATE).collect();
            Value::String(cut)
        }
        other => other,
    }
}
