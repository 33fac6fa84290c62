//! Shaping raw command output into prompt-sized excerpts.
//!
//! The router never needs a full install log: the invocation context sits in
//! the first few lines and the verdict in the last ones, with thousands of
//! progress lines in between. [`compact_for_prompt`] cuts an excerpt weighted
//! toward the tail, and [`failure_hints`] pulls out the lines that explain a
//! nonzero exit so the observer and decider prompts can lead with them.
//! [`strip_ansi`] removes the terminal escape noise some installers emit even
//! on a pipe.

/// Lowercase substrings that mark a line as explaining a failure.
const FAILURE_MARKERS: &[&str] = &[
    "error",
    "failed",
    "failure",
    "fatal",
    "traceback",
    "exception",
    "denied",
    "aborted",
    "no such file",
    "not found",
];

/// Strip ANSI escape sequences and backspace overstrikes from a string.
///
/// Implemented as a character scanner rather than a regex: CSI sequences are
/// consumed up to their final byte, OSC sequences up to BEL or ST, charset
/// designations and lone escapes are dropped, and a backspace erases the
/// character before it (the overstrike trick some progress bars use).
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                // CSI: parameter and intermediate bytes end at 0x40..=0x7e.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: runs to BEL or the two-byte ST terminator.
                Some(']') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                // Charset designation consumes one more byte.
                Some('(' | ')') => {
                    chars.next();
                }
                // Any other escape is two bytes total; drop both.
                Some(_) | None => {}
            },
            // Overstrike: the backspace erases what was just written.
            '\x08' => {
                out.pop();
            }
            _ => out.push(c),
        }
    }
    out
}

/// Compact a blob of command output to at most `max_lines` lines.
///
/// Short output passes through untouched. Long output keeps roughly a third
/// of the budget from the head and the rest from the tail, with an omission
/// marker in between: install logs bury their verdict at the end, so the
/// tail is where the routing signal lives.
#[must_use]
pub fn compact_for_prompt(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return lines.join("\n");
    }
    let head_count = (max_lines / 3).max(1);
    let tail_count = max_lines.saturating_sub(head_count);
    let omitted = lines.len() - head_count - tail_count;

    let mut out = lines[..head_count].join("\n");
    out.push_str(&format!("\n[... {omitted} lines omitted ...]\n"));
    out.push_str(&lines[lines.len() - tail_count..].join("\n"));
    out
}

/// Lines of `text` that look like they explain a failure, up to `max`.
///
/// Matching is plain substring search against [`FAILURE_MARKERS`]; the point
/// is to surface the `ERROR:` / traceback lines from deep inside a long log,
/// not to classify them.
#[must_use]
pub fn failure_hints(text: &str, max: usize) -> Vec<String> {
    let mut hints = Vec::new();
    for line in text.lines() {
        let lower = line.to_lowercase();
        if FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
            hints.push(line.trim().to_string());
            if hints.len() >= max {
                break;
            }
        }
    }
    hints
}
