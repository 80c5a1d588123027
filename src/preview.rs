//! Short, redacted excerpts of ticket text for log lines and error context.
//!
//! Log output never carries full ticket bodies. Everything that reaches a log
//! line or an `InferenceError` goes through [`preview`] first.

use regex::Regex;
use std::sync::LazyLock;

/// Characters of ticket text kept in a preview.
pub const PREVIEW_CHARS: usize = 50;

const PLACEHOLDER: &str = "[REDACTED]";

const PATTERNS: &[&str] = &[
    // Email addresses
    r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}",
    // Card numbers, phone numbers, account ids
    r"\d[\d \-]{7,}\d",
    // Bearer tokens
    r"(?i)bearer\s+[A-Za-z0-9_\-.~+/]{20,}=*",
    // Credentials typed into a ticket
    r"(?i)(password|passwd|secret|token|api_key|apikey)\s*[=:]\s*\S+",
];

static REDACTORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("builtin redaction pattern"))
        .collect()
});

/// Replace emails, long digit runs, and credential assignments.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for re in REDACTORS.iter() {
        if re.is_match(&out) {
            out = re.replace_all(&out, PLACEHOLDER).into_owned();
        }
    }
    out
}

/// Redacted first [`PREVIEW_CHARS`] characters, with a trailing ellipsis when cut.
pub fn preview(text: &str) -> String {
    let redacted = redact(text.trim());
    let mut chars = redacted.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
