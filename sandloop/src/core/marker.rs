//! Completion marker detection for agent output.

use std::sync::LazyLock;

use regex::Regex;

pub const SUMMARY_OPEN: &str = "<task_summary>";
pub const SUMMARY_CLOSE: &str = "</task_summary>";

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<task_summary>(.*?)</task_summary>").expect("summary marker regex is valid")
});

/// Extract the summary wrapped by the first `<task_summary>` pair in `text`.
///
/// Only the first pair is considered. A pair with blank content is not a
/// completion, and an unterminated opening tag is ignored.
pub fn extract_summary(text: &str) -> Option<String> {
    let caps = SUMMARY_RE.captures(text)?;
    let body = caps.get(1)?.as_str().trim();
    if body.is_empty() {
        return None;
    }
    Some(body.to_string())
}
