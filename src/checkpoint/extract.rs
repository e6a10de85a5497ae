//! Pulling the primary output back out of an agent output file.
//!
//! The `## Output` section runs until the first heading that starts a
//! metadata block. Agent content may carry its own `##` headings, so a
//! generic section split is not used here.

use regex::Regex;
use std::sync::LazyLock;

use crate::util::unescape_common;

pub const OUTPUT_HEADING: &str = "## Output";
pub const ERROR_DETAILS_HEADING: &str = "## Error Details";

/// Headings that end the output region.
pub const METADATA_HEADINGS: [&str; 4] = [
    ERROR_DETAILS_HEADING,
    "## Debug Info",
    "## Execution Metadata",
    "## Token Usage",
];

// Old writers persisted the agent result object itself, e.g.
// `TaskOutput(description='...', raw='...')` or `{'raw': '...'}`.
static OBJECT_DUMP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[A-Za-z_][A-Za-z0-9_]*\(|\{)").unwrap());

static DUMP_FIELD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)['"]?\b(raw|output|result|content)['"]?\s*[:=]\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")"#,
    )
    .unwrap()
});

/// Field preference when a dump carries several text fields.
const DUMP_FIELD_PRIORITY: [&str; 4] = ["raw", "output", "result", "content"];

/// The text between `## Output` and the next metadata heading, trimmed.
///
/// Files without an `## Output` heading are returned whole (minus a leading
/// title line).
pub fn primary_output(file_text: &str) -> String {
    let lines: Vec<&str> = file_text.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim() == OUTPUT_HEADING)
        .map(|i| i + 1);

    let body: Vec<&str> = match start {
        Some(start) => lines[start..]
            .iter()
            .take_while(|l| !is_metadata_heading(l))
            .copied()
            .collect(),
        None => lines
            .iter()
            .skip_while(|l| l.trim().is_empty())
            .enumerate()
            .filter(|(i, l)| !(*i == 0 && l.starts_with("# ")))
            .map(|(_, l)| *l)
            .collect(),
    };
    body.join("\n").trim().to_string()
}

/// Text from the error details block, if present.
pub fn error_details_region(file_text: &str) -> Option<String> {
    let mut lines = file_text.lines().skip_while(|l| l.trim() != ERROR_DETAILS_HEADING);
    lines.next()?;
    let region: Vec<&str> = lines
        .take_while(|l| !is_metadata_heading(l))
        .collect();
    Some(region.join("\n"))
}

fn is_metadata_heading(line: &str) -> bool {
    let trimmed = line.trim();
    METADATA_HEADINGS.iter().any(|h| trimmed == *h)
}

/// True if `text` looks like a serialized result object rather than prose.
pub fn looks_like_object_dump(text: &str) -> bool {
    OBJECT_DUMP_REGEX.is_match(text) && DUMP_FIELD_REGEX.is_match(text)
}

/// Recover readable text from a legacy object dump.
///
/// Returns `text` unchanged when it is not a dump or no text field can be
/// found.
pub fn recover_legacy_output(text: &str) -> String {
    if !looks_like_object_dump(text) {
        return text.to_string();
    }
    let mut found: Vec<(usize, String)> = DUMP_FIELD_REGEX
        .captures_iter(text)
        .filter_map(|caps| {
            let field = caps.get(1)?.as_str();
            let rank = DUMP_FIELD_PRIORITY.iter().position(|f| *f == field)?;
            let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
            Some((rank, unescape_common(value)))
        })
        .filter(|(_, value)| !value.trim().is_empty())
        .collect();
    found.sort_by_key(|(rank, _)| *rank);
    match found.into_iter().next() {
        Some((_, value)) => value.trim().to_string(),
        None => text.to_string(),
    }
}
