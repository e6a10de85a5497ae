//! Minimal markdown record codec.
//!
//! Checkpoint files are human-readable markdown with a fixed shape:
//! a `# Title`, then `## Section` blocks holding `- Key: value` bullets,
//! pipe tables, or free text. This module only understands that shape; it
//! is not a general markdown parser.

use regex::Regex;
use std::sync::LazyLock;

static FIELD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+\**([^:*]+?)\**\s*:\s*(.*?)\s*$").unwrap());

static TABLE_SEPARATOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?\s*$").unwrap());

/// Placeholder for an absent optional value.
pub const NONE_VALUE: &str = "n/a";

/// One `## Heading` block.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub heading: String,
    pub lines: Vec<String>,
}

impl Section {
    /// Value of the first `- Key: value` bullet with a matching key
    /// (case-insensitive).
    pub fn field(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let caps = FIELD_REGEX.captures(line)?;
            let found = caps.get(1)?.as_str().trim();
            if found.eq_ignore_ascii_case(key) {
                caps.get(2).map(|m| m.as_str())
            } else {
                None
            }
        })
    }

    /// Plain `- item` bullets, in order.
    pub fn bullets(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| {
                let trimmed = line.trim_start();
                trimmed
                    .strip_prefix("- ")
                    .or_else(|| trimmed.strip_prefix("* "))
                    .map(str::trim)
            })
            .collect()
    }

    /// Body rows of the first pipe table, header and separator removed.
    pub fn table_rows(&self) -> Vec<Vec<String>> {
        let table: Vec<&String> = self
            .lines
            .iter()
            .skip_while(|line| !line.trim_start().starts_with('|'))
            .take_while(|line| line.trim_start().starts_with('|'))
            .collect();
        let Some(separator) = table.iter().position(|l| TABLE_SEPARATOR_REGEX.is_match(l)) else {
            return Vec::new();
        };
        table[separator + 1..]
            .iter()
            .map(|line| split_row(line))
            .collect()
    }

    /// Section body with surrounding blank lines removed.
    pub fn text(&self) -> String {
        self.lines.join("\n").trim().to_string()
    }
}

/// A parsed record file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub title: Option<String>,
    pub sections: Vec<Section>,
}

impl Document {
    /// Split `text` into sections at level-two headings. Headings inside
    /// fenced code blocks are left alone.
    pub fn parse(text: &str) -> Self {
        let mut doc = Document::default();
        let mut current: Option<Section> = None;
        let mut in_fence = false;

        for line in text.lines() {
            let trimmed = line.trim_end();
            if trimmed.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if !in_fence {
                if let Some(heading) = trimmed.strip_prefix("## ") {
                    if let Some(done) = current.take() {
                        doc.sections.push(done);
                    }
                    current = Some(Section {
                        heading: heading.trim().to_string(),
                        lines: Vec::new(),
                    });
                    continue;
                }
                if doc.title.is_none() && current.is_none() {
                    if let Some(title) = trimmed.strip_prefix("# ") {
                        doc.title = Some(title.trim().to_string());
                        continue;
                    }
                }
            }
            if let Some(section) = current.as_mut() {
                section.lines.push(trimmed.to_string());
            }
        }
        if let Some(done) = current {
            doc.sections.push(done);
        }
        doc
    }

    pub fn section(&self, heading: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.heading.eq_ignore_ascii_case(heading))
    }

    /// Field lookup across a named section.
    pub fn field(&self, heading: &str, key: &str) -> Option<&str> {
        self.section(heading)?.field(key)
    }
}

/// Incremental writer producing the shape [`Document::parse`] reads.
#[derive(Debug, Default)]
pub struct Builder {
    out: String,
}

impl Builder {
    pub fn new(title: &str) -> Self {
        Self {
            out: format!("# {}\n", title),
        }
    }

    pub fn section(mut self, heading: &str) -> Self {
        self.out.push_str(&format!("\n## {}\n\n", heading));
        self
    }

    pub fn field(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        let value = value.to_string();
        self.out
            .push_str(&format!("- {}: {}\n", key, single_line(&value)));
        self
    }

    pub fn optional_field<T: std::fmt::Display>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self.field(key, NONE_VALUE),
        }
    }

    pub fn bullets<'a>(mut self, items: impl IntoIterator<Item = &'a str>, empty: &str) -> Self {
        let mut any = false;
        for item in items {
            any = true;
            self.out.push_str(&format!("- {}\n", single_line(item)));
        }
        if !any {
            self.out.push_str(&format!("_{}_\n", empty));
        }
        self
    }

    pub fn table(mut self, headers: &[&str], rows: &[Vec<String>], empty: &str) -> Self {
        if rows.is_empty() {
            self.out.push_str(&format!("_{}_\n", empty));
            return self;
        }
        self.out.push_str(&format!("| {} |\n", headers.join(" | ")));
        let separator: Vec<&str> = headers.iter().map(|_| "---").collect();
        self.out.push_str(&format!("| {} |\n", separator.join(" | ")));
        for row in rows {
            let cells: Vec<String> = row.iter().map(|c| table_cell(c)).collect();
            self.out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        self
    }

    pub fn text(mut self, body: &str) -> Self {
        self.out.push_str(body.trim_end());
        self.out.push('\n');
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Parse an optional value written by [`Builder::optional_field`].
pub fn optional(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(NONE_VALUE))
}

fn split_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|c| c.trim().to_string()).collect()
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn table_cell(value: &str) -> String {
    single_line(value).replace('|', "/")
}
