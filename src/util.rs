//! Shared filesystem and string helpers for the ideaforge crate.

use serde::de::DeserializeOwned;
use sha2::Digest;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Result of reading an optional, possibly damaged record.
///
/// Readers that must never hard-fail (run logs, feedback files) match on this
/// instead of treating every error the same way.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome<T> {
    /// The file does not exist.
    Absent,
    Loaded(T),
    /// The file exists but could not be read or parsed.
    Corrupt { reason: String },
}

impl<T> LoadOutcome<T> {
    pub fn loaded(self) -> Option<T> {
        match self {
            LoadOutcome::Loaded(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, LoadOutcome::Corrupt { .. })
    }
}

/// Read a file to a string, mapping a missing file to `Absent`.
pub fn read_text(path: &Path) -> LoadOutcome<String> {
    match fs::read_to_string(path) {
        Ok(content) => LoadOutcome::Loaded(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => LoadOutcome::Absent,
        Err(e) => LoadOutcome::Corrupt {
            reason: e.to_string(),
        },
    }
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> LoadOutcome<T> {
    match read_text(path) {
        LoadOutcome::Loaded(content) => match serde_json::from_str(&content) {
            Ok(value) => LoadOutcome::Loaded(value),
            Err(e) => LoadOutcome::Corrupt {
                reason: e.to_string(),
            },
        },
        LoadOutcome::Absent => LoadOutcome::Absent,
        LoadOutcome::Corrupt { reason } => LoadOutcome::Corrupt { reason },
    }
}

/// Write `content` to `path` via a sibling temp file and rename.
///
/// Readers see either the old content or the new content, never a torn write.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = temp_sibling(path);
    fs::write(&temp_path, content)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Lowercase `name` and replace every non-alphanumeric character with `_`.
pub fn filesystem_safe_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Undo the escape sequences found in legacy object dumps.
pub fn unescape_common(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => {}
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
