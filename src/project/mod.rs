//! Projects, their sessions, and versioned requirement snapshots.
//!
//! A project's `metadata.json` is the record of truth for its sessions and
//! version counter. Every change is also appended to `changelog.jsonl`.

use chrono::{DateTime, Utc};
use ideaforge_common::{ExecutionMode, ProjectStatus, SessionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod manager;

pub use manager::ProjectManager;

/// A session as listed in its project's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub workflow_type: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Requirements version produced when the session completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Usage reported for one completed session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Running totals across every session of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetrics {
    #[serde(default)]
    pub total_sessions: u32,
    #[serde(default)]
    pub completed_sessions: u32,
    #[serde(default)]
    pub total_duration_seconds: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl ProjectMetrics {
    pub fn accumulate(&mut self, session: &SessionMetrics) {
        self.completed_sessions += 1;
        self.total_duration_seconds += session.duration_seconds;
        self.total_tokens += session.tokens;
        self.total_cost_usd += session.cost_usd;
    }
}

/// One startup idea under iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub startup_idea: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execution_mode: ExecutionMode,
    /// Highest requirements version ever issued. Never decreases.
    #[serde(default)]
    pub current_version: u32,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_session_id: Option<String>,
    #[serde(default)]
    pub metrics: ProjectMetrics,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
}

impl Project {
    pub fn session(&self, session_id: &str) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    fn session_mut(&mut self, session_id: &str) -> Option<&mut SessionSummary> {
        self.sessions.iter_mut().find(|s| s.session_id == session_id)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// What a changelog line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    ProjectCreated,
    SessionStarted,
    SessionCompleted,
    SessionDeleted,
    PreferencesUpdated,
    ProjectArchived,
}

/// One line of `changelog.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// SHA-256 of the snapshot written with this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    pub message: String,
}

impl ChangelogEntry {
    pub fn new(kind: ChangeKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            session_id: None,
            version: None,
            content_sha256: None,
            message: message.into(),
        }
    }

    pub fn for_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Returned by [`ProjectManager::complete_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub project_id: String,
    pub session_id: String,
    pub version: u32,
    pub snapshot_path: PathBuf,
    pub latest_path: PathBuf,
    pub content_sha256: String,
    pub completed_at: DateTime<Utc>,
}
