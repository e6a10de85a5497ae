//! Per-workflow acceptance markers.
//!
//! A marker file's existence is the only source of truth for "this workflow
//! is locked". Run log statuses are never consulted. Markers are written
//! under the canonical workflow name; markers left behind under an older
//! alias name still count.

use chrono::{DateTime, Utc};
use ideaforge_common::WorkflowCatalog;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::RunLogError;
use crate::layout;
use crate::util::{self, LoadOutcome};

/// Contents of a lock marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub workflow_type: String,
    pub locked_at: DateTime<Utc>,
}

/// Lock markers for one session directory.
#[derive(Debug, Clone)]
pub struct LockStore {
    session_dir: PathBuf,
    catalog: Arc<WorkflowCatalog>,
}

impl LockStore {
    pub fn new(session_dir: impl Into<PathBuf>, catalog: Arc<WorkflowCatalog>) -> Self {
        Self {
            session_dir: session_dir.into(),
            catalog,
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Write (or overwrite) the marker for `workflow_type`'s class.
    pub fn lock(&self, workflow_type: &str) -> Result<LockRecord, RunLogError> {
        let canonical = self.catalog.canonical(workflow_type).to_string();
        let record = LockRecord {
            workflow_type: canonical.clone(),
            locked_at: Utc::now(),
        };
        let path = layout::lock_marker_file(&self.session_dir, &canonical);
        let json = serde_json::to_vec_pretty(&record)?;

        fs::create_dir_all(&self.session_dir).map_err(|source| RunLogError::LockWriteFailed {
            path: self.session_dir.clone(),
            source,
        })?;
        util::atomic_write(&path, &json)
            .map_err(|source| RunLogError::LockWriteFailed { path, source })?;

        tracing::info!(workflow = %canonical, "workflow locked");
        Ok(record)
    }

    /// True if a marker exists for any name in `workflow_type`'s class.
    pub fn is_locked(&self, workflow_type: &str) -> bool {
        self.marker_paths(workflow_type).iter().any(|p| p.exists())
    }

    /// The marker contents, if a readable marker exists.
    ///
    /// A marker that exists but cannot be parsed still locks the workflow;
    /// only its timestamp is unavailable.
    pub fn lock_record(&self, workflow_type: &str) -> Option<LockRecord> {
        self.marker_paths(workflow_type)
            .iter()
            .find_map(|path| match util::read_json::<LockRecord>(path) {
                LoadOutcome::Loaded(record) => Some(record),
                LoadOutcome::Corrupt { reason } => {
                    tracing::warn!(path = %path.display(), %reason, "unreadable lock marker");
                    None
                }
                LoadOutcome::Absent => None,
            })
    }

    /// Whether the workflow's pipeline predecessor (if any) is locked.
    pub fn can_enter(&self, workflow_type: &str) -> bool {
        match self.catalog.predecessor(workflow_type) {
            Some(prerequisite) => self.is_locked(prerequisite),
            None => true,
        }
    }

    /// Remove every marker in the session. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, RunLogError> {
        let pattern = format!(
            "{}/workflow_lock_*.json",
            glob::Pattern::escape(&self.session_dir.to_string_lossy())
        );
        let Ok(paths) = glob::glob(&pattern) else {
            return Ok(0);
        };
        let mut removed = 0;
        for path in paths.filter_map(|entry| entry.ok()) {
            fs::remove_file(&path).map_err(|source| RunLogError::RemoveFailed {
                path: path.clone(),
                source,
            })?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, session = %self.session_dir.display(), "lock markers cleared");
        }
        Ok(removed)
    }

    fn marker_paths(&self, workflow_type: &str) -> Vec<PathBuf> {
        self.catalog
            .class_of(workflow_type)
            .into_iter()
            .map(|name| layout::lock_marker_file(&self.session_dir, name))
            .collect()
    }
}
