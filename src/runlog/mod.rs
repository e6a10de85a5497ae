//! Durable workflow run log and lock markers.
//!
//! Each session directory holds one `workflow_runs.json` (a list of
//! [`WorkflowRun`] records in start order) plus one lock marker per accepted
//! workflow. Run records are only ever appended or transitioned in place; a
//! transition always targets the most recent matching record.

use chrono::{DateTime, Utc};
use ideaforge_common::RunStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod locks;
pub mod tracker;

pub use locks::{LockRecord, LockStore};
pub use tracker::WorkflowRunTracker;

/// One attempt to execute a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    /// Workflow name exactly as the caller supplied it (may be an alias).
    pub workflow_type: String,
    pub status: RunStatus,
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub trigger_metadata: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn new(workflow_type: &str, trigger_type: &str, trigger_metadata: Map<String, Value>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_type: workflow_type.trim().to_string(),
            status: RunStatus::Running,
            trigger_type: trigger_type.to_string(),
            trigger_metadata,
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            accepted_at: None,
            summary: None,
            error: None,
        }
    }

    /// Transition to `completed`, merging `summary` into any existing summary.
    pub fn complete(&mut self, summary: Option<Map<String, Value>>) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        if let Some(extra) = summary {
            self.summary.get_or_insert_with(Map::new).extend(extra);
        }
    }

    pub fn fail(&mut self, error_message: &str) {
        self.status = RunStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.error = Some(error_message.to_string());
    }

    pub fn accept(&mut self) {
        self.status = RunStatus::Accepted;
        self.accepted_at = Some(Utc::now());
    }

    /// Seconds from start to completion or failure.
    pub fn duration_seconds(&self) -> Option<f64> {
        let end = self.completed_at.or(self.failed_at)?;
        Some((end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_run_is_running() {
        let run = WorkflowRun::new(" idea-validation ", "user_initiated", Map::new());
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.workflow_type, "idea-validation");
        assert!(run.completed_at.is_none());
        assert!(run.duration_seconds().is_none());
    }

    #[test]
    fn test_complete_merges_summary() {
        let mut run = WorkflowRun::new("idea-validation", "user_initiated", Map::new());
        let mut first = Map::new();
        first.insert("verdict".into(), json!("GO"));
        run.complete(Some(first));
        let mut second = Map::new();
        second.insert("score".into(), json!(8));
        run.complete(Some(second));

        let summary = run.summary.as_ref().unwrap();
        assert_eq!(summary["verdict"], json!("GO"));
        assert_eq!(summary["score"], json!(8));
        assert!(run.duration_seconds().unwrap() >= 0.0);
    }

    #[test]
    fn test_serialized_form_omits_empty_fields() {
        let run = WorkflowRun::new("discovery", "auto", Map::new());
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["status"], "running");
        assert!(value.get("summary").is_none());
        assert!(value.get("trigger_metadata").is_none());
    }
}
