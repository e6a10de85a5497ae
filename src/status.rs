//! Read-only workflow status for UI consumers.
//!
//! Everything here is derived from the run log, the lock markers and the
//! session's phase directories. Nothing is written and nothing fails; an
//! unreadable source reads as "no".

use chrono::{DateTime, Utc};
use ideaforge_common::{FeedbackState, RunStatus};
use serde::Serialize;

use crate::checkpoint::CheckpointManager;
use crate::runlog::WorkflowRunTracker;

/// Everything the UI shows for one workflow, in one read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    /// Canonical name of the workflow queried.
    pub workflow_type: String,
    pub state: FeedbackState,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub has_output: bool,
    pub can_enter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_run_status: Option<RunStatus>,
}

/// Status projection over one session.
pub struct WorkflowStatusView<'a> {
    checkpoints: &'a CheckpointManager,
    tracker: &'a WorkflowRunTracker,
    project_id: String,
    session_id: String,
}

impl<'a> WorkflowStatusView<'a> {
    /// `tracker` must be rooted at the same session directory.
    pub fn new(
        checkpoints: &'a CheckpointManager,
        tracker: &'a WorkflowRunTracker,
        project_id: &str,
        session_id: &str,
    ) -> Self {
        Self {
            checkpoints,
            tracker,
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    /// True if the session belongs to `workflow_type` (alias-aware) and any
    /// of its phase directories holds a non-trivial agent output.
    pub fn has_output(&self, workflow_type: &str) -> bool {
        let manifest = match self.checkpoints.load_session(&self.project_id, &self.session_id) {
            Ok(manifest) => manifest,
            Err(e) => {
                if !e.is_not_found() {
                    tracing::warn!(session = %self.session_id, error = %e, "session manifest unreadable");
                }
                return false;
            }
        };
        self.tracker
            .catalog()
            .equivalent(&manifest.workflow_type, workflow_type)
            && self
                .checkpoints
                .has_agent_output(&self.project_id, &self.session_id)
    }

    pub fn is_locked(&self, workflow_type: &str) -> bool {
        self.tracker.is_locked(workflow_type)
    }

    pub fn feedback_state(&self, workflow_type: &str) -> FeedbackState {
        self.tracker.feedback_state(workflow_type)
    }

    pub fn can_enter(&self, workflow_type: &str) -> bool {
        self.tracker.can_enter(workflow_type)
    }

    pub fn summary(&self, workflow_type: &str) -> WorkflowStatus {
        // An unreadable marker still locks; only its timestamp is lost.
        let locked_at = self.tracker.locks().lock_record(workflow_type).map(|l| l.locked_at);
        WorkflowStatus {
            workflow_type: self.tracker.catalog().canonical(workflow_type.trim()).to_string(),
            state: self.feedback_state(workflow_type),
            locked: self.is_locked(workflow_type),
            locked_at,
            has_output: self.has_output(workflow_type),
            can_enter: self.can_enter(workflow_type),
            latest_run_status: self.tracker.latest_run(workflow_type).map(|r| r.status),
        }
    }

    /// [`summary`](Self::summary) for every workflow in the pipeline, in
    /// pipeline order.
    pub fn pipeline_summary(&self) -> Vec<WorkflowStatus> {
        self.tracker
            .catalog()
            .pipeline()
            .iter()
            .map(|w| self.summary(w))
            .collect()
    }
}
