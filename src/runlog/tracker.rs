use ideaforge_common::{FeedbackState, RunStatus, WorkflowCatalog};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{LockRecord, LockStore, WorkflowRun};
use crate::errors::RunLogError;
use crate::layout;
use crate::telemetry::{self, NoopObserver, RunObserver, TelemetryEvent};
use crate::util::{self, LoadOutcome};

/// Lifecycle tracker for the workflow runs of one session.
///
/// Every mutating operation holds `write_lock` across the whole
/// read → mutate → write cycle. Queries read without the lock; writes go
/// through a rename, so a reader sees either the previous or the next list.
pub struct WorkflowRunTracker {
    log_path: PathBuf,
    catalog: Arc<WorkflowCatalog>,
    locks: LockStore,
    write_lock: Mutex<()>,
    observer: Arc<dyn RunObserver>,
}

impl WorkflowRunTracker {
    pub fn new(session_dir: impl Into<PathBuf>, catalog: Arc<WorkflowCatalog>) -> Self {
        let session_dir = session_dir.into();
        Self {
            log_path: layout::run_log_file(&session_dir),
            locks: LockStore::new(session_dir, catalog.clone()),
            catalog,
            write_lock: Mutex::new(()),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Report lifecycle events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn session_dir(&self) -> &Path {
        self.locks.session_dir()
    }

    pub fn locks(&self) -> &LockStore {
        &self.locks
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    /// Append a new `running` record.
    pub fn start_run(
        &self,
        workflow_type: &str,
        trigger_type: &str,
    ) -> Result<WorkflowRun, RunLogError> {
        self.start_run_with_metadata(workflow_type, trigger_type, Map::new())
    }

    pub fn start_run_with_metadata(
        &self,
        workflow_type: &str,
        trigger_type: &str,
        trigger_metadata: Map<String, Value>,
    ) -> Result<WorkflowRun, RunLogError> {
        let run = WorkflowRun::new(workflow_type, trigger_type, trigger_metadata);
        let appended = run.clone();
        self.mutate(move |runs| {
            runs.push(appended);
            ((), true)
        })?;

        tracing::info!(run_id = %run.run_id, workflow = %run.workflow_type, trigger = %run.trigger_type, "workflow run started");
        telemetry::notify(
            self.observer.as_ref(),
            TelemetryEvent::RunStarted {
                run_id: run.run_id,
                workflow_type: run.workflow_type.clone(),
                trigger_type: run.trigger_type.clone(),
            },
        );
        Ok(run)
    }

    /// Mark the most recent running record of the workflow's class completed.
    ///
    /// Returns `None`, without writing anything, when no such record exists.
    pub fn complete_run(
        &self,
        workflow_type: &str,
        summary: Option<Map<String, Value>>,
    ) -> Result<Option<WorkflowRun>, RunLogError> {
        let updated = self.transition_running(workflow_type, |run| run.complete(summary))?;
        match &updated {
            Some(run) => {
                tracing::info!(run_id = %run.run_id, workflow = %run.workflow_type, "workflow run completed");
                telemetry::notify(
                    self.observer.as_ref(),
                    TelemetryEvent::RunCompleted {
                        run_id: run.run_id,
                        workflow_type: run.workflow_type.clone(),
                        duration_seconds: run.duration_seconds(),
                    },
                );
            }
            None => tracing::debug!(workflow = %workflow_type, "complete_run: no running record"),
        }
        Ok(updated)
    }

    /// Mark the most recent running record of the workflow's class failed.
    ///
    /// Same no-match semantics as [`complete_run`](Self::complete_run).
    pub fn fail_run(
        &self,
        workflow_type: &str,
        error_message: &str,
    ) -> Result<Option<WorkflowRun>, RunLogError> {
        let updated = self.transition_running(workflow_type, |run| run.fail(error_message))?;
        match &updated {
            Some(run) => {
                tracing::info!(run_id = %run.run_id, workflow = %run.workflow_type, error = %error_message, "workflow run failed");
                telemetry::notify(
                    self.observer.as_ref(),
                    TelemetryEvent::RunFailed {
                        run_id: run.run_id,
                        workflow_type: run.workflow_type.clone(),
                        error: error_message.to_string(),
                    },
                );
            }
            None => tracing::debug!(workflow = %workflow_type, "fail_run: no running record"),
        }
        Ok(updated)
    }

    /// Accept the workflow: write its lock marker, then move its most recent
    /// completed run (if any) to `accepted`.
    pub fn lock(&self, workflow_type: &str) -> Result<LockRecord, RunLogError> {
        let catalog = self.catalog.clone();
        let record = self.mutate(|runs| {
            let record = match self.locks.lock(workflow_type) {
                Ok(record) => record,
                Err(e) => return (Err(e), false),
            };
            let accepted = runs.iter_mut().rev().find(|r| {
                r.status == RunStatus::Completed && catalog.equivalent(&r.workflow_type, workflow_type)
            });
            match accepted {
                Some(run) => {
                    run.accept();
                    (Ok(record), true)
                }
                None => (Ok(record), false),
            }
        })??;

        telemetry::notify(
            self.observer.as_ref(),
            TelemetryEvent::WorkflowLocked {
                workflow_type: record.workflow_type.clone(),
            },
        );
        Ok(record)
    }

    /// Lock marker check only; the run log is not consulted.
    pub fn is_locked(&self, workflow_type: &str) -> bool {
        self.locks.is_locked(workflow_type)
    }

    /// Whether the workflow's pipeline predecessor has been accepted.
    pub fn can_enter(&self, workflow_type: &str) -> bool {
        self.locks.can_enter(workflow_type)
    }

    pub fn feedback_state(&self, workflow_type: &str) -> FeedbackState {
        if self.is_locked(workflow_type) {
            return FeedbackState::Accepted;
        }
        FeedbackState::from_latest_run(self.latest_run(workflow_type).map(|r| r.status))
    }

    /// Locked, or the most recent run finished successfully.
    pub fn is_complete(&self, workflow_type: &str) -> bool {
        self.is_locked(workflow_type)
            || matches!(
                self.latest_run(workflow_type).map(|r| r.status),
                Some(RunStatus::Completed | RunStatus::Accepted)
            )
    }

    /// Remove every record whose type is in `workflow_type`'s class.
    ///
    /// Records of other workflows and lock markers are left alone. Returns the
    /// number of records removed.
    pub fn clear_runs(&self, workflow_type: &str) -> Result<usize, RunLogError> {
        let catalog = self.catalog.clone();
        let removed = self.mutate(|runs| {
            let before = runs.len();
            runs.retain(|r| !catalog.equivalent(&r.workflow_type, workflow_type));
            let removed = before - runs.len();
            (removed, removed > 0)
        })?;
        tracing::info!(workflow = %workflow_type, removed, "workflow runs cleared");
        Ok(removed)
    }

    /// Delete the run log and every lock marker for the session.
    pub fn reset(&self) -> Result<(), RunLogError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RunLogError::LockPoisoned)?;
        if self.log_path.exists() {
            fs::remove_file(&self.log_path).map_err(|source| RunLogError::RemoveFailed {
                path: self.log_path.clone(),
                source,
            })?;
        }
        self.locks.clear()?;
        tracing::info!(session = %self.session_dir().display(), "workflow tracker reset");
        Ok(())
    }

    /// Most recent record in `workflow_type`'s class.
    pub fn latest_run(&self, workflow_type: &str) -> Option<WorkflowRun> {
        self.read_runs()
            .into_iter()
            .rev()
            .find(|r| self.catalog.equivalent(&r.workflow_type, workflow_type))
    }

    pub fn all_runs(&self) -> Vec<WorkflowRun> {
        self.read_runs()
    }

    fn transition_running(
        &self,
        workflow_type: &str,
        apply: impl FnOnce(&mut WorkflowRun),
    ) -> Result<Option<WorkflowRun>, RunLogError> {
        let catalog = self.catalog.clone();
        self.mutate(|runs| {
            let target = runs.iter_mut().rev().find(|r| {
                r.status == RunStatus::Running && catalog.equivalent(&r.workflow_type, workflow_type)
            });
            match target {
                Some(run) => {
                    apply(&mut *run);
                    (Some(run.clone()), true)
                }
                None => (None, false),
            }
        })
    }

    /// Run `f` against the current records under the write lock, persisting
    /// them if `f` reports a change.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Vec<WorkflowRun>) -> (R, bool),
    ) -> Result<R, RunLogError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RunLogError::LockPoisoned)?;
        let mut runs = self.read_runs();
        let (result, changed) = f(&mut runs);
        if changed {
            self.write_runs(&runs)?;
        }
        Ok(result)
    }

    /// Load records, degrading to an empty list on damage.
    ///
    /// Individually malformed entries are dropped; the rest are kept.
    fn read_runs(&self) -> Vec<WorkflowRun> {
        match util::read_json::<Vec<Value>>(&self.log_path) {
            LoadOutcome::Absent => Vec::new(),
            LoadOutcome::Corrupt { reason } => {
                tracing::warn!(path = %self.log_path.display(), %reason, "corrupt run log treated as empty");
                Vec::new()
            }
            LoadOutcome::Loaded(values) => {
                let total = values.len();
                let runs: Vec<WorkflowRun> = values
                    .into_iter()
                    .filter_map(|v| serde_json::from_value(v).ok())
                    .collect();
                if runs.len() < total {
                    tracing::warn!(
                        path = %self.log_path.display(),
                        dropped = total - runs.len(),
                        "malformed run records skipped"
                    );
                }
                runs
            }
        }
    }

    fn write_runs(&self, runs: &[WorkflowRun]) -> Result<(), RunLogError> {
        let json = serde_json::to_vec_pretty(runs)?;
        let session_dir = self.session_dir();
        fs::create_dir_all(session_dir).map_err(|source| RunLogError::WriteFailed {
            path: session_dir.to_path_buf(),
            source,
        })?;
        util::atomic_write(&self.log_path, &json).map_err(|source| RunLogError::WriteFailed {
            path: self.log_path.clone(),
            source,
        })
    }
}
