use ideaforge_common::{ExecutionMode, Phase, PhaseStatus, SessionStatus};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use walkdir::WalkDir;

use super::{AgentOutput, PhaseCheckpoint, SessionManifest, UserFeedback, is_approved};
use crate::config::{Config, OutputsConfig};
use crate::errors::CheckpointError;
use crate::layout::{self, StorageLayout};
use crate::telemetry::{self, NoopObserver, RunObserver, TelemetryEvent};
use crate::util::{self, LoadOutcome};

/// Agent outputs keyed by phase, then by agent name.
pub type PhaseOutputs = BTreeMap<u8, BTreeMap<String, String>>;

/// Result of a structural check on one checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

/// What a driver needs to continue a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePlan {
    /// Phases whose checkpoint and manifest row both say `completed`.
    pub completed_phases: Vec<u8>,
    /// Phases where the checkpoint and the manifest disagree. These are
    /// re-executed.
    pub inconsistent_phases: Vec<u8>,
    /// First phase of the session's mode that still needs to run.
    pub next_phase: Option<u8>,
    /// Agent outputs of every completed phase.
    pub context: PhaseOutputs,
}

impl ResumePlan {
    pub fn is_finished(&self) -> bool {
        self.next_phase.is_none()
    }
}

/// Reads and writes the per-phase records of sessions under one data root.
///
/// Manifest updates are serialized through `manifest_lock`, so a checkpoint
/// write and its manifest row never interleave with another writer in the
/// same process.
pub struct CheckpointManager {
    layout: StorageLayout,
    outputs: OutputsConfig,
    manifest_lock: Mutex<()>,
    observer: Arc<dyn RunObserver>,
}

impl CheckpointManager {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            outputs: OutputsConfig::default(),
            manifest_lock: Mutex::new(()),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(StorageLayout::new(config.data_dir())).with_outputs(config.outputs.clone())
    }

    pub fn with_outputs(mut self, outputs: OutputsConfig) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Create the phase directories for `execution_mode` and the session
    /// manifest. An existing manifest is left untouched.
    pub fn create_session(
        &self,
        project_id: &str,
        session_id: &str,
        user_id: &str,
        workflow_type: &str,
        execution_mode: ExecutionMode,
    ) -> Result<PathBuf, CheckpointError> {
        let session_dir = self.layout.session_dir(project_id, session_id);
        for phase in execution_mode.phases() {
            let dir = self.layout.phase_dir(project_id, session_id, phase);
            fs::create_dir_all(&dir)
                .map_err(|source| CheckpointError::WriteFailed { path: dir, source })?;
        }

        let manifest_path = self.layout.session_manifest(project_id, session_id);
        let _guard = self.manifest_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if manifest_path.exists() {
            tracing::debug!(session = %session_id, "session manifest already exists");
        } else {
            let manifest = SessionManifest::new(
                project_id,
                session_id,
                user_id,
                workflow_type,
                execution_mode,
            );
            write_record(&manifest_path, &manifest.to_markdown())?;
            tracing::info!(
                project = %project_id,
                session = %session_id,
                workflow = %workflow_type,
                mode = %execution_mode,
                "session created"
            );
        }
        Ok(session_dir)
    }

    /// Write the phase checkpoint and the matching manifest row.
    ///
    /// The manifest is read before anything is written, so a missing session
    /// leaves no partial state behind. If the manifest write fails, the
    /// checkpoint file is put back the way it was.
    pub fn save_checkpoint(
        &self,
        project_id: &str,
        session_id: &str,
        checkpoint: &PhaseCheckpoint,
    ) -> Result<PathBuf, CheckpointError> {
        let phase = Phase::from_number(checkpoint.phase_num)?;

        let guard = self.manifest_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut manifest = self.read_manifest(project_id, session_id)?;
        if !manifest.execution_mode.includes(phase) {
            return Err(CheckpointError::PhaseNotInMode {
                phase: phase.number(),
                mode: manifest.execution_mode.to_string(),
            });
        }

        let phase_dir = self.layout.phase_dir(project_id, session_id, phase);
        fs::create_dir_all(&phase_dir).map_err(|source| CheckpointError::WriteFailed {
            path: phase_dir.clone(),
            source,
        })?;
        let path = self.layout.checkpoint_file(project_id, session_id, phase);
        let previous = util::read_text(&path).loaded();
        write_record(&path, &checkpoint.to_markdown())?;

        manifest.apply_checkpoint(checkpoint);
        if let Err(e) = write_record(
            &self.layout.session_manifest(project_id, session_id),
            &manifest.to_markdown(),
        ) {
            restore_record(&path, previous.as_deref());
            return Err(e);
        }
        drop(guard);

        tracing::info!(
            project = %project_id,
            session = %session_id,
            phase = phase.number(),
            status = %checkpoint.status,
            "checkpoint saved"
        );
        telemetry::notify(
            self.observer.as_ref(),
            TelemetryEvent::CheckpointSaved {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
                phase: phase.number(),
                status: checkpoint.status,
                duration_seconds: checkpoint.timing.duration(),
                input_tokens: checkpoint.input_tokens(),
                output_tokens: checkpoint.output_tokens(),
                cost_usd: checkpoint.cost_usd(),
            },
        );
        Ok(path)
    }

    /// Write (or overwrite) one agent's output for a phase.
    pub fn save_agent_output(
        &self,
        project_id: &str,
        session_id: &str,
        output: &AgentOutput,
    ) -> Result<PathBuf, CheckpointError> {
        let phase = self.existing_phase_dir(project_id, session_id, output.phase_num)?;
        let path = self.layout.agent_output_file(
            project_id,
            session_id,
            phase,
            &agent_file_stem(&output.agent_name),
        );
        write_record(&path, &output.to_markdown())?;

        tracing::debug!(
            phase = phase.number(),
            agent = %output.agent_name,
            bytes = output.content.len(),
            "agent output saved"
        );
        telemetry::notify(
            self.observer.as_ref(),
            TelemetryEvent::AgentOutputSaved {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
                phase: phase.number(),
                agent_name: output.agent_name.clone(),
                status: output.status,
                input_tokens: output.input_tokens,
                output_tokens: output.output_tokens,
            },
        );
        Ok(path)
    }

    /// Write (or overwrite) the review record for a phase.
    pub fn save_user_feedback(
        &self,
        project_id: &str,
        session_id: &str,
        feedback: &UserFeedback,
    ) -> Result<PathBuf, CheckpointError> {
        let phase = self.existing_phase_dir(project_id, session_id, feedback.phase_num)?;
        let path = self.layout.feedback_file(project_id, session_id, phase);
        write_record(&path, &feedback.to_markdown())?;
        tracing::info!(
            phase = phase.number(),
            approved = feedback.approved,
            action = %feedback.action,
            "user feedback saved"
        );
        Ok(path)
    }

    /// Parse the session manifest.
    pub fn load_session(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<SessionManifest, CheckpointError> {
        self.read_manifest(project_id, session_id)
    }

    /// Flag the session as completed in its manifest.
    pub fn mark_session_completed(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<SessionManifest, CheckpointError> {
        let _guard = self.manifest_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut manifest = self.read_manifest(project_id, session_id)?;
        manifest.status = SessionStatus::Completed;
        manifest.updated_at = chrono::Utc::now();
        write_record(
            &self.layout.session_manifest(project_id, session_id),
            &manifest.to_markdown(),
        )?;
        Ok(manifest)
    }

    /// Agent outputs for `phase_nums`, or for every phase the manifest lists
    /// as completed. Phases without a directory are left out.
    pub fn get_phase_outputs(
        &self,
        project_id: &str,
        session_id: &str,
        phase_nums: Option<&[u8]>,
    ) -> Result<PhaseOutputs, CheckpointError> {
        let phases: Vec<Phase> = match phase_nums {
            Some(nums) => nums
                .iter()
                .map(|n| Phase::from_number(*n))
                .collect::<Result<_, _>>()?,
            None => self
                .read_manifest(project_id, session_id)?
                .completed_phases()
                .into_iter()
                .filter_map(|n| Phase::from_number(n).ok())
                .collect(),
        };
        self.ensure_session(project_id, session_id)?;

        let mut outputs = PhaseOutputs::new();
        for phase in phases {
            let dir = self.layout.phase_dir(project_id, session_id, phase);
            if !dir.is_dir() {
                continue;
            }
            let mut agents = BTreeMap::new();
            for path in agent_output_files(&dir)? {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match util::read_text(&path) {
                    LoadOutcome::Loaded(text) => {
                        let output = AgentOutput::from_markdown(
                            &text,
                            phase.number(),
                            &stem,
                            self.outputs.legacy_output_recovery,
                        );
                        agents.insert(output.agent_name, output.content);
                    }
                    LoadOutcome::Corrupt { reason } => {
                        tracing::warn!(path = %path.display(), %reason, "skipping unreadable agent output");
                    }
                    LoadOutcome::Absent => {}
                }
            }
            outputs.insert(phase.number(), agents);
        }
        Ok(outputs)
    }

    /// Phases whose feedback record says `Approved: true`, ascending.
    ///
    /// Missing or unreadable feedback files exclude their phase.
    pub fn get_approved_phases(&self, project_id: &str, session_id: &str) -> Vec<u8> {
        Phase::ALL
            .into_iter()
            .filter(|phase| {
                let path = self.layout.feedback_file(project_id, session_id, *phase);
                match util::read_text(&path) {
                    LoadOutcome::Loaded(text) => is_approved(&text),
                    LoadOutcome::Corrupt { reason } => {
                        tracing::warn!(path = %path.display(), %reason, "unreadable feedback file");
                        false
                    }
                    LoadOutcome::Absent => false,
                }
            })
            .map(Phase::number)
            .collect()
    }

    /// Check that a phase's checkpoint has every required section and field.
    pub fn validate_checkpoint(
        &self,
        project_id: &str,
        session_id: &str,
        phase_num: u8,
    ) -> Result<ValidationReport, CheckpointError> {
        let phase = Phase::from_number(phase_num)?;
        let path = self.layout.checkpoint_file(project_id, session_id, phase);
        let report = match util::read_text(&path) {
            LoadOutcome::Absent => {
                ValidationReport::invalid(vec![format!("Checkpoint not found: {}", path.display())])
            }
            LoadOutcome::Corrupt { reason } => {
                ValidationReport::invalid(vec![format!("Checkpoint unreadable: {}", reason)])
            }
            LoadOutcome::Loaded(text) => match PhaseCheckpoint::from_markdown(&text) {
                Ok(checkpoint) if checkpoint.phase_num != phase_num => {
                    ValidationReport::invalid(vec![format!(
                        "Checkpoint records phase {} but is stored under phase {}",
                        checkpoint.phase_num, phase_num
                    )])
                }
                Ok(_) => ValidationReport::valid(),
                Err(problems) => ValidationReport::invalid(problems),
            },
        };
        if !report.is_valid {
            tracing::debug!(phase = phase_num, errors = ?report.errors, "checkpoint failed validation");
        }
        Ok(report)
    }

    pub fn load_checkpoint(
        &self,
        project_id: &str,
        session_id: &str,
        phase_num: u8,
    ) -> Result<LoadOutcome<PhaseCheckpoint>, CheckpointError> {
        let phase = Phase::from_number(phase_num)?;
        let path = self.layout.checkpoint_file(project_id, session_id, phase);
        Ok(match util::read_text(&path) {
            LoadOutcome::Loaded(text) => match PhaseCheckpoint::from_markdown(&text) {
                Ok(checkpoint) => LoadOutcome::Loaded(checkpoint),
                Err(problems) => LoadOutcome::Corrupt {
                    reason: problems.join("; "),
                },
            },
            LoadOutcome::Absent => LoadOutcome::Absent,
            LoadOutcome::Corrupt { reason } => LoadOutcome::Corrupt { reason },
        })
    }

    pub fn load_user_feedback(
        &self,
        project_id: &str,
        session_id: &str,
        phase_num: u8,
    ) -> Result<LoadOutcome<UserFeedback>, CheckpointError> {
        let phase = Phase::from_number(phase_num)?;
        let path = self.layout.feedback_file(project_id, session_id, phase);
        Ok(match util::read_text(&path) {
            LoadOutcome::Loaded(text) => match UserFeedback::from_markdown(&text, phase_num) {
                Ok(feedback) => LoadOutcome::Loaded(feedback),
                Err(reason) => LoadOutcome::Corrupt { reason },
            },
            LoadOutcome::Absent => LoadOutcome::Absent,
            LoadOutcome::Corrupt { reason } => LoadOutcome::Corrupt { reason },
        })
    }

    pub fn load_agent_output(
        &self,
        project_id: &str,
        session_id: &str,
        phase_num: u8,
        agent_name: &str,
    ) -> Result<LoadOutcome<AgentOutput>, CheckpointError> {
        let phase = Phase::from_number(phase_num)?;
        let stem = agent_file_stem(agent_name);
        let path = self
            .layout
            .agent_output_file(project_id, session_id, phase, &stem);
        Ok(match util::read_text(&path) {
            LoadOutcome::Loaded(text) => LoadOutcome::Loaded(AgentOutput::from_markdown(
                &text,
                phase_num,
                agent_name,
                self.outputs.legacy_output_recovery,
            )),
            LoadOutcome::Absent => LoadOutcome::Absent,
            LoadOutcome::Corrupt { reason } => LoadOutcome::Corrupt { reason },
        })
    }

    /// Work out where a session picks up again.
    ///
    /// A phase counts as done only when its checkpoint and its manifest row
    /// agree on a terminal status. Disagreements are logged and the phase is
    /// scheduled again.
    pub fn resume_plan(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<ResumePlan, CheckpointError> {
        let manifest = self.read_manifest(project_id, session_id)?;
        let mut completed_phases = Vec::new();
        let mut inconsistent_phases = Vec::new();
        let mut next_phase = None;

        for phase in manifest.execution_mode.phases() {
            let n = phase.number();
            let recorded = manifest.phase_status(n).unwrap_or_default();
            let checkpoint = self.load_checkpoint(project_id, session_id, n)?;
            let agreed = match &checkpoint {
                LoadOutcome::Loaded(cp) if cp.status == recorded => Some(recorded),
                LoadOutcome::Absent if recorded == PhaseStatus::Pending => Some(recorded),
                _ => None,
            };
            match agreed {
                Some(PhaseStatus::Completed) => completed_phases.push(n),
                Some(status) if status.is_terminal() => {}
                Some(_) => {
                    next_phase.get_or_insert(n);
                }
                None => {
                    let found = match &checkpoint {
                        LoadOutcome::Loaded(cp) => cp.status.to_string(),
                        LoadOutcome::Absent => "missing".to_string(),
                        LoadOutcome::Corrupt { .. } => "corrupt".to_string(),
                    };
                    tracing::warn!(
                        session = %session_id,
                        phase = n,
                        manifest = %recorded,
                        checkpoint = %found,
                        "checkpoint and manifest disagree; phase will be re-run"
                    );
                    inconsistent_phases.push(n);
                    next_phase.get_or_insert(n);
                }
            }
        }

        let context = self.get_phase_outputs(project_id, session_id, Some(completed_phases.as_slice()))?;
        Ok(ResumePlan {
            completed_phases,
            inconsistent_phases,
            next_phase,
            context,
        })
    }

    /// True if any phase directory of the session holds an agent output of
    /// at least `outputs.min_output_bytes`.
    pub fn has_agent_output(&self, project_id: &str, session_id: &str) -> bool {
        let session_dir = self.layout.session_dir(project_id, session_id);
        WalkDir::new(&session_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| is_agent_output_path(entry.path()))
            .any(|entry| {
                entry
                    .metadata()
                    .map(|m| m.len() >= self.outputs.min_output_bytes)
                    .unwrap_or(false)
            })
    }

    fn ensure_session(&self, project_id: &str, session_id: &str) -> Result<PathBuf, CheckpointError> {
        let dir = self.layout.session_dir(project_id, session_id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(CheckpointError::SessionNotFound { path: dir })
        }
    }

    fn existing_phase_dir(
        &self,
        project_id: &str,
        session_id: &str,
        phase_num: u8,
    ) -> Result<Phase, CheckpointError> {
        let phase = Phase::from_number(phase_num)?;
        self.ensure_session(project_id, session_id)?;
        let dir = self.layout.phase_dir(project_id, session_id, phase);
        if !dir.is_dir() {
            return Err(CheckpointError::PhaseNotFound {
                phase: phase_num,
                path: dir,
            });
        }
        Ok(phase)
    }

    fn read_manifest(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<SessionManifest, CheckpointError> {
        self.ensure_session(project_id, session_id)?;
        let path = self.layout.session_manifest(project_id, session_id);
        let text = match util::read_text(&path) {
            LoadOutcome::Loaded(text) => text,
            LoadOutcome::Absent => return Err(CheckpointError::ManifestNotFound { path }),
            LoadOutcome::Corrupt { reason } => {
                tracing::warn!(path = %path.display(), %reason, "unreadable session manifest; rebuilding from defaults");
                String::new()
            }
        };
        let (manifest, warnings) = SessionManifest::parse(&text, project_id, session_id);
        for warning in &warnings {
            tracing::warn!(path = %path.display(), %warning, "session manifest degraded");
        }
        Ok(manifest)
    }
}

fn write_record(path: &Path, content: &str) -> Result<(), CheckpointError> {
    util::atomic_write(path, content.as_bytes()).map_err(|source| CheckpointError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Best-effort rollback of a record to its earlier content, or removal when
/// there was none.
fn restore_record(path: &Path, previous: Option<&str>) {
    let result = match previous {
        Some(text) => util::atomic_write(path, text.as_bytes()),
        None => fs::remove_file(path),
    };
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "could not roll back checkpoint");
    }
}

/// File stem for an agent's output. Never starts with `_`, which is reserved
/// for phase metadata files.
fn agent_file_stem(agent_name: &str) -> String {
    let safe = util::filesystem_safe_name(agent_name);
    match safe.trim_start_matches('_') {
        "" => "agent".to_string(),
        stem => stem.to_string(),
    }
}

fn is_agent_output_path(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let in_phase_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("phase_"));
    in_phase_dir
        && name.ends_with(".md")
        && !name.starts_with('_')
        && !layout::PHASE_METADATA_FILES.contains(&name)
}

fn agent_output_files(phase_dir: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
    let entries = fs::read_dir(phase_dir).map_err(|source| CheckpointError::ReadFailed {
        path: phase_dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_agent_output_path(path))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{AgentExecution, PhaseTiming};
    use crate::telemetry::testing::{FailingObserver, RecordingObserver};
    use ideaforge_common::{AgentStatus, DomainError, FeedbackAction};
    use tempfile::tempdir;

    const PROJECT: &str = "acme";
    const SESSION: &str = "s1";

    fn make_manager() -> (CheckpointManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(StorageLayout::new(dir.path()));
        (manager, dir)
    }

    fn with_session(mode: ExecutionMode) -> (CheckpointManager, tempfile::TempDir) {
        let (manager, dir) = make_manager();
        manager
            .create_session(PROJECT, SESSION, "user-1", "idea-validation", mode)
            .unwrap();
        (manager, dir)
    }

    fn completed(phase_num: u8) -> PhaseCheckpoint {
        PhaseCheckpoint::new(phase_num, PhaseStatus::Completed).with_agents(vec![
            AgentExecution::new("concept_expansion", AgentStatus::Completed).with_tokens(10, 20),
        ])
    }

    #[test]
    fn test_create_session_materializes_mode_phases() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let layout = manager.layout();
        assert!(layout.phase_dir(PROJECT, SESSION, Phase::ConceptExpansion).is_dir());
        assert!(layout.phase_dir(PROJECT, SESSION, Phase::FinalSynthesis).is_dir());
        assert!(!layout.phase_dir(PROJECT, SESSION, Phase::ProductStrategy).exists());

        let manifest = manager.load_session(PROJECT, SESSION).unwrap();
        assert_eq!(manifest.execution_mode, ExecutionMode::Mvp);
        assert_eq!(manifest.user_id, "user-1");
        assert_eq!(manifest.phases.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 6, 7]);
    }

    #[test]
    fn test_create_session_full_mode_and_existing_manifest_kept() {
        let (manager, _dir) = with_session(ExecutionMode::Full);
        manager.save_checkpoint(PROJECT, SESSION, &completed(4)).unwrap();
        manager
            .create_session(PROJECT, SESSION, "user-1", "idea-validation", ExecutionMode::Full)
            .unwrap();
        let manifest = manager.load_session(PROJECT, SESSION).unwrap();
        assert_eq!(manifest.phases.len(), 7);
        assert_eq!(manifest.phase_status(4), Some(PhaseStatus::Completed));
    }

    #[test]
    fn test_save_checkpoint_updates_manifest() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        for status in [PhaseStatus::InProgress, PhaseStatus::Failed, PhaseStatus::Completed] {
            manager
                .save_checkpoint(PROJECT, SESSION, &PhaseCheckpoint::new(2, status))
                .unwrap();
            let manifest = manager.load_session(PROJECT, SESSION).unwrap();
            assert_eq!(manifest.phase_statuses()[&2], status);
            assert_eq!(manifest.current_phase, 2);
        }
        let loaded = manager.load_checkpoint(PROJECT, SESSION, 2).unwrap();
        assert_eq!(loaded.loaded().unwrap().status, PhaseStatus::Completed);
    }

    #[test]
    fn test_save_checkpoint_errors() {
        let (manager, _dir) = make_manager();
        let err = manager
            .save_checkpoint(PROJECT, SESSION, &completed(1))
            .unwrap_err();
        assert!(err.is_not_found());

        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let err = manager
            .save_checkpoint(PROJECT, SESSION, &completed(8))
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::InvalidArgument(DomainError::InvalidPhaseNumber(8))
        ));
        let err = manager
            .save_checkpoint(PROJECT, SESSION, &completed(4))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::PhaseNotInMode { phase: 4, .. }));
    }

    #[test]
    fn test_save_checkpoint_without_manifest_writes_nothing() {
        let (manager, _dir) = make_manager();
        let session_dir = manager.layout().session_dir(PROJECT, SESSION);
        fs::create_dir_all(&session_dir).unwrap();
        let err = manager
            .save_checkpoint(PROJECT, SESSION, &completed(1))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::ManifestNotFound { .. }));
        assert!(
            !manager
                .layout()
                .checkpoint_file(PROJECT, SESSION, Phase::ConceptExpansion)
                .exists()
        );
    }

    #[test]
    fn test_validate_checkpoint() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        manager.save_checkpoint(PROJECT, SESSION, &completed(1)).unwrap();
        assert_eq!(
            manager.validate_checkpoint(PROJECT, SESSION, 1).unwrap(),
            ValidationReport::valid()
        );

        let missing = manager.validate_checkpoint(PROJECT, SESSION, 2).unwrap();
        assert!(!missing.is_valid);
        assert!(missing.errors[0].starts_with("Checkpoint not found"));

        let path = manager
            .layout()
            .checkpoint_file(PROJECT, SESSION, Phase::MarketResearch);
        fs::write(&path, "# Checkpoint\n\n## Status\n\n- Phase: 2\n").unwrap();
        let broken = manager.validate_checkpoint(PROJECT, SESSION, 2).unwrap();
        assert!(!broken.is_valid);
        assert!(broken.errors.iter().any(|e| e == "Missing field: Status"));

        assert!(manager.validate_checkpoint(PROJECT, SESSION, 0).is_err());
    }

    #[test]
    fn test_validate_checkpoint_detects_misfiled_phase() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let text = completed(3).to_markdown();
        let path = manager
            .layout()
            .checkpoint_file(PROJECT, SESSION, Phase::ConceptExpansion);
        fs::write(&path, text).unwrap();
        let report = manager.validate_checkpoint(PROJECT, SESSION, 1).unwrap();
        assert!(!report.is_valid);
    }

    #[test]
    fn test_save_agent_output_requires_phase_dir() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let err = manager
            .save_agent_output(PROJECT, SESSION, &AgentOutput::new(4, "strategist", "text"))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::PhaseNotFound { phase: 4, .. }));
    }

    #[test]
    fn test_agent_output_overwrites_and_is_returned() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        manager
            .save_agent_output(PROJECT, SESSION, &AgentOutput::new(1, "Concept Expansion", "first"))
            .unwrap();
        let path = manager
            .save_agent_output(PROJECT, SESSION, &AgentOutput::new(1, "Concept Expansion", "second"))
            .unwrap();
        assert!(path.ends_with("phase_1_concept_expansion/concept_expansion.md"));

        manager.save_checkpoint(PROJECT, SESSION, &completed(1)).unwrap();
        manager
            .save_user_feedback(PROJECT, SESSION, &UserFeedback::new(1, FeedbackAction::Approved))
            .unwrap();

        let outputs = manager.get_phase_outputs(PROJECT, SESSION, None).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[&1].len(), 1);
        assert_eq!(outputs[&1]["Concept Expansion"], "second");

        let loaded = manager
            .load_agent_output(PROJECT, SESSION, 1, "Concept Expansion")
            .unwrap()
            .loaded()
            .unwrap();
        assert_eq!(loaded.content, "second");
    }

    #[test]
    fn test_get_phase_outputs_explicit_phases() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        manager
            .save_agent_output(PROJECT, SESSION, &AgentOutput::new(2, "market_research", "TAM"))
            .unwrap();
        let outputs = manager
            .get_phase_outputs(PROJECT, SESSION, Some(&[2, 3][..]))
            .unwrap();
        assert_eq!(outputs[&2]["market_research"], "TAM");
        assert!(outputs[&3].is_empty());

        assert!(manager.get_phase_outputs(PROJECT, SESSION, Some(&[0][..])).is_err());
        assert!(
            manager
                .get_phase_outputs(PROJECT, "missing", Some(&[1][..]))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_json_agent_output_round_trips_verbatim() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let json = r#"{"verdict": "GO", "result": "short", "reasoning": "long analysis"}"#;
        manager
            .save_agent_output(PROJECT, SESSION, &AgentOutput::new(3, "market_research", json))
            .unwrap();

        let outputs = manager.get_phase_outputs(PROJECT, SESSION, Some(&[3][..])).unwrap();
        assert_eq!(outputs[&3]["market_research"], json);
    }

    #[test]
    fn test_failed_manifest_write_rolls_back_checkpoint() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        manager.save_checkpoint(PROJECT, SESSION, &completed(1)).unwrap();

        let manifest = manager.layout().session_manifest(PROJECT, SESSION);
        fs::remove_file(&manifest).unwrap();
        fs::create_dir(&manifest).unwrap();

        let retry = PhaseCheckpoint::new(1, PhaseStatus::RequiresRetry);
        assert!(manager.save_checkpoint(PROJECT, SESSION, &retry).is_err());
        let kept = manager.load_checkpoint(PROJECT, SESSION, 1).unwrap().loaded().unwrap();
        assert_eq!(kept.status, PhaseStatus::Completed);

        assert!(manager.save_checkpoint(PROJECT, SESSION, &completed(2)).is_err());
        assert!(matches!(
            manager.load_checkpoint(PROJECT, SESSION, 2).unwrap(),
            LoadOutcome::Absent
        ));
    }

    #[test]
    fn test_legacy_recovery_follows_config() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let path = manager
            .layout()
            .agent_output_file(PROJECT, SESSION, Phase::ConceptExpansion, "concept");
        fs::write(&path, "## Output\n\nTaskOutput(raw='Recovered\\ntext')\n").unwrap();

        let outputs = manager.get_phase_outputs(PROJECT, SESSION, Some(&[1][..])).unwrap();
        assert_eq!(outputs[&1]["concept"], "Recovered\ntext");

        let strict = CheckpointManager::new(manager.layout().clone()).with_outputs(OutputsConfig {
            legacy_output_recovery: false,
            ..OutputsConfig::default()
        });
        let outputs = strict.get_phase_outputs(PROJECT, SESSION, Some(&[1][..])).unwrap();
        assert!(outputs[&1]["concept"].starts_with("TaskOutput("));
    }

    #[test]
    fn test_approved_phases_skip_unreadable_feedback() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let layout = manager.layout();
        fs::write(
            layout.feedback_file(PROJECT, SESSION, Phase::ConceptExpansion),
            "# Feedback\n\n- Approved: true\n",
        )
        .unwrap();
        fs::write(
            layout.feedback_file(PROJECT, SESSION, Phase::MarketResearch),
            [0xff, 0xfe, 0x00],
        )
        .unwrap();
        manager
            .save_user_feedback(
                PROJECT,
                SESSION,
                &UserFeedback::new(3, FeedbackAction::RetryWithChanges),
            )
            .unwrap();
        assert_eq!(manager.get_approved_phases(PROJECT, SESSION), vec![1]);
        assert!(
            manager
                .load_user_feedback(PROJECT, SESSION, 2)
                .unwrap()
                .is_corrupt()
        );
        assert!(manager.get_approved_phases(PROJECT, "missing").is_empty());
    }

    #[test]
    fn test_resume_plan_requires_agreement() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        manager.save_checkpoint(PROJECT, SESSION, &completed(1)).unwrap();
        manager
            .save_agent_output(PROJECT, SESSION, &AgentOutput::new(1, "concept_expansion", "idea"))
            .unwrap();
        manager.save_checkpoint(PROJECT, SESSION, &completed(2)).unwrap();

        // Checkpoint for phase 2 regresses without the manifest knowing.
        let path = manager
            .layout()
            .checkpoint_file(PROJECT, SESSION, Phase::MarketResearch);
        fs::write(
            &path,
            PhaseCheckpoint::new(2, PhaseStatus::Failed).to_markdown(),
        )
        .unwrap();

        let plan = manager.resume_plan(PROJECT, SESSION).unwrap();
        assert_eq!(plan.completed_phases, vec![1]);
        assert_eq!(plan.inconsistent_phases, vec![2]);
        assert_eq!(plan.next_phase, Some(2));
        assert_eq!(plan.context[&1]["concept_expansion"], "idea");
        assert!(!plan.is_finished());
    }

    #[test]
    fn test_resume_plan_skipped_phase_and_finish() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        for n in [1, 2, 3, 6, 7] {
            let checkpoint = if n == 3 {
                PhaseCheckpoint::new(n, PhaseStatus::Skipped)
            } else {
                completed(n)
            };
            manager.save_checkpoint(PROJECT, SESSION, &checkpoint).unwrap();
        }
        let plan = manager.resume_plan(PROJECT, SESSION).unwrap();
        assert_eq!(plan.completed_phases, vec![1, 2, 6, 7]);
        assert!(plan.is_finished());
    }

    #[test]
    fn test_corrupt_manifest_degrades() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        let path = manager.layout().session_manifest(PROJECT, SESSION);
        fs::write(&path, "not a manifest").unwrap();
        let manifest = manager.load_session(PROJECT, SESSION).unwrap();
        assert_eq!(manifest.session_id, SESSION);
        assert!(manifest.completed_phases().is_empty());

        // A checkpoint save repairs it.
        manager.save_checkpoint(PROJECT, SESSION, &completed(1)).unwrap();
        let (reparsed, warnings) =
            SessionManifest::parse(&fs::read_to_string(&path).unwrap(), "x", "y");
        assert!(warnings.is_empty());
        assert_eq!(reparsed.completed_phases(), vec![1]);
    }

    #[test]
    fn test_mark_session_completed() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        manager.mark_session_completed(PROJECT, SESSION).unwrap();
        assert_eq!(
            manager.load_session(PROJECT, SESSION).unwrap().status,
            SessionStatus::Completed
        );
    }

    #[test]
    fn test_has_agent_output_ignores_metadata_and_small_files() {
        let (manager, _dir) = with_session(ExecutionMode::Mvp);
        manager.save_checkpoint(PROJECT, SESSION, &completed(1)).unwrap();
        assert!(!manager.has_agent_output(PROJECT, SESSION));

        let small = manager
            .layout()
            .agent_output_file(PROJECT, SESSION, Phase::ConceptExpansion, "tiny");
        fs::write(&small, "ok").unwrap();
        assert!(!manager.has_agent_output(PROJECT, SESSION));

        manager
            .save_agent_output(
                PROJECT,
                SESSION,
                &AgentOutput::new(1, "concept_expansion", "A full paragraph of output."),
            )
            .unwrap();
        assert!(manager.has_agent_output(PROJECT, SESSION));
    }

    #[test]
    fn test_observer_receives_events_and_failures_are_ignored() {
        let observer = Arc::new(RecordingObserver::default());
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(StorageLayout::new(dir.path()))
            .with_observer(observer.clone());
        manager
            .create_session(PROJECT, SESSION, "u", "idea-validation", ExecutionMode::Mvp)
            .unwrap();
        let checkpoint = completed(1).with_timing(PhaseTiming::default());
        manager.save_checkpoint(PROJECT, SESSION, &checkpoint).unwrap();
        manager
            .save_agent_output(PROJECT, SESSION, &AgentOutput::new(1, "a", "b"))
            .unwrap();
        let events = observer.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            TelemetryEvent::CheckpointSaved { phase: 1, input_tokens: 10, .. }
        ));

        let failing = CheckpointManager::new(StorageLayout::new(dir.path()))
            .with_observer(Arc::new(FailingObserver));
        assert!(failing.save_checkpoint(PROJECT, SESSION, &completed(2)).is_ok());
    }

    #[test]
    fn test_agent_file_stem() {
        assert_eq!(agent_file_stem("Market Research"), "market_research");
        assert_eq!(agent_file_stem("_checkpoint"), "checkpoint");
        assert_eq!(agent_file_stem("  "), "agent");
    }
}
