use chrono::Utc;
use fs2::FileExt;
use ideaforge_common::{ExecutionMode, ProjectStatus, SessionStatus};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    ChangeKind, ChangelogEntry, CompletionRecord, Project, ProjectMetrics, SessionMetrics,
    SessionSummary,
};
use crate::config::Config;
use crate::errors::ProjectError;
use crate::layout::{self, StorageLayout};
use crate::telemetry::{self, NoopObserver, RunObserver, TelemetryEvent};
use crate::util::{self, LoadOutcome};

/// Exclusive advisory lock on a project's `project.lock`, released on drop.
struct ProjectLock {
    file: File,
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Owns the project → session directory scheme and version allocation.
///
/// Every metadata update runs under the project's file lock, so version
/// numbers stay unique across threads and processes sharing a data root.
pub struct ProjectManager {
    layout: StorageLayout,
    observer: Arc<dyn RunObserver>,
}

impl ProjectManager {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(StorageLayout::new(config.data_dir()))
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Create a project directory and its metadata.
    ///
    /// The id is `project_name` made filesystem-safe, with `_2`, `_3`, ...
    /// appended on collision. Without a usable name a random id is used.
    pub fn create_project(
        &self,
        user_id: &str,
        startup_idea: &str,
        project_name: Option<&str>,
        execution_mode: ExecutionMode,
    ) -> Result<Project, ProjectError> {
        let projects_dir = self.layout.projects_dir();
        fs::create_dir_all(&projects_dir).map_err(|source| ProjectError::Io {
            path: projects_dir.clone(),
            source,
        })?;

        let base = project_name
            .map(util::filesystem_safe_name)
            .filter(|id| id.chars().any(|c| c.is_ascii_alphanumeric()));
        let id = match base {
            Some(base) => self.claim_project_dir(&base)?,
            None => self.claim_random_project_dir()?,
        };

        let now = Utc::now();
        let project = Project {
            id: id.clone(),
            name: project_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(&id)
                .to_string(),
            startup_idea: startup_idea.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
            execution_mode,
            current_version: 0,
            status: ProjectStatus::Active,
            sessions: Vec::new(),
            latest_session_id: None,
            metrics: ProjectMetrics::default(),
            preferences: BTreeMap::new(),
        };

        let outputs_dir = self.layout.outputs_dir(&id);
        fs::create_dir_all(&outputs_dir).map_err(|source| ProjectError::Io {
            path: outputs_dir,
            source,
        })?;
        self.write_project(&project)?;
        self.append_changelog(
            &id,
            &ChangelogEntry::new(ChangeKind::ProjectCreated, format!("Project '{}' created", project.name)),
        )?;

        tracing::info!(project = %id, user = %user_id, mode = %execution_mode, "project created");
        Ok(project)
    }

    /// Allocate a session id, record it, and point `latest_session_id` at it.
    pub fn start_session(
        &self,
        project_id: &str,
        workflow_type: &str,
    ) -> Result<SessionSummary, ProjectError> {
        let summary = SessionSummary {
            session_id: Uuid::new_v4().to_string(),
            workflow_type: workflow_type.trim().to_string(),
            status: SessionStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            version: None,
        };

        let _lock = self.lock_project(project_id)?;
        let mut project = self.load_project(project_id)?;
        let session_dir = self.layout.session_dir(project_id, &summary.session_id);
        fs::create_dir_all(&session_dir).map_err(|source| ProjectError::Io {
            path: session_dir,
            source,
        })?;

        project.sessions.push(summary.clone());
        project.latest_session_id = Some(summary.session_id.clone());
        project.metrics.total_sessions += 1;
        project.touch();
        self.write_project(&project)?;
        self.append_changelog(
            project_id,
            &ChangelogEntry::new(
                ChangeKind::SessionStarted,
                format!("Session started for {}", summary.workflow_type),
            )
            .for_session(&summary.session_id),
        )?;

        tracing::info!(project = %project_id, session = %summary.session_id, workflow = %summary.workflow_type, "session started");
        Ok(summary)
    }

    /// Snapshot `requirements_content` under the next version number and
    /// mark the session completed.
    ///
    /// The version is one past the larger of the stored counter and the
    /// highest snapshot on disk, so a number is never handed out twice even
    /// if an earlier metadata write was lost.
    pub fn complete_session(
        &self,
        project_id: &str,
        session_id: &str,
        requirements_content: &str,
        metrics: Option<SessionMetrics>,
    ) -> Result<CompletionRecord, ProjectError> {
        let _lock = self.lock_project(project_id)?;
        let mut project = self.load_project(project_id)?;
        if project.session(session_id).is_none() {
            return Err(ProjectError::SessionNotFound {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
            });
        }

        let on_disk = self.list_versions(project_id)?.last().copied().unwrap_or(0);
        if on_disk > project.current_version {
            tracing::warn!(
                project = %project_id,
                recorded = project.current_version,
                on_disk,
                "version counter behind snapshots on disk"
            );
        }
        let version = project.current_version.max(on_disk) + 1;

        let outputs_dir = self.layout.outputs_dir(project_id);
        fs::create_dir_all(&outputs_dir).map_err(|source| ProjectError::Io {
            path: outputs_dir,
            source,
        })?;
        let snapshot_path = self.layout.requirements_snapshot(project_id, version);
        let latest_path = self.layout.requirements_latest(project_id);
        write_file(&snapshot_path, requirements_content.as_bytes())?;
        write_file(&latest_path, requirements_content.as_bytes())?;

        let completed_at = Utc::now();
        project.current_version = version;
        if let Some(session) = project.session_mut(session_id) {
            if session.status == SessionStatus::Completed {
                tracing::warn!(session = %session_id, previous = ?session.version, "session completed again");
            }
            session.status = SessionStatus::Completed;
            session.completed_at = Some(completed_at);
            session.version = Some(version);
        }
        project.metrics.accumulate(&metrics.unwrap_or_default());
        project.touch();
        self.write_project(&project)?;

        let content_sha256 = util::sha256_hex(requirements_content.as_bytes());
        let mut entry = ChangelogEntry::new(
            ChangeKind::SessionCompleted,
            format!("Requirements v{} saved", version),
        )
        .for_session(session_id);
        entry.version = Some(version);
        entry.content_sha256 = Some(content_sha256.clone());
        self.append_changelog(project_id, &entry)?;

        tracing::info!(project = %project_id, session = %session_id, version, "session completed");
        telemetry::notify(
            self.observer.as_ref(),
            TelemetryEvent::SessionCompleted {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
                version,
            },
        );

        Ok(CompletionRecord {
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
            version,
            snapshot_path,
            latest_path,
            content_sha256,
            completed_at,
        })
    }

    /// Projects owned by `user_id`, most recently updated first.
    ///
    /// Projects whose metadata cannot be read are skipped with a warning.
    pub fn list_user_projects(
        &self,
        user_id: &str,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<Project>, ProjectError> {
        let projects_dir = self.layout.projects_dir();
        let entries = match fs::read_dir(&projects_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ProjectError::Io {
                    path: projects_dir,
                    source,
                });
            }
        };

        let mut projects: Vec<Project> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let path = entry.path().join(layout::METADATA_FILE);
                match util::read_json::<Project>(&path) {
                    LoadOutcome::Loaded(project) => Some(project),
                    LoadOutcome::Corrupt { reason } => {
                        tracing::warn!(path = %path.display(), %reason, "skipping unreadable project");
                        None
                    }
                    LoadOutcome::Absent => None,
                }
            })
            .filter(|p| p.user_id == user_id)
            .filter(|p| status.is_none_or(|s| p.status == s))
            .collect();
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    pub fn archive_project(&self, project_id: &str) -> Result<Project, ProjectError> {
        let _lock = self.lock_project(project_id)?;
        let mut project = self.load_project(project_id)?;
        project.status = ProjectStatus::Archived;
        project.touch();
        self.write_project(&project)?;
        self.append_changelog(
            project_id,
            &ChangelogEntry::new(ChangeKind::ProjectArchived, "Project archived"),
        )?;
        tracing::info!(project = %project_id, "project archived");
        Ok(project)
    }

    /// Remove the whole project tree. Irreversible.
    pub fn delete_project(&self, project_id: &str) -> Result<(), ProjectError> {
        let dir = self.existing_project_dir(project_id)?;
        fs::remove_dir_all(&dir).map_err(|source| ProjectError::Io { path: dir, source })?;
        tracing::info!(project = %project_id, "project deleted");
        Ok(())
    }

    pub fn load_project(&self, project_id: &str) -> Result<Project, ProjectError> {
        let path = self.layout.metadata_file(project_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProjectError::ProjectNotFound {
                    id: project_id.to_string(),
                });
            }
            Err(source) => return Err(ProjectError::Io { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| ProjectError::CorruptMetadata { path, source })
    }

    /// Merge `preferences` into the project's preference bag.
    pub fn update_preferences(
        &self,
        project_id: &str,
        preferences: BTreeMap<String, Value>,
    ) -> Result<Project, ProjectError> {
        let _lock = self.lock_project(project_id)?;
        let mut project = self.load_project(project_id)?;
        let keys: Vec<String> = preferences.keys().cloned().collect();
        project.preferences.extend(preferences);
        project.touch();
        self.write_project(&project)?;
        self.append_changelog(
            project_id,
            &ChangelogEntry::new(
                ChangeKind::PreferencesUpdated,
                format!("Preferences updated: {}", keys.join(", ")),
            ),
        )?;
        Ok(project)
    }

    /// The session `latest_session_id` points at, for quick resume.
    pub fn latest_session(&self, project_id: &str) -> Result<Option<SessionSummary>, ProjectError> {
        let project = self.load_project(project_id)?;
        Ok(project
            .latest_session_id
            .as_deref()
            .and_then(|id| project.session(id))
            .cloned())
    }

    /// Remove a session's directory and listing. The version counter is
    /// left alone.
    pub fn delete_session(&self, project_id: &str, session_id: &str) -> Result<(), ProjectError> {
        let _lock = self.lock_project(project_id)?;
        let mut project = self.load_project(project_id)?;
        let before = project.sessions.len();
        project.sessions.retain(|s| s.session_id != session_id);
        if project.sessions.len() == before {
            return Err(ProjectError::SessionNotFound {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
            });
        }

        let session_dir = self.layout.session_dir(project_id, session_id);
        if session_dir.exists() {
            fs::remove_dir_all(&session_dir).map_err(|source| ProjectError::Io {
                path: session_dir,
                source,
            })?;
        }
        if project.latest_session_id.as_deref() == Some(session_id) {
            project.latest_session_id = project.sessions.last().map(|s| s.session_id.clone());
        }
        project.touch();
        self.write_project(&project)?;
        self.append_changelog(
            project_id,
            &ChangelogEntry::new(ChangeKind::SessionDeleted, "Session deleted").for_session(session_id),
        )?;
        tracing::info!(project = %project_id, session = %session_id, "session deleted");
        Ok(())
    }

    /// Every changelog entry, oldest first. Malformed lines are skipped.
    pub fn read_changelog(&self, project_id: &str) -> Result<Vec<ChangelogEntry>, ProjectError> {
        self.existing_project_dir(project_id)?;
        let path = self.layout.changelog_file(project_id);
        let content = match util::read_text(&path) {
            LoadOutcome::Loaded(content) => content,
            LoadOutcome::Absent => return Ok(Vec::new()),
            LoadOutcome::Corrupt { reason } => {
                tracing::warn!(path = %path.display(), %reason, "unreadable changelog");
                return Ok(Vec::new());
            }
        };
        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(i, line)| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(path = %path.display(), line = i + 1, error = %e, "skipping malformed changelog line");
                    None
                }
            })
            .collect())
    }

    /// A stored requirements snapshot; `None` reads the latest one.
    pub fn load_requirements(
        &self,
        project_id: &str,
        version: Option<u32>,
    ) -> Result<String, ProjectError> {
        let project = self.load_project(project_id)?;
        let path = match version {
            Some(v) => self.layout.requirements_snapshot(project_id, v),
            None => self.layout.requirements_latest(project_id),
        };
        fs::read_to_string(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ProjectError::VersionNotFound {
                    project_id: project_id.to_string(),
                    version: version.unwrap_or(project.current_version),
                }
            } else {
                ProjectError::Io { path, source }
            }
        })
    }

    /// Snapshot versions present on disk, ascending.
    fn list_versions(&self, project_id: &str) -> Result<Vec<u32>, ProjectError> {
        let outputs_dir = self.layout.outputs_dir(project_id);
        let pattern = format!(
            "{}/requirements_v*.md",
            glob::Pattern::escape(&outputs_dir.to_string_lossy())
        );
        let paths = glob::glob(&pattern).map_err(|e| ProjectError::Io {
            path: outputs_dir.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
        })?;
        let mut versions: Vec<u32> = paths
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(layout::parse_snapshot_version)
            })
            .collect();
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    fn existing_project_dir(&self, project_id: &str) -> Result<PathBuf, ProjectError> {
        let dir = self.layout.project_dir(project_id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(ProjectError::ProjectNotFound {
                id: project_id.to_string(),
            })
        }
    }

    fn lock_project(&self, project_id: &str) -> Result<ProjectLock, ProjectError> {
        self.existing_project_dir(project_id)?;
        let path = self.layout.project_lock_file(project_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| ProjectError::LockFailed {
                path: path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| ProjectError::LockFailed { path, source })?;
        Ok(ProjectLock { file })
    }

    /// Create `projects/<base>` (or the first free `<base>_N`) and return
    /// the id. `create_dir` fails if the directory exists, so two callers
    /// can never claim the same id.
    fn claim_project_dir(&self, base: &str) -> Result<String, ProjectError> {
        let mut suffix = 1u32;
        loop {
            let id = if suffix == 1 {
                base.to_string()
            } else {
                format!("{}_{}", base, suffix)
            };
            if self.try_claim(&id)? {
                return Ok(id);
            }
            suffix += 1;
        }
    }

    fn claim_random_project_dir(&self) -> Result<String, ProjectError> {
        loop {
            let id = format!("project_{}", &Uuid::new_v4().simple().to_string()[..8]);
            if self.try_claim(&id)? {
                return Ok(id);
            }
        }
    }

    fn try_claim(&self, id: &str) -> Result<bool, ProjectError> {
        let dir = self.layout.project_dir(id);
        match fs::create_dir(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(ProjectError::Io { path: dir, source }),
        }
    }

    fn write_project(&self, project: &Project) -> Result<(), ProjectError> {
        let json = serde_json::to_vec_pretty(project)?;
        write_file(&self.layout.metadata_file(&project.id), &json)
    }

    fn append_changelog(&self, project_id: &str, entry: &ChangelogEntry) -> Result<(), ProjectError> {
        let path = self.layout.changelog_file(project_id);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|source| ProjectError::Io { path, source })
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), ProjectError> {
    util::atomic_write(path, content).map_err(|source| ProjectError::Io {
        path: path.to_path_buf(),
        source,
    })
}
