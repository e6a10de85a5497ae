//! Directory scheme shared by every component.
//!
//! ```text
//! <data_dir>/
//! └── projects/<project_id>/
//!     ├── metadata.json
//!     ├── changelog.jsonl
//!     ├── project.lock
//!     ├── outputs/
//!     │   ├── requirements_v1.md
//!     │   └── requirements_latest.md
//!     └── sessions/<session_id>/
//!         ├── _session.md
//!         ├── workflow_runs.json
//!         ├── workflow_lock_<workflow>_<hash>.json
//!         └── phase_<n>_<slug>/
//!             ├── _checkpoint.md
//!             ├── _user_feedback.md
//!             └── <agent>.md
//! ```

use ideaforge_common::Phase;
use std::path::{Path, PathBuf};

pub const PROJECTS_DIR: &str = "projects";
pub const SESSIONS_DIR: &str = "sessions";
pub const OUTPUTS_DIR: &str = "outputs";
pub const METADATA_FILE: &str = "metadata.json";
pub const CHANGELOG_FILE: &str = "changelog.jsonl";
pub const PROJECT_LOCK_FILE: &str = "project.lock";
pub const SESSION_MANIFEST_FILE: &str = "_session.md";
pub const RUN_LOG_FILE: &str = "workflow_runs.json";
pub const CHECKPOINT_FILE: &str = "_checkpoint.md";
pub const FEEDBACK_FILE: &str = "_user_feedback.md";
pub const LATEST_REQUIREMENTS_FILE: &str = "requirements_latest.md";

/// Files inside a phase directory that are not agent outputs.
pub const PHASE_METADATA_FILES: [&str; 2] = [CHECKPOINT_FILE, FEEDBACK_FILE];

/// Path derivation rooted at one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join(PROJECTS_DIR)
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(project_id)
    }

    pub fn metadata_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(METADATA_FILE)
    }

    pub fn changelog_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(CHANGELOG_FILE)
    }

    pub fn project_lock_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(PROJECT_LOCK_FILE)
    }

    pub fn outputs_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(OUTPUTS_DIR)
    }

    pub fn requirements_snapshot(&self, project_id: &str, version: u32) -> PathBuf {
        self.outputs_dir(project_id)
            .join(format!("requirements_v{}.md", version))
    }

    pub fn requirements_latest(&self, project_id: &str) -> PathBuf {
        self.outputs_dir(project_id).join(LATEST_REQUIREMENTS_FILE)
    }

    pub fn session_dir(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.project_dir(project_id)
            .join(SESSIONS_DIR)
            .join(session_id)
    }

    pub fn session_manifest(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.session_dir(project_id, session_id)
            .join(SESSION_MANIFEST_FILE)
    }

    pub fn phase_dir(&self, project_id: &str, session_id: &str, phase: Phase) -> PathBuf {
        self.session_dir(project_id, session_id)
            .join(phase.dir_name())
    }

    pub fn checkpoint_file(&self, project_id: &str, session_id: &str, phase: Phase) -> PathBuf {
        self.phase_dir(project_id, session_id, phase)
            .join(CHECKPOINT_FILE)
    }

    pub fn feedback_file(&self, project_id: &str, session_id: &str, phase: Phase) -> PathBuf {
        self.phase_dir(project_id, session_id, phase)
            .join(FEEDBACK_FILE)
    }

    /// Agent output file; `agent_file_stem` must already be filesystem-safe.
    pub fn agent_output_file(
        &self,
        project_id: &str,
        session_id: &str,
        phase: Phase,
        agent_file_stem: &str,
    ) -> PathBuf {
        self.phase_dir(project_id, session_id, phase)
            .join(format!("{}.md", agent_file_stem))
    }
}

/// Run log inside a session directory.
pub fn run_log_file(session_dir: &Path) -> PathBuf {
    session_dir.join(RUN_LOG_FILE)
}

/// Lock marker for a workflow name inside a session directory.
///
/// The sanitized name keeps the file recognizable; the hash of the exact
/// name keeps `pricing-study` and `pricing_study` apart.
pub fn lock_marker_file(session_dir: &Path, workflow_type: &str) -> PathBuf {
    let digest = crate::util::sha256_hex(workflow_type.as_bytes());
    session_dir.join(format!(
        "workflow_lock_{}_{}.json",
        crate::util::filesystem_safe_name(workflow_type),
        &digest[..12]
    ))
}

/// Parse the version out of a `requirements_v{N}.md` file name.
pub fn parse_snapshot_version(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("requirements_v")?
        .strip_suffix(".md")?
        .parse()
        .ok()
}
