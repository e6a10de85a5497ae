//! Typed error hierarchy for the ideaforge tracking core.
//!
//! Three top-level enums cover the three subsystems:
//! - `RunLogError` — workflow run log and lock markers
//! - `CheckpointError` — per-phase checkpoints, agent outputs, feedback
//! - `ProjectError` — project metadata, sessions, versioned snapshots
//!
//! Degraded reads (corrupt run logs, unreadable feedback files) are not
//! errors; they surface as empty or absent values.

use ideaforge_common::DomainError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the workflow run log and lock store.
#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("Failed to write run log at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write lock marker at {path}: {source}")]
    LockWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize run log: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Run log lock poisoned")]
    LockPoisoned,
}

/// Errors from the checkpoint manager.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Session directory not found: {path}")]
    SessionNotFound { path: PathBuf },

    #[error("Session manifest not found: {path}")]
    ManifestNotFound { path: PathBuf },

    #[error("Phase {phase} directory not found: {path}")]
    PhaseNotFound { phase: u8, path: PathBuf },

    #[error(transparent)]
    InvalidArgument(#[from] DomainError),

    #[error("Phase {phase} is not part of a {mode} session")]
    PhaseNotInMode { phase: u8, mode: String },

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    /// True for the not-found family, which signals a caller sequencing bug.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CheckpointError::SessionNotFound { .. }
                | CheckpointError::ManifestNotFound { .. }
                | CheckpointError::PhaseNotFound { .. }
        )
    }
}

/// Errors from the project and session manager.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Session {session_id} not found in project {project_id}")]
    SessionNotFound {
        project_id: String,
        session_id: String,
    },

    #[error("Requirements version {version} not found for project {project_id}")]
    VersionNotFound { project_id: String, version: u32 },

    #[error(transparent)]
    InvalidArgument(#[from] DomainError),

    #[error("Project metadata at {path} is corrupt: {source}")]
    CorruptMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize project record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to acquire project lock at {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
