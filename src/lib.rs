//! Durable state for the ideaforge startup-idea validation pipeline.
//!
//! - [`runlog`]: per-session workflow run log and lock markers
//! - [`checkpoint`]: phase checkpoints, agent outputs, feedback, resume
//! - [`project`]: projects, sessions, versioned requirement snapshots
//! - [`status`]: read projections for UI collaborators
//!
//! All state lives under one data directory (see [`layout`]). Components are
//! plain values constructed with a [`layout::StorageLayout`] or a
//! [`config::Config`]; there is no global state.

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod layout;
pub mod project;
pub mod runlog;
pub mod status;
pub mod telemetry;
pub mod util;

pub use checkpoint::CheckpointManager;
pub use config::Config;
pub use errors::{CheckpointError, ProjectError, RunLogError};
pub use ideaforge_common::{
    DomainError, ExecutionMode, FeedbackState, Phase, PhaseStatus, RunStatus, WorkflowCatalog,
};
pub use layout::StorageLayout;
pub use project::ProjectManager;
pub use runlog::{LockStore, WorkflowRunTracker};
pub use status::WorkflowStatusView;
