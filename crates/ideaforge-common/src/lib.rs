//! Shared domain types for ideaforge.
//!
//! Nothing in this crate touches the filesystem; the storage side lives in
//! the `ideaforge` crate.

pub mod error;
pub mod phase;
pub mod session;
pub mod workflow;

pub use error::DomainError;
pub use phase::{
    AgentStatus, ExecutionMode, FeedbackAction, Phase, PhaseExecutionMode, PhaseStatus,
};
pub use session::{ProjectStatus, SessionStatus};
pub use workflow::{AliasClass, FeedbackState, RunStatus, WorkflowCatalog};
