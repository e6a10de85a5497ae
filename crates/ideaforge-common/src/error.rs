//! Validation errors for the shared domain types.

use thiserror::Error;

/// A value supplied by a caller is outside the recognized domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Invalid phase number {0}: must be between 1 and 7")]
    InvalidPhaseNumber(u8),

    #[error(
        "Invalid phase status '{0}'. Valid values: pending, in_progress, completed, failed, skipped, requires_retry"
    )]
    UnknownPhaseStatus(String),

    #[error("Invalid execution mode '{0}'. Valid values: mvp, full")]
    UnknownExecutionMode(String),

    #[error("Invalid phase execution mode '{0}'. Valid values: single, parallel, sequential_interactive")]
    UnknownPhaseExecutionMode(String),

    #[error("Invalid run status '{0}'. Valid values: running, completed, failed, accepted")]
    UnknownRunStatus(String),

    #[error("Invalid agent status '{0}'. Valid values: pending, running, completed, failed, skipped")]
    UnknownAgentStatus(String),

    #[error("Invalid feedback action '{0}'. Valid values: approved, retry_with_changes, skip_phase")]
    UnknownFeedbackAction(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_phase_number_carries_value() {
        let err = DomainError::InvalidPhaseNumber(9);
        assert!(err.to_string().contains('9'));
        assert!(matches!(err, DomainError::InvalidPhaseNumber(9)));
    }

    #[test]
    fn unknown_status_lists_valid_values() {
        let err = DomainError::UnknownPhaseStatus("done".into());
        let msg = err.to_string();
        assert!(msg.contains("'done'"));
        assert!(msg.contains("requires_retry"));
    }
}
