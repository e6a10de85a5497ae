//! Pipeline phases and the status vocabulary recorded for them.
//!
//! The validation pipeline has seven numbered phases. `mvp` sessions skip
//! Product Strategy and Business Planning (phases 4 and 5).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

/// Lowest valid phase number.
pub const FIRST_PHASE: u8 = 1;
/// Highest valid phase number.
pub const LAST_PHASE: u8 = 7;

/// A numbered stage of the validation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ConceptExpansion,
    MarketResearch,
    NicheSelection,
    ProductStrategy,
    BusinessPlanning,
    Validation,
    FinalSynthesis,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::ConceptExpansion,
        Phase::MarketResearch,
        Phase::NicheSelection,
        Phase::ProductStrategy,
        Phase::BusinessPlanning,
        Phase::Validation,
        Phase::FinalSynthesis,
    ];

    /// Look up a phase by its 1-based number.
    pub fn from_number(number: u8) -> Result<Self, DomainError> {
        if !(FIRST_PHASE..=LAST_PHASE).contains(&number) {
            return Err(DomainError::InvalidPhaseNumber(number));
        }
        Ok(Self::ALL[(number - 1) as usize])
    }

    pub fn number(self) -> u8 {
        match self {
            Phase::ConceptExpansion => 1,
            Phase::MarketResearch => 2,
            Phase::NicheSelection => 3,
            Phase::ProductStrategy => 4,
            Phase::BusinessPlanning => 5,
            Phase::Validation => 6,
            Phase::FinalSynthesis => 7,
        }
    }

    /// Human-readable name, as shown in manifests and checkpoint headings.
    pub fn name(self) -> &'static str {
        match self {
            Phase::ConceptExpansion => "Concept Expansion",
            Phase::MarketResearch => "Market Research",
            Phase::NicheSelection => "Niche Selection",
            Phase::ProductStrategy => "Product Strategy",
            Phase::BusinessPlanning => "Business Planning",
            Phase::Validation => "Validation",
            Phase::FinalSynthesis => "Final Synthesis",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Phase::ConceptExpansion => "concept_expansion",
            Phase::MarketResearch => "market_research",
            Phase::NicheSelection => "niche_selection",
            Phase::ProductStrategy => "product_strategy",
            Phase::BusinessPlanning => "business_planning",
            Phase::Validation => "validation",
            Phase::FinalSynthesis => "final_synthesis",
        }
    }

    /// Directory name for this phase inside a session (e.g. `phase_1_concept_expansion`).
    pub fn dir_name(self) -> String {
        format!("phase_{}_{}", self.number(), self.slug())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {}: {}", self.number(), self.name())
    }
}

/// Which subset of the pipeline a project or session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Reduced pipeline: phases 1, 2, 3, 6, 7.
    #[default]
    Mvp,
    /// All seven phases.
    Full,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Mvp => "mvp",
            ExecutionMode::Full => "full",
        }
    }

    /// Phases run by this mode, in execution order.
    pub fn phases(self) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|p| self.includes(*p))
            .collect()
    }

    pub fn includes(self, phase: Phase) -> bool {
        match self {
            ExecutionMode::Full => true,
            ExecutionMode::Mvp => {
                !matches!(phase, Phase::ProductStrategy | Phase::BusinessPlanning)
            }
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mvp" => Ok(ExecutionMode::Mvp),
            "full" => Ok(ExecutionMode::Full),
            _ => Err(DomainError::UnknownExecutionMode(s.to_string())),
        }
    }
}

/// Lifecycle status of one phase in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    RequiresRetry,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::RequiresRetry => "requires_retry",
        }
    }

    /// True when no further execution is needed for the phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(PhaseStatus::Pending),
            "in_progress" => Ok(PhaseStatus::InProgress),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            "skipped" => Ok(PhaseStatus::Skipped),
            "requires_retry" => Ok(PhaseStatus::RequiresRetry),
            _ => Err(DomainError::UnknownPhaseStatus(s.to_string())),
        }
    }
}

/// How the agents inside a phase were scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseExecutionMode {
    #[default]
    Single,
    Parallel,
    SequentialInteractive,
}

impl PhaseExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseExecutionMode::Single => "single",
            PhaseExecutionMode::Parallel => "parallel",
            PhaseExecutionMode::SequentialInteractive => "sequential_interactive",
        }
    }
}

impl fmt::Display for PhaseExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseExecutionMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "single" => Ok(PhaseExecutionMode::Single),
            "parallel" => Ok(PhaseExecutionMode::Parallel),
            "sequential_interactive" => Ok(PhaseExecutionMode::SequentialInteractive),
            _ => Err(DomainError::UnknownPhaseExecutionMode(s.to_string())),
        }
    }
}

/// Outcome of a single agent run within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    #[default]
    Completed,
    Failed,
    Skipped,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(AgentStatus::Pending),
            "running" | "in_progress" => Ok(AgentStatus::Running),
            "completed" | "success" => Ok(AgentStatus::Completed),
            "failed" | "error" => Ok(AgentStatus::Failed),
            "skipped" => Ok(AgentStatus::Skipped),
            _ => Err(DomainError::UnknownAgentStatus(s.to_string())),
        }
    }
}

/// What the reviewer decided to do with a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    #[default]
    Approved,
    RetryWithChanges,
    SkipPhase,
}

impl FeedbackAction {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackAction::Approved => "approved",
            FeedbackAction::RetryWithChanges => "retry_with_changes",
            FeedbackAction::SkipPhase => "skip_phase",
        }
    }
}

impl fmt::Display for FeedbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approved" => Ok(FeedbackAction::Approved),
            "retry_with_changes" => Ok(FeedbackAction::RetryWithChanges),
            "skip_phase" => Ok(FeedbackAction::SkipPhase),
            _ => Err(DomainError::UnknownFeedbackAction(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_from_number_bounds() {
        assert_eq!(Phase::from_number(1).unwrap(), Phase::ConceptExpansion);
        assert_eq!(Phase::from_number(7).unwrap(), Phase::FinalSynthesis);
        assert_eq!(
            Phase::from_number(0).unwrap_err(),
            DomainError::InvalidPhaseNumber(0)
        );
        assert_eq!(
            Phase::from_number(8).unwrap_err(),
            DomainError::InvalidPhaseNumber(8)
        );
    }

    #[test]
    fn test_phase_number_matches_position() {
        for (idx, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.number() as usize, idx + 1);
            assert_eq!(Phase::from_number(phase.number()).unwrap(), *phase);
        }
    }

    #[test]
    fn test_phase_dir_name() {
        assert_eq!(
            Phase::ConceptExpansion.dir_name(),
            "phase_1_concept_expansion"
        );
        assert_eq!(Phase::FinalSynthesis.dir_name(), "phase_7_final_synthesis");
    }

    #[test]
    fn test_mvp_mode_skips_strategy_and_planning() {
        let numbers: Vec<u8> = ExecutionMode::Mvp
            .phases()
            .into_iter()
            .map(Phase::number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 6, 7]);
        assert_eq!(ExecutionMode::Full.phases().len(), 7);
    }

    #[test]
    fn test_execution_mode_from_str() {
        assert_eq!("mvp".parse::<ExecutionMode>().unwrap(), ExecutionMode::Mvp);
        assert_eq!("FULL".parse::<ExecutionMode>().unwrap(), ExecutionMode::Full);
        let err = "lean".parse::<ExecutionMode>().unwrap_err();
        assert!(err.to_string().contains("Invalid execution mode"));
    }

    #[test]
    fn test_phase_status_display_roundtrip() {
        for status in [
            PhaseStatus::Pending,
            PhaseStatus::InProgress,
            PhaseStatus::Completed,
            PhaseStatus::Failed,
            PhaseStatus::Skipped,
            PhaseStatus::RequiresRetry,
        ] {
            assert_eq!(status.to_string().parse::<PhaseStatus>().unwrap(), status);
        }
        assert!("done".parse::<PhaseStatus>().is_err());
    }

    #[test]
    fn test_phase_execution_mode_accepts_hyphenated() {
        assert_eq!(
            "sequential-interactive"
                .parse::<PhaseExecutionMode>()
                .unwrap(),
            PhaseExecutionMode::SequentialInteractive
        );
    }

    #[test]
    fn test_feedback_action_from_str() {
        assert_eq!(
            "retry_with_changes".parse::<FeedbackAction>().unwrap(),
            FeedbackAction::RetryWithChanges
        );
        assert!("reject".parse::<FeedbackAction>().is_err());
    }

    #[test]
    fn test_phase_status_serde_snake_case() {
        let json = serde_json::to_string(&PhaseStatus::RequiresRetry).unwrap();
        assert_eq!(json, "\"requires_retry\"");
    }
}
