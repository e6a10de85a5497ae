//! Workflow types, run statuses, and alias resolution.
//!
//! Workflow type names are free-form strings. Some were renamed over time
//! (`discovery` became `idea-validation`, `architect` became
//! `mvp-specification`), so every lookup goes through [`WorkflowCatalog`],
//! which groups names into equivalence classes. Two names denote the same
//! workflow iff they resolve to the same canonical name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

pub const IDEA_VALIDATION: &str = "idea-validation";
pub const MVP_SPECIFICATION: &str = "mvp-specification";
pub const TECHNICAL_DESIGN: &str = "technical-design";
pub const STORY_GENERATION: &str = "story-generation";

/// Status of one workflow run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Accepted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Accepted => "accepted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "accepted" => Ok(RunStatus::Accepted),
            _ => Err(DomainError::UnknownRunStatus(s.to_string())),
        }
    }
}

/// What the UI should offer for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackState {
    NotStarted,
    Running,
    /// Output exists and is awaiting the user's review.
    Feedback,
    Accepted,
}

impl FeedbackState {
    /// Derive the state from the most recent run, ignoring locks.
    ///
    /// Callers must check the lock marker first; a lock always wins.
    pub fn from_latest_run(status: Option<RunStatus>) -> Self {
        match status {
            Some(RunStatus::Completed) => FeedbackState::Feedback,
            Some(RunStatus::Running) => FeedbackState::Running,
            Some(RunStatus::Accepted) => FeedbackState::Accepted,
            Some(RunStatus::Failed) | None => FeedbackState::NotStarted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackState::NotStarted => "not_started",
            FeedbackState::Running => "running",
            FeedbackState::Feedback => "feedback",
            FeedbackState::Accepted => "accepted",
        }
    }
}

impl fmt::Display for FeedbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One equivalence class of workflow names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasClass {
    /// The current name; lock markers and new records use it.
    pub canonical: String,
    /// Historical names that denote the same workflow.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl AliasClass {
    pub fn new(canonical: &str, aliases: &[&str]) -> Self {
        Self {
            canonical: canonical.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.canonical == name || self.aliases.iter().any(|a| a == name)
    }
}

/// The built-in rename history.
pub fn builtin_alias_classes() -> Vec<AliasClass> {
    vec![
        AliasClass::new(IDEA_VALIDATION, &["discovery"]),
        AliasClass::new(MVP_SPECIFICATION, &["architect"]),
    ]
}

/// The default order in which workflows gate one another.
pub fn default_pipeline() -> Vec<String> {
    [
        IDEA_VALIDATION,
        MVP_SPECIFICATION,
        TECHNICAL_DESIGN,
        STORY_GENERATION,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Single resolver for workflow identity and ordering.
///
/// Every component that compares workflow names must go through
/// [`WorkflowCatalog::equivalent`] or [`WorkflowCatalog::canonical`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowCatalog {
    classes: Vec<AliasClass>,
    pipeline: Vec<String>,
}

impl Default for WorkflowCatalog {
    fn default() -> Self {
        Self {
            classes: builtin_alias_classes(),
            pipeline: default_pipeline(),
        }
    }
}

impl WorkflowCatalog {
    /// Built-in classes extended with `extra`.
    ///
    /// A class whose canonical name matches an existing class merges its
    /// aliases into it. When a name ends up in two classes, the first one
    /// wins.
    pub fn with_aliases(extra: impl IntoIterator<Item = AliasClass>) -> Self {
        let mut catalog = Self::default();
        for class in extra {
            catalog.add_class(class);
        }
        catalog
    }

    /// Replace the gating order. Entries are stored by canonical name.
    pub fn with_pipeline(mut self, pipeline: Vec<String>) -> Self {
        let resolved = pipeline
            .iter()
            .map(|w| self.canonical(w.trim()).to_string())
            .filter(|w| !w.is_empty())
            .collect();
        self.pipeline = resolved;
        self
    }

    fn add_class(&mut self, class: AliasClass) {
        if let Some(existing) = self
            .classes
            .iter_mut()
            .find(|c| c.canonical == class.canonical)
        {
            for alias in class.aliases {
                if !existing.aliases.contains(&alias) {
                    existing.aliases.push(alias);
                }
            }
        } else {
            self.classes.push(class);
        }
    }

    pub fn classes(&self) -> &[AliasClass] {
        &self.classes
    }

    pub fn pipeline(&self) -> &[String] {
        &self.pipeline
    }

    /// Canonical name for `name`; unknown names are their own class.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        let name = name.trim();
        self.classes
            .iter()
            .find(|c| c.contains(name))
            .map(|c| c.canonical.as_str())
            .unwrap_or(name)
    }

    pub fn equivalent(&self, a: &str, b: &str) -> bool {
        self.canonical(a) == self.canonical(b)
    }

    /// Every name in `name`'s class, canonical first.
    pub fn class_of<'a>(&'a self, name: &'a str) -> Vec<&'a str> {
        let name = name.trim();
        match self.classes.iter().find(|c| c.contains(name)) {
            Some(class) => std::iter::once(class.canonical.as_str())
                .chain(class.aliases.iter().map(String::as_str))
                .collect(),
            None => vec![name],
        }
    }

    /// The workflow that must be locked before `name` may be entered.
    pub fn predecessor(&self, name: &str) -> Option<&str> {
        let canonical = self.canonical(name);
        let idx = self.pipeline.iter().position(|w| w == canonical)?;
        idx.checked_sub(1).map(|prev| self.pipeline[prev].as_str())
    }

    /// Names claimed by more than one class.
    pub fn conflicting_names(&self) -> Vec<String> {
        let mut seen: Vec<&str> = Vec::new();
        let mut conflicts = Vec::new();
        for class in &self.classes {
            let mut members = vec![class.canonical.as_str()];
            members.extend(class.aliases.iter().map(String::as_str));
            members.dedup();
            for member in members {
                if seen.contains(&member) {
                    if !conflicts.iter().any(|c| c == member) {
                        conflicts.push(member.to_string());
                    }
                } else {
                    seen.push(member);
                }
            }
        }
        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_builtin_aliases_resolve_both_directions() {
        let catalog = WorkflowCatalog::default();
        assert_eq!(catalog.canonical("discovery"), IDEA_VALIDATION);
        assert_eq!(catalog.canonical(IDEA_VALIDATION), IDEA_VALIDATION);
        assert!(catalog.equivalent("discovery", "idea-validation"));
        assert!(catalog.equivalent("idea-validation", "discovery"));
        assert!(catalog.equivalent("architect", "mvp-specification"));
        assert!(!catalog.equivalent("discovery", "architect"));
    }

    #[test]
    fn test_unknown_workflow_is_its_own_class() {
        let catalog = WorkflowCatalog::default();
        assert_eq!(catalog.canonical("pricing-study"), "pricing-study");
        assert_eq!(catalog.class_of("pricing-study"), vec!["pricing-study"]);
        assert!(!catalog.equivalent("pricing-study", "discovery"));
    }

    #[test]
    fn test_class_of_lists_canonical_first() {
        let catalog = WorkflowCatalog::default();
        assert_eq!(
            catalog.class_of("discovery"),
            vec!["idea-validation", "discovery"]
        );
    }

    #[test]
    fn test_with_aliases_merges_into_existing_class() {
        let catalog =
            WorkflowCatalog::with_aliases(vec![AliasClass::new(IDEA_VALIDATION, &["ideation"])]);
        assert!(catalog.equivalent("ideation", "discovery"));
        assert_eq!(catalog.classes().len(), 2);
    }

    #[test]
    fn test_predecessor_follows_pipeline() {
        let catalog = WorkflowCatalog::default();
        assert_eq!(catalog.predecessor(IDEA_VALIDATION), None);
        assert_eq!(catalog.predecessor("architect"), Some(IDEA_VALIDATION));
        assert_eq!(catalog.predecessor(STORY_GENERATION), Some(TECHNICAL_DESIGN));
        assert_eq!(catalog.predecessor("unlisted"), None);
    }

    #[test]
    fn test_with_pipeline_stores_canonical_names() {
        let catalog = WorkflowCatalog::default()
            .with_pipeline(vec!["discovery".into(), "architect".into()]);
        assert_eq!(catalog.pipeline(), &["idea-validation", "mvp-specification"]);
    }

    #[test]
    fn test_conflicting_names_detected() {
        let catalog = WorkflowCatalog::with_aliases(vec![AliasClass::new(
            "market-scan",
            &["discovery"],
        )]);
        assert_eq!(catalog.conflicting_names(), vec!["discovery".to_string()]);
        // First class wins.
        assert_eq!(catalog.canonical("discovery"), IDEA_VALIDATION);
    }

    #[test]
    fn test_feedback_state_from_latest_run() {
        assert_eq!(
            FeedbackState::from_latest_run(Some(RunStatus::Completed)),
            FeedbackState::Feedback
        );
        assert_eq!(
            FeedbackState::from_latest_run(Some(RunStatus::Failed)),
            FeedbackState::NotStarted
        );
        assert_eq!(FeedbackState::from_latest_run(None), FeedbackState::NotStarted);
    }

    proptest! {
        #[test]
        fn prop_equivalence_is_symmetric(a in "[a-z-]{1,16}", pick in 0usize..4) {
            let catalog = WorkflowCatalog::default();
            let known = ["discovery", "idea-validation", "architect", "mvp-specification"];
            let b = known[pick];
            prop_assert_eq!(catalog.equivalent(&a, b), catalog.equivalent(b, &a));
        }

        #[test]
        fn prop_canonical_is_idempotent(name in "[a-z-]{1,16}") {
            let catalog = WorkflowCatalog::default();
            let once = catalog.canonical(&name).to_string();
            prop_assert_eq!(catalog.canonical(&once), once.as_str());
        }
    }
}
