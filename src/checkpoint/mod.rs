//! Per-phase checkpoints, agent outputs, user feedback and the session
//! manifest.
//!
//! Every record is a markdown file a person can read, written through
//! [`markdown::Builder`] and read back through [`markdown::Document`]. The
//! manifest's phase table is held as a [`BTreeMap`] and re-rendered whole on
//! every update; rows are never edited in place.

use chrono::{DateTime, Utc};
use ideaforge_common::{
    AgentStatus, ExecutionMode, FeedbackAction, Phase, PhaseExecutionMode, PhaseStatus,
    SessionStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

pub mod extract;
pub mod manager;
pub mod markdown;

pub use manager::{CheckpointManager, ResumePlan, ValidationReport};

use markdown::{Builder, Document, Section};

const AGENT_TABLE_HEADERS: [&str; 7] = [
    "Agent",
    "Status",
    "Duration (s)",
    "Input Tokens",
    "Output Tokens",
    "Model",
    "Cost (USD)",
];

const PHASE_TABLE_HEADERS: [&str; 6] = [
    "Phase",
    "Name",
    "Status",
    "Duration (s)",
    "Tokens",
    "Cost (USD)",
];

fn phase_label(phase_num: u8) -> String {
    match Phase::from_number(phase_num) {
        Ok(phase) => format!("Phase {} - {}", phase_num, phase.name()),
        Err(_) => format!("Phase {}", phase_num),
    }
}

fn format_seconds(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| markdown::NONE_VALUE.to_string())
}

fn format_cost(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.4}", v))
        .unwrap_or_else(|| markdown::NONE_VALUE.to_string())
}

fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match markdown::optional(value) {
        Some(v) => DateTime::parse_from_rfc3339(v)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|_| format!("Invalid timestamp: {}", v)),
        None => Ok(None),
    }
}

fn parse_number<T: FromStr>(value: Option<&str>) -> Result<Option<T>, String> {
    match markdown::optional(value) {
        Some(v) => v
            .replace(',', "")
            .parse()
            .map(Some)
            .map_err(|_| format!("Invalid number: {}", v)),
        None => Ok(None),
    }
}

/// Record a field-level parse problem and carry on without the value.
fn note<T>(problems: &mut Vec<String>, result: Result<Option<T>, String>) -> Option<T> {
    result.unwrap_or_else(|problem| {
        problems.push(problem);
        None
    })
}

fn sum_costs<I: IntoIterator<Item = Option<f64>>>(costs: I) -> Option<f64> {
    costs
        .into_iter()
        .flatten()
        .fold(None, |acc, c| Some(acc.unwrap_or(0.0) + c))
}

/// Summary of one agent's run inside a phase checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl AgentExecution {
    pub fn new(agent_name: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            agent_name: agent_name.into(),
            status,
            duration_seconds: None,
            input_tokens: 0,
            output_tokens: 0,
            model: None,
            cost_usd: None,
        }
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.agent_name.clone(),
            self.status.to_string(),
            format_seconds(self.duration_seconds),
            self.input_tokens.to_string(),
            self.output_tokens.to_string(),
            self.model
                .clone()
                .unwrap_or_else(|| markdown::NONE_VALUE.to_string()),
            format_cost(self.cost_usd),
        ]
    }

    fn from_row(row: &[String]) -> Result<Self, String> {
        let cell = |i: usize| row.get(i).map(String::as_str);
        let name = cell(0)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| "Agent row without a name".to_string())?;
        let status = cell(1)
            .ok_or_else(|| format!("Agent '{}' has no status", name))?
            .parse::<AgentStatus>()
            .map_err(|e| format!("Agent '{}': {}", name, e))?;
        Ok(Self {
            agent_name: name.to_string(),
            status,
            duration_seconds: parse_number(cell(2))?,
            input_tokens: parse_number(cell(3))?.unwrap_or(0),
            output_tokens: parse_number(cell(4))?.unwrap_or(0),
            model: markdown::optional(cell(5)).map(str::to_string),
            cost_usd: parse_number(cell(6))?,
        })
    }
}

/// Wall-clock bounds of a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl PhaseTiming {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn between(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_seconds: None,
        }
    }

    /// Explicit duration, or the span between start and completion.
    pub fn duration(&self) -> Option<f64> {
        self.duration_seconds.or_else(|| {
            let (start, end) = (self.started_at?, self.completed_at?);
            Some((end - start).num_milliseconds() as f64 / 1000.0)
        })
    }
}

/// Persisted outcome of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub phase_num: u8,
    pub status: PhaseStatus,
    pub execution_mode: PhaseExecutionMode,
    pub retry_count: u32,
    pub timing: PhaseTiming,
    pub agents: Vec<AgentExecution>,
    pub errors: Vec<String>,
}

impl PhaseCheckpoint {
    pub fn new(phase_num: u8, status: PhaseStatus) -> Self {
        Self {
            phase_num,
            status,
            execution_mode: PhaseExecutionMode::default(),
            retry_count: 0,
            timing: PhaseTiming::default(),
            agents: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_agents(mut self, agents: Vec<AgentExecution>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_timing(mut self, timing: PhaseTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_execution_mode(mut self, mode: PhaseExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn input_tokens(&self) -> u64 {
        self.agents.iter().map(|a| a.input_tokens).sum()
    }

    pub fn output_tokens(&self) -> u64 {
        self.agents.iter().map(|a| a.output_tokens).sum()
    }

    pub fn cost_usd(&self) -> Option<f64> {
        sum_costs(self.agents.iter().map(|a| a.cost_usd))
    }

    pub fn to_markdown(&self) -> String {
        let rows: Vec<Vec<String>> = self.agents.iter().map(AgentExecution::to_row).collect();
        Builder::new(&format!("Checkpoint: {}", phase_label(self.phase_num)))
            .section("Status")
            .field("Phase", self.phase_num)
            .field("Status", self.status)
            .field("Execution Mode", self.execution_mode)
            .field("Retry Count", self.retry_count)
            .section("Timing")
            .optional_field("Started At", self.timing.started_at.map(|t| t.to_rfc3339()))
            .optional_field(
                "Completed At",
                self.timing.completed_at.map(|t| t.to_rfc3339()),
            )
            .field("Duration Seconds", format_seconds(self.timing.duration()))
            .section("Metrics")
            .field("Input Tokens", self.input_tokens())
            .field("Output Tokens", self.output_tokens())
            .field("Total Tokens", self.input_tokens() + self.output_tokens())
            .field("Cost USD", format_cost(self.cost_usd()))
            .section("Agents")
            .table(&AGENT_TABLE_HEADERS, &rows, "No agents recorded.")
            .section("Errors")
            .bullets(self.errors.iter().map(String::as_str), "No errors.")
            .finish()
    }

    /// Parse a checkpoint file, collecting every structural problem found.
    pub fn from_markdown(text: &str) -> Result<Self, Vec<String>> {
        let doc = Document::parse(text);
        let mut problems = Vec::new();

        for required in ["Status", "Timing", "Agents", "Errors"] {
            if doc.section(required).is_none() {
                problems.push(format!("Missing section: {}", required));
            }
        }

        let mut required_field = |key: &str| match doc.field("Status", key) {
            Some(v) if !v.is_empty() => Some(v),
            _ => {
                problems.push(format!("Missing field: {}", key));
                None
            }
        };
        let phase_field = required_field("Phase");
        let status_field = required_field("Status");
        let mode_field = required_field("Execution Mode");

        let phase_num = phase_field.and_then(|v| match v.parse::<u8>() {
            Ok(n) if Phase::from_number(n).is_ok() => Some(n),
            _ => {
                problems.push(format!("Invalid phase number: {}", v));
                None
            }
        });
        let status = status_field.and_then(|v| match v.parse::<PhaseStatus>() {
            Ok(s) => Some(s),
            Err(e) => {
                problems.push(e.to_string());
                None
            }
        });
        let execution_mode = mode_field.and_then(|v| match v.parse::<PhaseExecutionMode>() {
            Ok(m) => Some(m),
            Err(e) => {
                problems.push(e.to_string());
                None
            }
        });

        let retry_count = note(
            &mut problems,
            parse_number::<u32>(doc.field("Status", "Retry Count")),
        );
        let started_at = note(&mut problems, parse_time(doc.field("Timing", "Started At")));
        let completed_at = note(&mut problems, parse_time(doc.field("Timing", "Completed At")));
        let duration_seconds = note(
            &mut problems,
            parse_number::<f64>(doc.field("Timing", "Duration Seconds")),
        );

        let mut agents = Vec::new();
        if let Some(section) = doc.section("Agents") {
            for row in section.table_rows() {
                match AgentExecution::from_row(&row) {
                    Ok(agent) => agents.push(agent),
                    Err(problem) => problems.push(problem),
                }
            }
        }
        let errors: Vec<String> = doc
            .section("Errors")
            .map(|s| s.bullets().into_iter().map(str::to_string).collect())
            .unwrap_or_default();

        match (phase_num, status, execution_mode) {
            (Some(phase_num), Some(status), Some(execution_mode)) if problems.is_empty() => {
                Ok(Self {
                    phase_num,
                    status,
                    execution_mode,
                    retry_count: retry_count.unwrap_or(0),
                    timing: PhaseTiming {
                        started_at,
                        completed_at,
                        duration_seconds,
                    },
                    agents,
                    errors,
                })
            }
            _ => Err(problems),
        }
    }
}

/// Failure detail attached to an agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

/// `Output Format` value written by [`AgentOutput::to_markdown`].
const VERBATIM_OUTPUT_FORMAT: &str = "verbatim";

/// One agent's result within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub phase_num: u8,
    pub agent_name: String,
    pub content: String,
    pub status: AgentStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tools_used: Vec<String>,
    pub error: Option<AgentFailure>,
}

impl AgentOutput {
    pub fn new(phase_num: u8, agent_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            phase_num,
            agent_name: agent_name.into(),
            content: content.into(),
            status: AgentStatus::Completed,
            executed_at: Some(Utc::now()),
            duration_seconds: None,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            tools_used: Vec::new(),
            error: None,
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools_used = tools;
        self
    }

    pub fn with_error(
        mut self,
        error_type: impl Into<String>,
        message: impl Into<String>,
        stack_trace: Option<String>,
    ) -> Self {
        self.error = Some(AgentFailure {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace,
        });
        self
    }

    pub fn to_markdown(&self) -> String {
        let tools = (!self.tools_used.is_empty()).then(|| self.tools_used.join(", "));
        let mut builder = Builder::new(&format!("Agent Output: {}", self.agent_name))
            .section("Metadata")
            .field("Agent", &self.agent_name)
            .field("Phase", self.phase_num)
            .field("Phase Label", phase_label(self.phase_num))
            .optional_field("Executed At", self.executed_at.map(|t| t.to_rfc3339()))
            .field("Status", self.status)
            .field("Duration Seconds", format_seconds(self.duration_seconds))
            .optional_field("Model", self.model.as_deref())
            .field("Input Tokens", self.input_tokens)
            .field("Output Tokens", self.output_tokens)
            .optional_field("Tools Used", tools)
            .field("Output Format", VERBATIM_OUTPUT_FORMAT)
            .section("Output")
            .text(&self.content);

        if let Some(error) = &self.error {
            builder = builder
                .section("Error Details")
                .field("Error Type", &error.error_type)
                .field("Error Message", &error.message);
            if let Some(trace) = &error.stack_trace {
                builder = builder.text(&format!("\n### Stack Trace\n\n```text\n{}\n```", trace.trim_end()));
            }
        }
        builder.finish()
    }

    /// Parse an agent output file. Missing metadata falls back to defaults;
    /// `fallback_name` is used when the file does not name its agent.
    pub fn from_markdown(
        text: &str,
        phase_num: u8,
        fallback_name: &str,
        legacy_recovery: bool,
    ) -> Self {
        let doc = Document::parse(text);
        let meta = |key: &str| markdown::optional(doc.field("Metadata", key));

        let mut content = extract::primary_output(text);
        // Files stamped by this writer hold the output verbatim, even when it
        // happens to look like an object dump.
        let verbatim = meta("Output Format") == Some(VERBATIM_OUTPUT_FORMAT);
        if legacy_recovery && !verbatim {
            content = extract::recover_legacy_output(&content);
        }

        let error = extract::error_details_region(text).and_then(|region| {
            let section = Section {
                heading: "Error Details".to_string(),
                lines: region.lines().map(str::to_string).collect(),
            };
            let error_type = section.field("Error Type")?.to_string();
            Some(AgentFailure {
                error_type,
                message: section.field("Error Message").unwrap_or_default().to_string(),
                stack_trace: stack_trace(&region),
            })
        });

        Self {
            phase_num,
            agent_name: meta("Agent").unwrap_or(fallback_name).to_string(),
            content,
            status: meta("Status")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            executed_at: parse_time(meta("Executed At")).ok().flatten(),
            duration_seconds: parse_number(meta("Duration Seconds")).ok().flatten(),
            model: meta("Model").map(str::to_string),
            input_tokens: parse_number(meta("Input Tokens")).ok().flatten().unwrap_or(0),
            output_tokens: parse_number(meta("Output Tokens")).ok().flatten().unwrap_or(0),
            tools_used: meta("Tools Used")
                .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            error,
        }
    }
}

fn stack_trace(region: &str) -> Option<String> {
    let after = region.split_once("### Stack Trace")?.1;
    let body: Vec<&str> = after
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("```"))
        .skip(1)
        .take_while(|l| !l.trim_start().starts_with("```"))
        .collect();
    let trace = body.join("\n");
    (!trace.trim().is_empty()).then_some(trace)
}

/// A reviewer's verdict on one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    pub phase_num: u8,
    pub reviewed: bool,
    pub approved: bool,
    pub action: FeedbackAction,
    pub comments: Option<String>,
    pub requested_changes: Vec<String>,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl UserFeedback {
    /// A reviewed record whose approval follows `action`.
    pub fn new(phase_num: u8, action: FeedbackAction) -> Self {
        Self {
            phase_num,
            reviewed: true,
            approved: action == FeedbackAction::Approved,
            action,
            comments: None,
            requested_changes: Vec::new(),
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn with_requested_changes(mut self, changes: Vec<String>) -> Self {
        self.requested_changes = changes;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn to_markdown(&self) -> String {
        Builder::new(&format!("User Feedback: {}", phase_label(self.phase_num)))
            .section("Review")
            .field("Phase", self.phase_num)
            .field("Reviewed", self.reviewed)
            .field("Approved", self.approved)
            .field("Action Taken", self.action)
            .field("Retry Count", self.retry_count)
            .field("Timestamp", self.timestamp.to_rfc3339())
            .section("Comments")
            .text(
                self.comments
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or(NO_COMMENTS),
            )
            .section("Requested Changes")
            .bullets(
                self.requested_changes.iter().map(String::as_str),
                "None requested.",
            )
            .finish()
    }

    pub fn from_markdown(text: &str, phase_num: u8) -> Result<Self, String> {
        let doc = Document::parse(text);
        let review = doc
            .section("Review")
            .ok_or_else(|| "Missing section: Review".to_string())?;
        let flag = |key: &str| review.field(key).map(|v| v == "true");
        let approved = flag("Approved").ok_or_else(|| "Missing field: Approved".to_string())?;
        let action = match review.field("Action Taken") {
            Some(v) => v.parse::<FeedbackAction>().map_err(|e| e.to_string())?,
            None if approved => FeedbackAction::Approved,
            None => FeedbackAction::RetryWithChanges,
        };
        let comments = doc
            .section("Comments")
            .map(Section::text)
            .filter(|c| !c.is_empty() && c != NO_COMMENTS);
        Ok(Self {
            phase_num,
            reviewed: flag("Reviewed").unwrap_or(true),
            approved,
            action,
            comments,
            requested_changes: doc
                .section("Requested Changes")
                .map(|s| s.bullets().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
            retry_count: parse_number(review.field("Retry Count"))?.unwrap_or(0),
            timestamp: parse_time(review.field("Timestamp"))?.unwrap_or_else(Utc::now),
        })
    }
}

const NO_COMMENTS: &str = "_No comments._";

/// True only if the text carries an `Approved` field whose value is exactly
/// `true`.
pub fn is_approved(feedback_text: &str) -> bool {
    let all = Section {
        heading: String::new(),
        lines: feedback_text.lines().map(str::to_string).collect(),
    };
    all.field("Approved") == Some("true")
}

/// One row of the manifest's phase table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRow {
    pub status: PhaseStatus,
    pub duration_seconds: Option<f64>,
    pub tokens: u64,
    pub cost_usd: Option<f64>,
}

/// Parsed `_session.md`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub project_id: String,
    pub session_id: String,
    pub user_id: String,
    pub workflow_type: String,
    pub execution_mode: ExecutionMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_phase: u8,
    pub phases: BTreeMap<u8, PhaseRow>,
}

impl SessionManifest {
    pub fn new(
        project_id: &str,
        session_id: &str,
        user_id: &str,
        workflow_type: &str,
        execution_mode: ExecutionMode,
    ) -> Self {
        let now = Utc::now();
        let phases = execution_mode
            .phases()
            .into_iter()
            .map(|p| (p.number(), PhaseRow::default()))
            .collect();
        Self {
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            workflow_type: workflow_type.to_string(),
            execution_mode,
            status: SessionStatus::InProgress,
            created_at: now,
            updated_at: now,
            current_phase: ideaforge_common::phase::FIRST_PHASE,
            phases,
        }
    }

    pub fn phase_statuses(&self) -> BTreeMap<u8, PhaseStatus> {
        self.phases.iter().map(|(n, row)| (*n, row.status)).collect()
    }

    pub fn phase_status(&self, phase_num: u8) -> Option<PhaseStatus> {
        self.phases.get(&phase_num).map(|row| row.status)
    }

    /// Phases the manifest records as completed, ascending.
    pub fn completed_phases(&self) -> Vec<u8> {
        self.phases
            .iter()
            .filter(|(_, row)| row.status == PhaseStatus::Completed)
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn total_tokens(&self) -> u64 {
        self.phases.values().map(|r| r.tokens).sum()
    }

    pub fn total_cost_usd(&self) -> Option<f64> {
        sum_costs(self.phases.values().map(|r| r.cost_usd))
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.phases.values().filter_map(|r| r.duration_seconds).sum()
    }

    /// Replace the row for `checkpoint`'s phase and move the current-phase
    /// pointer to it.
    pub fn apply_checkpoint(&mut self, checkpoint: &PhaseCheckpoint) {
        self.phases.insert(
            checkpoint.phase_num,
            PhaseRow {
                status: checkpoint.status,
                duration_seconds: checkpoint.timing.duration(),
                tokens: checkpoint.input_tokens() + checkpoint.output_tokens(),
                cost_usd: checkpoint.cost_usd(),
            },
        );
        self.current_phase = checkpoint.phase_num;
        self.updated_at = Utc::now();
    }

    pub fn to_markdown(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .phases
            .iter()
            .map(|(n, row)| {
                vec![
                    n.to_string(),
                    Phase::from_number(*n)
                        .map(|p| p.name().to_string())
                        .unwrap_or_default(),
                    row.status.to_string(),
                    format_seconds(row.duration_seconds),
                    row.tokens.to_string(),
                    format_cost(row.cost_usd),
                ]
            })
            .collect();
        let completed: Vec<String> = self
            .completed_phases()
            .iter()
            .map(u8::to_string)
            .collect();

        Builder::new("Session Manifest")
            .section("Metadata")
            .field("Project ID", &self.project_id)
            .field("Session ID", &self.session_id)
            .field("User ID", &self.user_id)
            .field("Workflow Type", &self.workflow_type)
            .field("Execution Mode", self.execution_mode)
            .field("Status", self.status)
            .field("Created At", self.created_at.to_rfc3339())
            .field("Updated At", self.updated_at.to_rfc3339())
            .field("Current Phase", self.current_phase)
            .section("Phase Status")
            .table(&PHASE_TABLE_HEADERS, &rows, "No phases.")
            .section("Metrics")
            .optional_field(
                "Completed Phases",
                (!completed.is_empty()).then(|| completed.join(", ")),
            )
            .field(
                "Total Duration Seconds",
                format!("{:.2}", self.total_duration_seconds()),
            )
            .field("Total Tokens", self.total_tokens())
            .field("Total Cost USD", format_cost(self.total_cost_usd()))
            .finish()
    }

    /// Lenient parse. Missing identity fields fall back to the ids the
    /// caller addressed the session by; unusable rows are dropped and every
    /// phase of the execution mode ends up with a row. Returns the problems
    /// found alongside the manifest.
    pub fn parse(text: &str, project_id: &str, session_id: &str) -> (Self, Vec<String>) {
        let doc = Document::parse(text);
        let mut warnings = Vec::new();
        let meta = |key: &str| markdown::optional(doc.field("Metadata", key));

        let mut phases = BTreeMap::new();
        if let Some(section) = doc.section("Phase Status") {
            for row in section.table_rows() {
                match parse_phase_row(&row) {
                    Ok((n, parsed)) => {
                        phases.insert(n, parsed);
                    }
                    Err(problem) => warnings.push(problem),
                }
            }
        } else {
            warnings.push("Missing section: Phase Status".to_string());
        }

        let execution_mode = match meta("Execution Mode").map(str::parse::<ExecutionMode>) {
            Some(Ok(mode)) => mode,
            other => {
                let inferred = if phases.keys().any(|n| {
                    Phase::from_number(*n).is_ok_and(|p| !ExecutionMode::Mvp.includes(p))
                }) {
                    ExecutionMode::Full
                } else {
                    ExecutionMode::Mvp
                };
                warnings.push(match other {
                    Some(Err(e)) => format!("{}; assuming {}", e, inferred),
                    _ => format!("Missing field: Execution Mode; assuming {}", inferred),
                });
                inferred
            }
        };
        for phase in execution_mode.phases() {
            phases.entry(phase.number()).or_default();
        }

        let created_at = parse_time(meta("Created At")).ok().flatten();
        let updated_at = parse_time(meta("Updated At")).ok().flatten();
        let now = Utc::now();
        let manifest = Self {
            project_id: meta("Project ID").unwrap_or(project_id).to_string(),
            session_id: meta("Session ID").unwrap_or(session_id).to_string(),
            user_id: meta("User ID").unwrap_or_default().to_string(),
            workflow_type: meta("Workflow Type").unwrap_or_default().to_string(),
            execution_mode,
            status: meta("Status")
                .and_then(SessionStatus::parse)
                .unwrap_or_default(),
            created_at: created_at.unwrap_or(now),
            updated_at: updated_at.or(created_at).unwrap_or(now),
            current_phase: meta("Current Phase")
                .and_then(|v| v.parse().ok())
                .filter(|n| Phase::from_number(*n).is_ok())
                .unwrap_or(ideaforge_common::phase::FIRST_PHASE),
            phases,
        };
        (manifest, warnings)
    }
}

fn parse_phase_row(row: &[String]) -> Result<(u8, PhaseRow), String> {
    let cell = |i: usize| row.get(i).map(String::as_str);
    let number = cell(0).unwrap_or_default();
    let phase_num = number
        .parse::<u8>()
        .ok()
        .filter(|n| Phase::from_number(*n).is_ok())
        .ok_or_else(|| format!("Invalid phase row: {}", number))?;
    let status = cell(2)
        .unwrap_or_default()
        .parse::<PhaseStatus>()
        .map_err(|e| format!("Phase {}: {}", phase_num, e))?;
    Ok((
        phase_num,
        PhaseRow {
            status,
            duration_seconds: parse_number(cell(3)).ok().flatten(),
            tokens: parse_number(cell(4)).ok().flatten().unwrap_or(0),
            cost_usd: parse_number(cell(5)).ok().flatten(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_checkpoint() -> PhaseCheckpoint {
        let start = Utc::now() - Duration::seconds(90);
        PhaseCheckpoint::new(2, PhaseStatus::Completed)
            .with_execution_mode(PhaseExecutionMode::Parallel)
            .with_retry_count(1)
            .with_timing(PhaseTiming::between(start, start + Duration::seconds(90)))
            .with_agents(vec![
                AgentExecution::new("market_research", AgentStatus::Completed)
                    .with_tokens(1200, 800)
                    .with_duration(42.5)
                    .with_model("gpt-4o")
                    .with_cost(0.0125),
                AgentExecution::new("competitor_scan", AgentStatus::Failed),
            ])
            .with_errors(vec!["competitor_scan: rate limited".into()])
    }

    #[test]
    fn test_checkpoint_markdown_parses_back() {
        let checkpoint = sample_checkpoint();
        let text = checkpoint.to_markdown();
        assert!(text.starts_with("# Checkpoint: Phase 2 - Market Research"));

        let parsed = PhaseCheckpoint::from_markdown(&text).unwrap();
        assert_eq!(parsed.phase_num, 2);
        assert_eq!(parsed.status, PhaseStatus::Completed);
        assert_eq!(parsed.execution_mode, PhaseExecutionMode::Parallel);
        assert_eq!(parsed.retry_count, 1);
        assert_eq!(parsed.agents.len(), 2);
        assert_eq!(parsed.agents[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(parsed.agents[1].status, AgentStatus::Failed);
        assert_eq!(parsed.input_tokens(), 1200);
        assert_eq!(parsed.timing.duration(), Some(90.0));
        assert_eq!(parsed.errors, vec!["competitor_scan: rate limited"]);
    }

    #[test]
    fn test_checkpoint_reports_every_problem() {
        let text = "# Checkpoint\n\n## Status\n\n- Phase: 9\n- Status: done\n";
        let problems = PhaseCheckpoint::from_markdown(text).unwrap_err();
        assert!(problems.iter().any(|p| p == "Missing section: Agents"));
        assert!(problems.iter().any(|p| p == "Invalid phase number: 9"));
        assert!(problems.iter().any(|p| p.contains("done")));
        assert!(problems.iter().any(|p| p == "Missing field: Execution Mode"));
    }

    #[test]
    fn test_checkpoint_rejects_bad_agent_status() {
        let mut text = PhaseCheckpoint::new(1, PhaseStatus::Completed)
            .with_agents(vec![AgentExecution::new("concept", AgentStatus::Completed)])
            .to_markdown();
        text = text.replace("| concept | completed |", "| concept | exploded |");
        let problems = PhaseCheckpoint::from_markdown(&text).unwrap_err();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("Agent 'concept'"));
    }

    #[test]
    fn test_agent_output_parses_back() {
        let output = AgentOutput::new(1, "concept_expansion", "## Idea\nAI tutor\n\n## Audience\nStudents")
            .with_model("claude")
            .with_tokens(10, 20)
            .with_tools(vec!["web_search".into(), "scraper".into()])
            .with_error("Timeout", "took too long", Some("frame 1\nframe 2".into()));
        let text = output.to_markdown();
        let parsed = AgentOutput::from_markdown(&text, 1, "ignored", true);

        assert_eq!(parsed.agent_name, "concept_expansion");
        assert_eq!(parsed.content, "## Idea\nAI tutor\n\n## Audience\nStudents");
        assert_eq!(parsed.tools_used, vec!["web_search", "scraper"]);
        assert_eq!(parsed.output_tokens, 20);
        let error = parsed.error.unwrap();
        assert_eq!(error.error_type, "Timeout");
        assert_eq!(error.message, "took too long");
        assert_eq!(error.stack_trace.as_deref(), Some("frame 1\nframe 2"));
    }

    #[test]
    fn test_agent_output_legacy_dump_toggle() {
        let text = "## Output\n\nTaskOutput(raw='Line one\\nLine two')\n";
        let recovered = AgentOutput::from_markdown(text, 3, "niche", true);
        assert_eq!(recovered.agent_name, "niche");
        assert_eq!(recovered.content, "Line one\nLine two");

        let untouched = AgentOutput::from_markdown(text, 3, "niche", false);
        assert_eq!(untouched.content, "TaskOutput(raw='Line one\\nLine two')");
    }

    #[test]
    fn test_agent_output_json_content_survives_reparse() {
        let json = r#"{"verdict": "GO", "result": "short", "reasoning": "long analysis"}"#;
        let text = AgentOutput::new(2, "market_research", json).to_markdown();
        let parsed = AgentOutput::from_markdown(&text, 2, "market_research", true);
        assert_eq!(parsed.content, json);
    }

    #[test]
    fn test_legacy_dump_with_old_metadata_is_recovered() {
        let text = "## Metadata\n\n- Agent: niche\n\n## Output\n\n{'raw': 'Niche text'}\n";
        let parsed = AgentOutput::from_markdown(text, 3, "fallback", true);
        assert_eq!(parsed.agent_name, "niche");
        assert_eq!(parsed.content, "Niche text");
    }

    #[test]
    fn test_feedback_markdown_parses_back() {
        let feedback = UserFeedback::new(3, FeedbackAction::RetryWithChanges)
            .with_comments("Narrow the niche.")
            .with_requested_changes(vec!["focus on B2B".into()])
            .with_retry_count(2);
        let parsed = UserFeedback::from_markdown(&feedback.to_markdown(), 3).unwrap();
        assert!(!parsed.approved);
        assert_eq!(parsed.action, FeedbackAction::RetryWithChanges);
        assert_eq!(parsed.comments.as_deref(), Some("Narrow the niche."));
        assert_eq!(parsed.requested_changes, vec!["focus on B2B"]);
        assert_eq!(parsed.retry_count, 2);

        let approved = UserFeedback::new(1, FeedbackAction::Approved);
        let parsed = UserFeedback::from_markdown(&approved.to_markdown(), 1).unwrap();
        assert!(parsed.approved);
        assert!(parsed.comments.is_none());
        assert!(parsed.requested_changes.is_empty());
    }

    #[test]
    fn test_is_approved_requires_exact_true() {
        assert!(is_approved("- Approved: true\n"));
        assert!(is_approved("## Review\n- **Approved**: true"));
        assert!(!is_approved("- Approved: True\n"));
        assert!(!is_approved("- Approved: yes\n"));
        assert!(!is_approved("Approved: true\n"));
        assert!(!is_approved(""));
    }

    #[test]
    fn test_manifest_apply_and_parse_back() {
        let mut manifest =
            SessionManifest::new("acme", "s1", "u1", "idea-validation", ExecutionMode::Mvp);
        assert_eq!(manifest.phases.len(), 5);
        manifest.apply_checkpoint(&sample_checkpoint());
        assert_eq!(manifest.current_phase, 2);

        let (parsed, warnings) = SessionManifest::parse(&manifest.to_markdown(), "x", "y");
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert_eq!(parsed.project_id, "acme");
        assert_eq!(parsed.session_id, "s1");
        assert_eq!(parsed.phase_status(2), Some(PhaseStatus::Completed));
        assert_eq!(parsed.completed_phases(), vec![2]);
        assert_eq!(parsed.total_tokens(), 2000);
        assert_eq!(parsed.current_phase, 2);
    }

    #[test]
    fn test_manifest_parse_is_lenient() {
        let (manifest, warnings) = SessionManifest::parse("garbage", "acme", "s1");
        assert_eq!(manifest.project_id, "acme");
        assert_eq!(manifest.execution_mode, ExecutionMode::Mvp);
        assert_eq!(manifest.phases.len(), 5);
        assert!(manifest.completed_phases().is_empty());
        assert!(!warnings.is_empty());

        let text = "## Metadata\n\n- Execution Mode: turbo\n\n## Phase Status\n\n\
                    | Phase | Name | Status |\n| --- | --- | --- |\n\
                    | 4 | Product Strategy | completed |\n| 2 | Market Research | bogus |\n";
        let (manifest, warnings) = SessionManifest::parse(text, "acme", "s1");
        assert_eq!(manifest.execution_mode, ExecutionMode::Full);
        assert_eq!(manifest.phases.len(), 7);
        assert_eq!(manifest.completed_phases(), vec![4]);
        assert_eq!(warnings.len(), 2);
    }
}
