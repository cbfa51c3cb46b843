//! Typed execution-log events.
//!
//! Every journal line is one of these variants, discriminated by the
//! `type` field. The set is closed: legacy string-tagged lines are parsed
//! into variants on load, never carried around as raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intervention::{InterventionAction, InterventionKind};
use crate::outcome::ExecutionResult;

/// Schema name written to the journal header
pub const EXECUTION_LOG_SCHEMA: &str = "execution_log";
/// Current journal schema version
pub const EXECUTION_LOG_VERSION: &str = "1.0";

/// Spec-context usage metadata recorded on the first iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecContextUsage {
    /// Characters of chart-time summary included in the prompt
    pub spec_context_summary_chars: usize,
    /// Number of spec section references carried by the waypoint
    pub spec_section_ref_count: usize,
    /// Hash the waypoint was planned against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_context_hash: Option<String>,
    /// Hash of the live spec at execution time
    pub current_spec_hash: String,
    /// Whether the chart-time context no longer matches the live spec
    pub spec_context_stale: bool,
    /// Pointer to the canonical spec file
    pub full_spec_pointer: String,
}

/// One journal record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// First line of every journal file
    Header {
        #[serde(rename = "_schema")]
        schema: String,
        #[serde(rename = "_version")]
        version: String,
        execution_id: String,
        waypoint_id: String,
        waypoint_title: String,
        waypoint_objective: String,
        acceptance_criteria: Vec<String>,
        started_at: DateTime<Utc>,
        project_slug: String,
    },

    /// An iteration began; records the prompt sent
    IterationStart {
        iteration: u32,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spec_context: Option<SpecContextUsage>,
        timestamp: DateTime<Utc>,
    },

    /// Agent output for an iteration, with criteria completed so far
    Output {
        iteration: u32,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        criteria_completed: Vec<usize>,
        timestamp: DateTime<Utc>,
    },

    /// A tool call made by the agent
    ToolCall {
        iteration: u32,
        tool_name: String,
        tool_input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_output: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An iteration finished; cost is accumulated into the running total
    IterationEnd {
        iteration: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        cumulative_cost_usd: f64,
        timestamp: DateTime<Utc>,
    },

    /// An error during execution
    Error {
        iteration: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal record with the run result and totals
    Completion {
        result: ExecutionResult,
        total_cost_usd: f64,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
    },

    /// Control is being handed to the operator
    InterventionNeeded {
        iteration: u32,
        intervention_type: InterventionKind,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The operator resolved an intervention
    InterventionResolved {
        action: InterventionAction,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        params: serde_json::Map<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    },

    /// Executor state machine moved
    StateTransition {
        from_state: String,
        to_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Receipt validation outcome
    ReceiptValidated {
        path: String,
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Git commit attempt for the waypoint
    GitCommit {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Execution paused at an iteration boundary
    Pause { timestamp: DateTime<Utc> },

    /// Execution resumed
    Resume { timestamp: DateTime<Utc> },

    /// Agent attempted access outside the project scope
    SecurityViolation {
        iteration: u32,
        details: String,
        timestamp: DateTime<Utc>,
    },

    /// The canonical completion marker was seen
    CompletionDetected {
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// Finalize phase began
    FinalizeStart { timestamp: DateTime<Utc> },

    /// Output produced during finalize (e.g. judge response)
    FinalizeOutput {
        content: String,
        timestamp: DateTime<Utc>,
    },

    /// A command or capture performed during finalize
    FinalizeToolCall {
        tool_name: String,
        tool_input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_output: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Finalize phase ended; cost is accumulated into the running total
    FinalizeEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        cumulative_cost_usd: f64,
        timestamp: DateTime<Utc>,
    },

    /// Working-tree diff summary captured at an iteration boundary
    WorkspaceDiff {
        iteration: u32,
        diff_stat: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Event type name as written to the journal
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Header { .. } => "header",
            Self::IterationStart { .. } => "iteration_start",
            Self::Output { .. } => "output",
            Self::ToolCall { .. } => "tool_call",
            Self::IterationEnd { .. } => "iteration_end",
            Self::Error { .. } => "error",
            Self::Completion { .. } => "completion",
            Self::InterventionNeeded { .. } => "intervention_needed",
            Self::InterventionResolved { .. } => "intervention_resolved",
            Self::StateTransition { .. } => "state_transition",
            Self::ReceiptValidated { .. } => "receipt_validated",
            Self::GitCommit { .. } => "git_commit",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::SecurityViolation { .. } => "security_violation",
            Self::CompletionDetected { .. } => "completion_detected",
            Self::FinalizeStart { .. } => "finalize_start",
            Self::FinalizeOutput { .. } => "finalize_output",
            Self::FinalizeToolCall { .. } => "finalize_tool_call",
            Self::FinalizeEnd { .. } => "finalize_end",
            Self::WorkspaceDiff { .. } => "workspace_diff",
        }
    }

    /// Iteration index, for iteration-scoped events
    pub fn iteration(&self) -> Option<u32> {
        match self {
            Self::IterationStart { iteration, .. }
            | Self::Output { iteration, .. }
            | Self::ToolCall { iteration, .. }
            | Self::IterationEnd { iteration, .. }
            | Self::Error { iteration, .. }
            | Self::InterventionNeeded { iteration, .. }
            | Self::SecurityViolation { iteration, .. }
            | Self::CompletionDetected { iteration, .. }
            | Self::WorkspaceDiff { iteration, .. } => Some(*iteration),
            _ => None,
        }
    }

    /// Event timestamp (`completed_at` for completion records)
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Header { started_at, .. } => *started_at,
            Self::Completion { completed_at, .. } => *completed_at,
            Self::IterationStart { timestamp, .. }
            | Self::Output { timestamp, .. }
            | Self::ToolCall { timestamp, .. }
            | Self::IterationEnd { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::InterventionNeeded { timestamp, .. }
            | Self::InterventionResolved { timestamp, .. }
            | Self::StateTransition { timestamp, .. }
            | Self::ReceiptValidated { timestamp, .. }
            | Self::GitCommit { timestamp, .. }
            | Self::Pause { timestamp }
            | Self::Resume { timestamp }
            | Self::SecurityViolation { timestamp, .. }
            | Self::CompletionDetected { timestamp, .. }
            | Self::FinalizeStart { timestamp }
            | Self::FinalizeOutput { timestamp, .. }
            | Self::FinalizeToolCall { timestamp, .. }
            | Self::FinalizeEnd { timestamp, .. }
            | Self::WorkspaceDiff { timestamp, .. } => *timestamp,
        }
    }
}
