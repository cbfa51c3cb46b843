//! Streaming journal writer.
//!
//! One writer per execution run. The header is written at construction;
//! every event is serialized to a single line and flushed immediately so
//! a crash never loses acknowledged records.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::FlightResult;
use crate::intervention::{InterventionAction, InterventionKind};
use crate::journal::event::{
    ExecutionEvent, SpecContextUsage, EXECUTION_LOG_SCHEMA, EXECUTION_LOG_VERSION,
};
use crate::models::{Project, Waypoint};
use crate::outcome::ExecutionResult;

/// Streams execution events to `sessions/fly/{wp-slug}-{timestamp}.jsonl`
pub struct ExecutionLogWriter {
    file: File,
    path: PathBuf,
    execution_id: String,
    started_at: DateTime<Utc>,
    total_cost_usd: f64,
}

impl ExecutionLogWriter {
    /// Create the journal file and write its header
    pub fn new(project: &Project, waypoint: &Waypoint) -> FlightResult<Self> {
        let dir = project.fly_sessions_dir();
        std::fs::create_dir_all(&dir)?;

        let started_at = Utc::now();
        let stamp = started_at.format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{}-{stamp}.jsonl", waypoint.id_slug()));

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        let mut writer = Self {
            file,
            path,
            execution_id: Uuid::new_v4().to_string(),
            started_at,
            total_cost_usd: 0.0,
        };
        writer.append(&ExecutionEvent::Header {
            schema: EXECUTION_LOG_SCHEMA.to_string(),
            version: EXECUTION_LOG_VERSION.to_string(),
            execution_id: writer.execution_id.clone(),
            waypoint_id: waypoint.id.clone(),
            waypoint_title: waypoint.title.clone(),
            waypoint_objective: waypoint.objective.clone(),
            acceptance_criteria: waypoint.acceptance_criteria.clone(),
            started_at,
            project_slug: project.slug.clone(),
        })?;
        Ok(writer)
    }

    /// Journal file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique id of this execution run
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Cost accumulated so far across iteration and finalize records
    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_usd
    }

    fn append(&mut self, event: &ExecutionEvent) -> FlightResult<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }

    /// Log the start of an iteration with the prompt sent
    pub fn log_iteration_start(
        &mut self,
        iteration: u32,
        prompt: impl Into<String>,
        spec_context: Option<SpecContextUsage>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::IterationStart {
            iteration,
            prompt: prompt.into(),
            spec_context,
            timestamp: Utc::now(),
        })
    }

    /// Log agent output with the criteria completed so far
    pub fn log_output(
        &mut self,
        iteration: u32,
        content: impl Into<String>,
        criteria_completed: Vec<usize>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::Output {
            iteration,
            content: content.into(),
            criteria_completed,
            timestamp: Utc::now(),
        })
    }

    /// Log a tool call made by the agent
    pub fn log_tool_call(
        &mut self,
        iteration: u32,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
        tool_output: Option<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::ToolCall {
            iteration,
            tool_name: tool_name.into(),
            tool_input,
            tool_output,
            timestamp: Utc::now(),
        })
    }

    /// Log the end of an iteration, accumulating its cost
    pub fn log_iteration_end(&mut self, iteration: u32, cost_usd: Option<f64>) -> FlightResult<()> {
        if let Some(cost) = cost_usd {
            self.total_cost_usd += cost;
        }
        let cumulative = self.total_cost_usd;
        self.append(&ExecutionEvent::IterationEnd {
            iteration,
            cost_usd,
            cumulative_cost_usd: cumulative,
            timestamp: Utc::now(),
        })
    }

    /// Log an error
    pub fn log_error(&mut self, iteration: u32, error: impl Into<String>) -> FlightResult<()> {
        self.append(&ExecutionEvent::Error {
            iteration,
            error: error.into(),
            timestamp: Utc::now(),
        })
    }

    /// Log the terminal completion record with totals
    pub fn log_completion(&mut self, result: ExecutionResult) -> FlightResult<()> {
        let completed_at = Utc::now();
        let duration = completed_at
            .signed_duration_since(self.started_at)
            .num_milliseconds() as f64
            / 1000.0;
        let event = ExecutionEvent::Completion {
            result,
            total_cost_usd: self.total_cost_usd,
            started_at: self.started_at,
            completed_at,
            duration_seconds: duration,
        };
        self.append(&event)
    }

    /// Log that intervention is needed
    pub fn log_intervention_needed(
        &mut self,
        iteration: u32,
        kind: InterventionKind,
        reason: impl Into<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::InterventionNeeded {
            iteration,
            intervention_type: kind,
            reason: reason.into(),
            timestamp: Utc::now(),
        })
    }

    /// Log the operator's intervention decision
    pub fn log_intervention_resolved(
        &mut self,
        action: InterventionAction,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::InterventionResolved {
            action,
            params,
            timestamp: Utc::now(),
        })
    }

    /// Log an executor state change
    pub fn log_state_transition(
        &mut self,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        reason: Option<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason,
            timestamp: Utc::now(),
        })
    }

    /// Log a receipt validation outcome
    pub fn log_receipt_validated(
        &mut self,
        path: impl Into<String>,
        valid: bool,
        message: Option<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::ReceiptValidated {
            path: path.into(),
            valid,
            message,
            timestamp: Utc::now(),
        })
    }

    /// Log a git commit attempt
    pub fn log_git_commit(
        &mut self,
        success: bool,
        commit_hash: Option<String>,
        message: Option<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::GitCommit {
            success,
            commit_hash,
            message,
            timestamp: Utc::now(),
        })
    }

    /// Log a pause
    pub fn log_pause(&mut self) -> FlightResult<()> {
        self.append(&ExecutionEvent::Pause {
            timestamp: Utc::now(),
        })
    }

    /// Log a resume
    pub fn log_resume(&mut self) -> FlightResult<()> {
        self.append(&ExecutionEvent::Resume {
            timestamp: Utc::now(),
        })
    }

    /// Log attempted access outside the project scope
    pub fn log_security_violation(
        &mut self,
        iteration: u32,
        details: impl Into<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::SecurityViolation {
            iteration,
            details: details.into(),
            timestamp: Utc::now(),
        })
    }

    /// Log detection of the canonical completion marker
    pub fn log_completion_detected(&mut self, iteration: u32) -> FlightResult<()> {
        self.append(&ExecutionEvent::CompletionDetected {
            iteration,
            timestamp: Utc::now(),
        })
    }

    /// Log the start of the finalize phase
    pub fn log_finalize_start(&mut self) -> FlightResult<()> {
        self.append(&ExecutionEvent::FinalizeStart {
            timestamp: Utc::now(),
        })
    }

    /// Log finalize-phase output (e.g. the judge response)
    pub fn log_finalize_output(&mut self, content: impl Into<String>) -> FlightResult<()> {
        self.append(&ExecutionEvent::FinalizeOutput {
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    /// Log a command run or capture performed during finalize
    pub fn log_finalize_tool_call(
        &mut self,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
        tool_output: Option<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::FinalizeToolCall {
            tool_name: tool_name.into(),
            tool_input,
            tool_output,
            timestamp: Utc::now(),
        })
    }

    /// Log the end of the finalize phase, accumulating its cost
    pub fn log_finalize_end(&mut self, cost_usd: Option<f64>) -> FlightResult<()> {
        if let Some(cost) = cost_usd {
            self.total_cost_usd += cost;
        }
        let cumulative = self.total_cost_usd;
        self.append(&ExecutionEvent::FinalizeEnd {
            cost_usd,
            cumulative_cost_usd: cumulative,
            timestamp: Utc::now(),
        })
    }

    /// Log a working-tree diff summary
    pub fn log_workspace_diff(
        &mut self,
        iteration: u32,
        diff_stat: impl Into<String>,
    ) -> FlightResult<()> {
        self.append(&ExecutionEvent::WorkspaceDiff {
            iteration,
            diff_stat: diff_stat.into(),
            timestamp: Utc::now(),
        })
    }
}
