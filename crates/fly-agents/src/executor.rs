//! Waypoint executor — the iterative agentic execution loop.
//!
//! Drives one waypoint to completion: builds prompts, consumes the
//! provider stream, detects the canonical completion marker, classifies
//! protocol derailments and provider failures, and invokes the receipt
//! finalizer. The loop is single-task and cooperative; cancellation is a
//! flag checked between stream events and at iteration boundaries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flightcore::config::Checklist;
use flightcore::evidence::{
    detect_validation_category, normalize_command, CapturedEvidence, ValidationCategory,
};
use flightcore::finalizer::{Finalize, FinalizeFailure, FinalizeInputs, ReceiptFinalizer};
use flightcore::intervention::{Intervention, InterventionKind, InterventionNeeded};
use flightcore::journal::{ExecutionLogWriter, SpecContextUsage};
use flightcore::metrics::CostTracker;
use flightcore::models::{compute_spec_hash, Project, Waypoint, SPEC_POINTER};
use flightcore::outcome::ExecutionResult;
use flightcore::progress::{ProgressCallback, ProgressStep, ProgressUpdate};
use flightcore::provider::{AgentProvider, AgentRequest, ProviderError, ProviderEvent};
use flightcore::receipt::{CriterionStatus, CriterionVerification};
use flightcore::stack::{detect_stack, resolve_validation_commands, ValidationCommand};

use crate::markers::{
    claimed_completion_alias, contains_completion_marker, detect_protocol_issues,
    extract_file_operation, extract_intervention_reason, is_blocked_path_access,
    needs_intervention, parse_criterion_markers, parse_validation_commands,
};
use crate::memory::{build_memory_context, save_waypoint_memory, WaypointMemoryRecord};
use crate::prompts::{
    build_execution_prompt, build_kickoff_prompt, system_prompt, KickoffReason, SpecStaleness,
};
use crate::state::{ExecutorState, StateTracker};

/// Output tail embedded in intervention summaries
const SUMMARY_TAIL_CHARS: usize = 500;

static EXIT_CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)exit(?:ed with)? code[:= ]*(-?\d+)").expect("exit code pattern compiles")
});

/// Guess an exit code from a Bash tool result
fn tool_exit_code(output: &str) -> i32 {
    if let Some(caps) = EXIT_CODE_PATTERN.captures(output) {
        if let Ok(code) = caps[1].parse() {
            return code;
        }
    }
    let head = output.trim_start().to_lowercase();
    if head.starts_with("error") || head.contains("command failed") {
        1
    } else {
        0
    }
}

/// Accumulated facts about the most recent run, used for memory records
#[derive(Debug, Default)]
struct RunStats {
    iterations_used: u32,
    protocol_derailments: Vec<String>,
    changed_files: BTreeSet<String>,
    reported_commands: Vec<String>,
    verified_criteria: Vec<usize>,
    error_summary: Option<String>,
}

/// Executes one waypoint with the iterative agent loop
pub struct WaypointExecutor {
    project: Project,
    waypoint: Waypoint,
    spec: String,
    provider: Arc<dyn AgentProvider>,
    finalizer: Box<dyn Finalize>,
    cost: Arc<CostTracker>,
    checklist: Checklist,
    max_iterations: u32,
    host_validations: bool,
    on_progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    log: Option<ExecutionLogWriter>,
    stats: RunStats,
}

impl WaypointExecutor {
    /// Executor with a default [`ReceiptFinalizer`] (no judge attached)
    pub fn new(
        project: Project,
        waypoint: Waypoint,
        spec: impl Into<String>,
        provider: Arc<dyn AgentProvider>,
        cost: Arc<CostTracker>,
    ) -> Self {
        let finalizer = Box::new(ReceiptFinalizer::new(
            project.clone(),
            waypoint.clone(),
            cost.clone(),
        ));
        Self {
            project,
            waypoint,
            spec: spec.into(),
            provider,
            finalizer,
            cost,
            checklist: Checklist::default(),
            max_iterations: flightcore::config::DEFAULT_MAX_ITERATIONS,
            host_validations: true,
            on_progress: None,
            cancel: CancellationToken::new(),
            log: None,
            stats: RunStats::default(),
        }
    }

    /// Replace the finalizer (tests use stubs; the coordinator attaches a judge)
    pub fn with_finalizer(mut self, finalizer: Box<dyn Finalize>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Iteration budget
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Run host validations during finalize
    pub fn with_host_validations(mut self, enabled: bool) -> Self {
        self.host_validations = enabled;
        self
    }

    /// Waypoint checklist with validation overrides
    pub fn with_checklist(mut self, checklist: Checklist) -> Self {
        self.checklist = checklist;
        self
    }

    /// Progress callback
    pub fn with_progress(mut self, on_progress: ProgressCallback) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Token other tasks use to request cooperative cancellation
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation; takes effect at the next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Iteration budget configured for this run
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Journal writer of the finished run, for post-run events (git commit)
    pub fn take_log_writer(&mut self) -> Option<ExecutionLogWriter> {
        self.log.take()
    }

    fn progress(
        &self,
        iteration: u32,
        step: ProgressStep,
        output: impl Into<String>,
        criteria: &BTreeMap<usize, CriterionVerification>,
        file_operations: Vec<flightcore::progress::FileOperation>,
    ) {
        if let Some(cb) = &self.on_progress {
            cb(ProgressUpdate {
                waypoint_id: self.waypoint.id.clone(),
                iteration,
                total_iterations: self.max_iterations,
                step,
                output: output.into(),
                criteria_completed: verified_indices(criteria),
                file_operations,
            });
        }
    }

    /// Execute the waypoint.
    ///
    /// Terminates through exactly one result, or raises
    /// [`InterventionNeeded`] with full context.
    pub async fn execute(&mut self) -> Result<ExecutionResult, InterventionNeeded> {
        self.stats = RunStats::default();
        let mut log = match ExecutionLogWriter::new(&self.project, &self.waypoint) {
            Ok(log) => log,
            Err(e) => {
                return Err(InterventionNeeded::new(Intervention::new(
                    InterventionKind::ExecutionError,
                    self.waypoint.clone(),
                    0,
                    self.max_iterations,
                    format!("Could not create execution log: {e}"),
                )));
            }
        };
        info!(waypoint = %self.waypoint.id, log = %log.path().display(), "Starting execution");

        let outcome = self.run_loop(&mut log).await;
        self.log = Some(log);
        self.save_memory(&outcome);
        outcome
    }

    async fn run_loop(
        &mut self,
        log: &mut ExecutionLogWriter,
    ) -> Result<ExecutionResult, InterventionNeeded> {
        let mut tracker = StateTracker::new();
        tracker.advance(ExecutorState::Running, None, log);

        let project_path = self.project.path().to_path_buf();
        let stacks = detect_stack(&project_path);
        let resolved_commands: Vec<ValidationCommand> = resolve_validation_commands(
            &project_path,
            &self.spec,
            &self.checklist.validation_overrides,
        );

        let current_spec_hash = compute_spec_hash(&self.spec);
        let stale = match &self.waypoint.spec_context_hash {
            Some(hash) => hash != &current_spec_hash,
            None => false,
        };
        let staleness = SpecStaleness {
            stale,
            current_spec_hash: Some(current_spec_hash.clone()),
        };
        let memory = build_memory_context(&self.project.memory_dir(), &self.waypoint);

        let mut prompt = build_execution_prompt(
            &self.waypoint,
            &project_path,
            &self.checklist,
            &stacks,
            &self.checklist.validation_overrides,
            memory.as_ref().map(|(text, _)| text.as_str()),
            &staleness,
        );
        let mut first_iteration_context = Some(SpecContextUsage {
            spec_context_summary_chars: self
                .waypoint
                .spec_context_summary
                .as_deref()
                .map(str::len)
                .unwrap_or(0),
            spec_section_ref_count: self.waypoint.spec_section_refs.len(),
            spec_context_hash: self.waypoint.spec_context_hash.clone(),
            current_spec_hash,
            spec_context_stale: stale,
            full_spec_pointer: SPEC_POINTER.to_string(),
        });

        let mut session_id: Option<String> = None;
        let mut captured_criteria: BTreeMap<usize, CriterionVerification> = BTreeMap::new();
        let mut evidence_by_command: BTreeMap<String, CapturedEvidence> = BTreeMap::new();
        let mut evidence_by_category: BTreeMap<ValidationCategory, CapturedEvidence> =
            BTreeMap::new();
        let mut last_failed_bash: Option<(String, String)> = None;
        let mut host_validation_retried = false;
        let mut full_output = String::new();
        let mut iteration: u32 = 0;

        while iteration < self.max_iterations {
            iteration += 1;
            self.stats.iterations_used = iteration;

            if self.cancel.is_cancelled() {
                info!("Execution cancelled before iteration {iteration}");
                let _ = log.log_completion(ExecutionResult::Cancelled);
                tracker.advance(ExecutorState::Cancelled, None, log);
                return Ok(ExecutionResult::Cancelled);
            }

            if let Err(budget_err) = self.cost.check_budget() {
                let _ = log.log_error(iteration, budget_err.to_string());
                return Err(self.provider_intervention(
                    budget_err,
                    iteration,
                    log,
                    &mut tracker,
                    &full_output,
                    &last_failed_bash,
                    None,
                ));
            }

            info!(iteration, max = self.max_iterations, "Iteration start");
            self.progress(
                iteration,
                ProgressStep::Executing,
                format!("Iteration {iteration}"),
                &captured_criteria,
                Vec::new(),
            );
            let _ = log.log_iteration_start(iteration, &prompt, first_iteration_context.take());

            let request = AgentRequest::new(
                prompt.clone(),
                system_prompt(&project_path),
                project_path.clone(),
            )
            .with_resume(session_id.clone());

            let mut stream = match self.provider.query(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = log.log_error(iteration, e.to_string());
                    return Err(self.provider_intervention(
                        e,
                        iteration,
                        log,
                        &mut tracker,
                        &full_output,
                        &last_failed_bash,
                        None,
                    ));
                }
            };

            let mut iteration_output = String::new();
            let mut iteration_cost: Option<f64> = None;
            let mut marker_found = false;
            let mut scope_drift = false;
            let mut last_tool_name: Option<String> = None;
            let mut cancelled_mid_stream = false;

            use futures::StreamExt;
            while let Some(event) = stream.next().await {
                if self.cancel.is_cancelled() && !marker_found {
                    cancelled_mid_stream = true;
                    break;
                }
                match event {
                    Ok(ProviderEvent::Chunk { text }) => {
                        iteration_output.push_str(&text);
                        full_output.push_str(&text);

                        for cv in parse_criterion_markers(&iteration_output) {
                            if cv.index < self.waypoint.acceptance_criteria.len() {
                                captured_criteria.insert(cv.index, cv);
                            }
                        }
                        for command in parse_validation_commands(&iteration_output) {
                            if !self.stats.reported_commands.contains(&command) {
                                self.stats.reported_commands.push(command);
                            }
                        }

                        if !marker_found
                            && contains_completion_marker(&iteration_output, &self.waypoint.id)
                        {
                            marker_found = true;
                            info!(iteration, "Completion marker found");
                            let _ = log.log_completion_detected(iteration);
                            self.progress(
                                iteration,
                                ProgressStep::Complete,
                                "Waypoint complete!",
                                &captured_criteria,
                                Vec::new(),
                            );
                        } else if !marker_found {
                            self.progress(
                                iteration,
                                ProgressStep::Streaming,
                                text,
                                &captured_criteria,
                                Vec::new(),
                            );
                        }
                    }
                    Ok(ProviderEvent::ToolUse {
                        tool_name,
                        tool_input,
                        tool_output,
                    }) => {
                        let _ = log.log_tool_call(
                            iteration,
                            &tool_name,
                            tool_input.clone(),
                            tool_output.clone(),
                        );
                        last_tool_name = Some(tool_name.clone());

                        if is_blocked_path_access(&tool_name, &tool_input, &project_path) {
                            scope_drift = true;
                            let _ = log.log_security_violation(
                                iteration,
                                format!("{tool_name} targeted a path outside the project root"),
                            );
                        }

                        if tool_name == "Bash" {
                            if let Some(command) =
                                tool_input.get("command").and_then(|v| v.as_str())
                            {
                                let output_text = tool_output.clone().unwrap_or_default();
                                let exit_code = tool_exit_code(&output_text);
                                let evidence = CapturedEvidence::new(
                                    command,
                                    exit_code,
                                    output_text.clone(),
                                    "",
                                );
                                evidence_by_command
                                    .insert(normalize_command(command), evidence.clone());
                                if let Some(category) = detect_validation_category(command) {
                                    evidence_by_category.insert(category, evidence);
                                }
                                if exit_code != 0 {
                                    last_failed_bash =
                                        Some((command.to_string(), output_text));
                                }
                            }
                        }

                        let file_operations = extract_file_operation(&tool_name, &tool_input)
                            .map(|op| {
                                if matches!(op.tool_name.as_str(), "Write" | "Edit") {
                                    self.stats.changed_files.insert(op.file_path.clone());
                                }
                                vec![op]
                            })
                            .unwrap_or_default();
                        self.progress(
                            iteration,
                            ProgressStep::ToolUse,
                            format!("{tool_name}: {tool_input}"),
                            &captured_criteria,
                            file_operations,
                        );
                    }
                    Ok(ProviderEvent::Complete {
                        session_id: sid,
                        cost_usd,
                        ..
                    }) => {
                        if sid.is_some() {
                            session_id = sid;
                        }
                        iteration_cost = cost_usd;
                    }
                    Err(e) => {
                        let _ = log.log_error(iteration, e.to_string());
                        let _ = log.log_output(
                            iteration,
                            &iteration_output,
                            verified_list(&captured_criteria),
                        );
                        return Err(self.provider_intervention(
                            e,
                            iteration,
                            log,
                            &mut tracker,
                            &full_output,
                            &last_failed_bash,
                            last_tool_name,
                        ));
                    }
                }
            }

            self.cost.record(iteration_cost);
            let _ = log.log_output(
                iteration,
                &iteration_output,
                verified_list(&captured_criteria),
            );
            let _ = log.log_iteration_end(iteration, iteration_cost);
            info!(
                iteration,
                cost = iteration_cost.unwrap_or(0.0),
                "Iteration end"
            );

            if cancelled_mid_stream || (self.cancel.is_cancelled() && !marker_found) {
                info!("Execution cancelled during iteration {iteration}");
                let _ = log.log_completion(ExecutionResult::Cancelled);
                tracker.advance(ExecutorState::Cancelled, None, log);
                return Ok(ExecutionResult::Cancelled);
            }

            if marker_found {
                tracker.advance(
                    ExecutorState::Finalizing,
                    Some("completion marker detected".to_string()),
                    log,
                );
                let inputs = FinalizeInputs {
                    captured_criteria: captured_criteria.clone(),
                    validation_commands: resolved_commands.clone(),
                    reported_commands: self.stats.reported_commands.clone(),
                    tool_evidence_by_command: evidence_by_command.clone(),
                    tool_evidence_by_category: evidence_by_category.clone(),
                    host_validations: self.host_validations,
                    max_iterations: self.max_iterations,
                };
                if self.finalizer.finalize(log, &inputs).await {
                    self.stats.verified_criteria = verified_list(&captured_criteria);
                    let _ = log.log_completion(ExecutionResult::Success);
                    tracker.advance(ExecutorState::Success, None, log);
                    return Ok(ExecutionResult::Success);
                }

                let failure = self.finalizer.last_failure().cloned();
                match failure {
                    Some(f)
                        if f.kind == FinalizeFailure::HostValidation
                            && !host_validation_retried
                            && iteration < self.max_iterations =>
                    {
                        warn!(summary = %f.summary, "Receipt invalid, retrying with validation feedback");
                        host_validation_retried = true;
                        self.stats.error_summary = Some(f.summary.clone());
                        tracker.advance(
                            ExecutorState::Running,
                            Some("host validation failed".to_string()),
                            log,
                        );
                        prompt = build_kickoff_prompt(
                            KickoffReason::HostValidationFailed,
                            &f.truncated(1000),
                            &self.waypoint.id,
                            &captured_criteria,
                        );
                        continue;
                    }
                    failure => {
                        let (kind, summary) = match &failure {
                            Some(f) if f.kind == FinalizeFailure::HostValidation => {
                                (InterventionKind::TestFailure, f.summary.clone())
                            }
                            Some(f) if f.kind == FinalizeFailure::JudgeRejected => {
                                (InterventionKind::TestFailure, f.summary.clone())
                            }
                            Some(f) => (InterventionKind::ExecutionError, f.summary.clone()),
                            None => (
                                InterventionKind::ExecutionError,
                                "Receipt finalization failed".to_string(),
                            ),
                        };
                        return Err(self.raise_intervention(
                            kind,
                            iteration,
                            summary,
                            log,
                            &mut tracker,
                            &last_failed_bash,
                            None,
                        ));
                    }
                }
            }

            // No marker this iteration: check for an explicit cry for help
            if needs_intervention(&iteration_output) {
                let reason = extract_intervention_reason(&iteration_output);
                return Err(self.raise_intervention(
                    InterventionKind::ExecutionError,
                    iteration,
                    reason,
                    log,
                    &mut tracker,
                    &last_failed_bash,
                    last_tool_name,
                ));
            }

            // Classify derailments and pick the next kickoff reason
            let stage_reports = parse_criterion_markers(&iteration_output).len();
            let issues = detect_protocol_issues(
                &iteration_output,
                &self.waypoint.id,
                stage_reports,
                scope_drift,
            );
            self.stats.protocol_derailments.extend(issues.iter().cloned());

            let (reason, detail) =
                if claimed_completion_alias(&iteration_output, &self.waypoint.id) {
                    (KickoffReason::ProtocolViolation, issues.join("; "))
                } else if scope_drift {
                    (KickoffReason::ScopeDrift, issues.join("; "))
                } else {
                    (KickoffReason::Continue, String::new())
                };
            prompt = build_kickoff_prompt(reason, &detail, &self.waypoint.id, &captured_criteria);
        }

        // Iteration budget exhausted
        warn!(max = self.max_iterations, "Max iterations reached without completion");
        let made_progress = !verified_list(&captured_criteria).is_empty()
            || !self.stats.protocol_derailments.is_empty();
        if made_progress {
            Err(self.raise_intervention(
                InterventionKind::IterationLimit,
                self.max_iterations,
                format!(
                    "Reached {} iterations without the completion marker",
                    self.max_iterations
                ),
                log,
                &mut tracker,
                &last_failed_bash,
                None,
            ))
        } else {
            let _ = log.log_completion(ExecutionResult::MaxIterations);
            Ok(ExecutionResult::MaxIterations)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn raise_intervention(
        &mut self,
        kind: InterventionKind,
        iteration: u32,
        summary: String,
        log: &mut ExecutionLogWriter,
        tracker: &mut StateTracker,
        last_failed_bash: &Option<(String, String)>,
        last_tool_name: Option<String>,
    ) -> InterventionNeeded {
        let mut full_summary = summary;
        if let Some((command, output)) = last_failed_bash {
            let excerpt: String = output.chars().take(400).collect();
            full_summary.push_str(&format!("\nFailed command: {command}\n{excerpt}"));
        }
        self.stats.error_summary = Some(full_summary.clone());

        let _ = log.log_intervention_needed(iteration, kind, &full_summary);
        let _ = log.log_completion(ExecutionResult::InterventionNeeded);
        tracker.advance(ExecutorState::InterventionNeeded, None, log);

        let mut intervention = Intervention::new(
            kind,
            self.waypoint.clone(),
            iteration,
            self.max_iterations,
            full_summary,
        );
        if let Some(tool) = last_tool_name {
            intervention = intervention.with_context("last_tool_name", tool);
        }
        InterventionNeeded::new(intervention)
    }

    #[allow(clippy::too_many_arguments)]
    fn provider_intervention(
        &mut self,
        error: ProviderError,
        iteration: u32,
        log: &mut ExecutionLogWriter,
        tracker: &mut StateTracker,
        full_output: &str,
        last_failed_bash: &Option<(String, String)>,
        last_tool_name: Option<String>,
    ) -> InterventionNeeded {
        let mut summary = error.to_string();
        let tail: String = full_output
            .chars()
            .rev()
            .take(SUMMARY_TAIL_CHARS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if !tail.trim().is_empty() {
            summary.push_str(&format!("\nRecent output: …{}", tail.trim()));
        }

        let kind = error.intervention_kind();
        let mut raised = self.raise_intervention(
            kind,
            iteration,
            summary,
            log,
            tracker,
            last_failed_bash,
            last_tool_name,
        );
        raised.intervention = raised
            .intervention
            .with_context("api_error_type", error.api_error_type());
        if matches!(error, ProviderError::BudgetExceeded { .. }) {
            if let Some(budget) = self.cost.budget() {
                raised.intervention = raised
                    .intervention
                    .with_context("configured_budget_usd", budget);
            }
            raised.intervention = raised
                .intervention
                .with_context("current_cost_usd", self.cost.total());
        }
        InterventionNeeded::new(raised.intervention)
    }

    fn save_memory(&self, outcome: &Result<ExecutionResult, InterventionNeeded>) {
        let result = match outcome {
            Ok(result) => *result,
            Err(_) => ExecutionResult::InterventionNeeded,
        };
        let record = WaypointMemoryRecord {
            schema_version: crate::memory::MEMORY_SCHEMA_VERSION.to_string(),
            saved_at: chrono::Utc::now(),
            waypoint_id: self.waypoint.id.clone(),
            title: self.waypoint.title.clone(),
            objective: self.waypoint.objective.clone(),
            dependencies: self.waypoint.dependencies.clone(),
            result,
            iterations_used: self.stats.iterations_used,
            max_iterations: self.max_iterations,
            protocol_derailments: self.stats.protocol_derailments.clone(),
            error_summary: self.stats.error_summary.clone(),
            changed_files: self.stats.changed_files.iter().cloned().collect(),
            validation_commands: self.stats.reported_commands.clone(),
            verified_criteria: self.stats.verified_criteria.clone(),
        };
        if let Err(e) = save_waypoint_memory(&self.project.memory_dir(), &record) {
            warn!(error = %e, "Could not save waypoint memory");
        }
    }
}

fn verified_indices(criteria: &BTreeMap<usize, CriterionVerification>) -> BTreeSet<usize> {
    criteria
        .values()
        .filter(|c| c.status == CriterionStatus::Verified)
        .map(|c| c.index)
        .collect()
}

fn verified_list(criteria: &BTreeMap<usize, CriterionVerification>) -> Vec<usize> {
    verified_indices(criteria).into_iter().collect()
}
