//! Journey coordinator — FLY-phase facade over shared state.
//!
//! Owns the mutable flight plan, persists every mutation immediately,
//! and routes execution, commit, rollback, and intervention handling
//! between the controller, the executor, and the borrowed collaborators
//! (git service, LLM provider).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flightcore::config::FlyConfig;
use flightcore::error::{FlightError, FlightResult};
use flightcore::finalizer::ReceiptFinalizer;
use flightcore::git::{GitService, ResetResult};
use flightcore::intervention::{
    Intervention, InterventionAction, InterventionNeeded, InterventionResolution,
};
use flightcore::journal::ExecutionLogWriter;
use flightcore::metrics::CostTracker;
use flightcore::models::{
    CompletionStatus, FlightPlan, FlightPlanStore, Project, Waypoint, WaypointHistoryEvent,
    WaypointHistoryWriter, WaypointStatus,
};
use flightcore::outcome::ExecutionResult;
use flightcore::progress::ProgressCallback;
use flightcore::provider::{AgentProvider, RetryingProvider};
use flightcore::receipt::ChecklistReceipt;

use crate::controller::{ControllerStatus, ExecutionController, NextAction};
use crate::executor::WaypointExecutor;

/// Severity of a UI-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeSeverity {
    Info,
    Warning,
    Error,
}

/// A message for the operator, annotated with severity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub severity: NoticeSeverity,
    pub message: String,
}

impl Notice {
    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: NoticeSeverity::Info,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: NoticeSeverity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: NoticeSeverity::Error,
            message: message.into(),
        }
    }
}

/// How a commit attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Committed,
    NothingToCommit,
    SkippedNoReceipt,
    Failed,
}

/// Outcome of committing a waypoint
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub status: CommitStatus,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub notices: Vec<Notice>,
}

/// Outcome of a rollback
#[derive(Debug, Clone)]
pub struct RollbackResult {
    pub success: bool,
    pub message: String,
}

/// Coordinates the FLY phase for one project
pub struct JourneyCoordinator {
    project: Project,
    plan: FlightPlan,
    store: FlightPlanStore,
    history: WaypointHistoryWriter,
    git: Arc<dyn GitService>,
    provider: Arc<dyn AgentProvider>,
    cost: Arc<CostTracker>,
    config: FlyConfig,
    controller: ExecutionController,
    current_intervention: Option<Intervention>,
    active_cancel: Option<CancellationToken>,
    last_log: Option<ExecutionLogWriter>,
    next_max_iterations: Option<u32>,
}

impl JourneyCoordinator {
    /// Coordinator over an in-memory plan (persisted on first mutation)
    pub fn new(
        project: Project,
        plan: FlightPlan,
        git: Arc<dyn GitService>,
        provider: Arc<dyn AgentProvider>,
        config: FlyConfig,
    ) -> Self {
        let store = FlightPlanStore::new(project.flight_plan_path());
        let history = WaypointHistoryWriter::new(project.waypoint_history_path());
        let cost = Arc::new(CostTracker::from_config(config.budget_usd));
        Self {
            project,
            plan,
            store,
            history,
            git,
            provider,
            cost,
            config,
            controller: ExecutionController::new(),
            current_intervention: None,
            active_cancel: None,
            last_log: None,
            next_max_iterations: None,
        }
    }

    /// Coordinator loading the plan from the project's plan file
    pub fn open(
        project: Project,
        git: Arc<dyn GitService>,
        provider: Arc<dyn AgentProvider>,
        config: FlyConfig,
    ) -> FlightResult<Self> {
        let store = FlightPlanStore::new(project.flight_plan_path());
        let plan = store.load()?;
        Ok(Self::new(project, plan, git, provider, config))
    }

    /// Current flight plan (read-only; mutate through coordinator methods)
    pub fn plan(&self) -> &FlightPlan {
        &self.plan
    }

    /// The project under coordination
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Total LLM spend so far
    pub fn total_cost_usd(&self) -> f64 {
        self.cost.total()
    }

    /// Intervention currently awaiting resolution
    pub fn current_intervention(&self) -> Option<&Intervention> {
        self.current_intervention.as_ref()
    }

    /// Controller status
    pub fn status(&self) -> ControllerStatus {
        self.controller.status()
    }

    /// Crash recovery: reset stale in-progress waypoints and persist
    pub fn initialize(&mut self) -> FlightResult<()> {
        if self.controller.initialize(&mut self.plan) {
            self.save_plan()?;
        }
        Ok(())
    }

    /// First runnable waypoint in tree order
    pub fn select_next_waypoint(&mut self, include_in_progress: bool) -> Option<Waypoint> {
        let selected = self
            .controller
            .select_next_waypoint(&self.plan, include_in_progress);
        if selected.is_none() {
            self.controller.settle(&self.plan);
        }
        selected
    }

    fn save_plan(&mut self) -> FlightResult<()> {
        self.store.save(&self.plan)
    }

    fn log_history(&self, event: WaypointHistoryEvent) {
        if let Err(e) = self.history.log(&event) {
            error!(error = %e, "Failed to log waypoint event");
        }
    }

    /// Append a waypoint-history event
    pub fn log_waypoint_event(&self, event: WaypointHistoryEvent) {
        self.log_history(event);
    }

    // ── Plan mutations (persist immediately, emit history) ─────────────

    /// Add a waypoint, optionally after an anchor
    pub fn add_waypoint(
        &mut self,
        waypoint: Waypoint,
        insert_after: Option<&str>,
    ) -> FlightResult<()> {
        let id = waypoint.id.clone();
        match insert_after {
            Some(anchor) => self.plan.insert_after(anchor, vec![waypoint]),
            None => self.plan.add_waypoint(waypoint),
        }
        self.save_plan()?;
        self.log_history(WaypointHistoryEvent::Added {
            waypoint_id: id,
            insert_after: insert_after.map(str::to_string),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Update a waypoint; substantive edits reset it to pending
    pub fn update_waypoint(&mut self, waypoint: Waypoint) -> FlightResult<bool> {
        let id = waypoint.id.clone();
        let reset = self.plan.update_waypoint(waypoint)?;
        self.save_plan()?;
        self.log_history(WaypointHistoryEvent::Updated {
            waypoint_id: id,
            changed_fields: Vec::new(),
            status_reset: reset,
            timestamp: Utc::now(),
        });
        Ok(reset)
    }

    /// Delete a waypoint subtree
    pub fn delete_waypoint(&mut self, waypoint_id: &str) -> FlightResult<Vec<String>> {
        let removed = self.plan.remove_waypoint(waypoint_id);
        if removed.is_empty() {
            return Err(FlightError::unknown_waypoint(waypoint_id));
        }
        self.save_plan()?;
        self.log_history(WaypointHistoryEvent::Deleted {
            waypoint_id: waypoint_id.to_string(),
            removed_ids: removed.clone(),
            timestamp: Utc::now(),
        });
        Ok(removed)
    }

    /// Completion summary across the plan
    pub fn completion_status(&self) -> CompletionStatus {
        self.plan.completion_status()
    }

    // ── Execution ──────────────────────────────────────────────────────

    fn set_status(&mut self, waypoint_id: &str, status: WaypointStatus) -> FlightResult<()> {
        let wp = self
            .plan
            .get_mut(waypoint_id)
            .ok_or_else(|| FlightError::unknown_waypoint(waypoint_id))?;
        if status == WaypointStatus::Complete {
            wp.mark_complete();
        } else {
            wp.status = status;
        }
        self.save_plan()
    }

    /// Execute one waypoint through the iterative agent loop.
    ///
    /// An executor-raised intervention is captured on the coordinator and
    /// reported as [`ExecutionResult::InterventionNeeded`]; fetch it via
    /// [`Self::current_intervention`] and resolve with
    /// [`Self::handle_intervention`].
    pub async fn execute_waypoint(
        &mut self,
        waypoint_id: &str,
        on_progress: Option<ProgressCallback>,
    ) -> FlightResult<ExecutionResult> {
        let waypoint = self
            .plan
            .get(waypoint_id)
            .cloned()
            .ok_or_else(|| FlightError::unknown_waypoint(waypoint_id))?;

        let problems = self.plan.validate_dependencies();
        if !problems.is_empty() {
            return Err(FlightError::invalid_plan(problems.join("; ")));
        }
        self.controller.start(&self.plan, waypoint_id)?;
        self.set_status(waypoint_id, WaypointStatus::InProgress)?;

        let max_iterations = self
            .next_max_iterations
            .take()
            .unwrap_or(self.config.max_iterations);
        let retrying = Arc::new(RetryingProvider::new(self.provider.clone()));
        let finalizer = ReceiptFinalizer::new(
            self.project.clone(),
            waypoint.clone(),
            self.cost.clone(),
        )
        .with_judge(self.provider.clone());

        let mut executor = WaypointExecutor::new(
            self.project.clone(),
            waypoint.clone(),
            self.project.load_product_spec(),
            retrying,
            self.cost.clone(),
        )
        .with_finalizer(Box::new(finalizer))
        .with_max_iterations(max_iterations)
        .with_host_validations(self.config.host_validations)
        .with_checklist(self.config.checklist.clone());
        if let Some(cb) = on_progress {
            executor = executor.with_progress(cb);
        }

        self.active_cancel = Some(executor.cancel_token());
        let outcome = executor.execute().await;
        self.active_cancel = None;
        self.last_log = executor.take_log_writer();

        match outcome {
            Ok(ExecutionResult::Success) => {
                self.set_status(waypoint_id, WaypointStatus::Complete)?;
                self.check_parent_completion(waypoint_id);
                Ok(ExecutionResult::Success)
            }
            Ok(result @ (ExecutionResult::Failed | ExecutionResult::MaxIterations)) => {
                self.set_status(waypoint_id, WaypointStatus::Failed)?;
                Ok(result)
            }
            Ok(ExecutionResult::Cancelled) => {
                self.set_status(waypoint_id, WaypointStatus::Pending)?;
                Ok(ExecutionResult::Cancelled)
            }
            Ok(result) => Ok(result),
            Err(InterventionNeeded { intervention }) => {
                warn!(
                    waypoint = %waypoint_id,
                    kind = %intervention.kind,
                    "Execution raised intervention"
                );
                self.current_intervention = Some(intervention);
                Ok(ExecutionResult::InterventionNeeded)
            }
        }
    }

    /// Map an executor outcome to the next directive
    pub fn handle_execution_result(
        &mut self,
        waypoint_id: &str,
        result: ExecutionResult,
    ) -> NextAction {
        let pending = self.current_intervention.clone();
        self.controller
            .handle_execution_result(&self.plan, waypoint_id, result, pending)
    }

    /// Request cooperative cancellation of the active execution
    pub fn cancel_execution(&mut self) {
        if let Some(cancel) = &self.active_cancel {
            cancel.cancel();
        }
        if let Some(log) = self.last_log.as_mut() {
            let _ = log.log_pause();
        }
        self.controller.request_pause();
    }

    // ── Receipts & git ─────────────────────────────────────────────────

    /// Most recent receipt for a waypoint
    pub fn latest_receipt(&self, waypoint: &Waypoint) -> Option<(PathBuf, ChecklistReceipt)> {
        let dir = self.project.receipts_dir();
        let prefix = format!("{}-", waypoint.id_slug());
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|x| x == "json")
                    && p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
            })
            .collect();
        // Timestamped names sort chronologically
        paths.sort();
        let path = paths.pop()?;
        let receipt = ChecklistReceipt::load(&path).ok()?;
        Some((path, receipt))
    }

    /// Validate the latest receipt, then commit and tag the waypoint
    pub fn commit_waypoint(&mut self, waypoint_id: &str) -> FlightResult<CommitOutcome> {
        let waypoint = self
            .plan
            .get(waypoint_id)
            .cloned()
            .ok_or_else(|| FlightError::unknown_waypoint(waypoint_id))?;
        let mut notices = Vec::new();

        let receipt = self.latest_receipt(&waypoint);
        match &receipt {
            None => {
                notices.push(Notice::error(format!(
                    "No receipt found for {waypoint_id}; refusing to commit"
                )));
                return Ok(CommitOutcome {
                    status: CommitStatus::SkippedNoReceipt,
                    commit_hash: None,
                    commit_message: None,
                    notices,
                });
            }
            Some((path, receipt)) if !receipt.is_valid() => {
                notices.push(Notice::error(format!(
                    "Receipt {} is not valid; refusing to commit",
                    path.display()
                )));
                return Ok(CommitOutcome {
                    status: CommitStatus::SkippedNoReceipt,
                    commit_hash: None,
                    commit_message: None,
                    notices,
                });
            }
            Some(_) => {}
        }

        if !self.git.is_git_repo() {
            notices.push(Notice::warning(
                "Project is not a git repository; skipping commit",
            ));
            return Ok(CommitOutcome {
                status: CommitStatus::Failed,
                commit_hash: None,
                commit_message: None,
                notices,
            });
        }

        let message = format!(
            "{} {}: {}",
            self.config.git.commit_prefix, waypoint.id, waypoint.title
        );
        let commit = self.git.commit(&message)?;
        if let Some(log) = self.last_log.as_mut() {
            let _ = log.log_git_commit(commit.success, commit.hash.clone(), Some(message.clone()));
        }

        if !commit.success {
            notices.push(Notice::info(commit.message.clone()));
            return Ok(CommitOutcome {
                status: CommitStatus::NothingToCommit,
                commit_hash: None,
                commit_message: Some(message),
                notices,
            });
        }

        let hash = commit.hash.clone().unwrap_or_default();
        if self.config.git.auto_tag {
            let tag = format!("{}{}", self.config.git.tag_prefix, waypoint.id_slug());
            if let Err(e) = self.git.tag(&tag, &hash) {
                notices.push(Notice::warning(format!("Tagging failed: {e}")));
            } else {
                notices.push(Notice::info(format!("Tagged {tag} at {hash}")));
            }
        }

        info!(waypoint = %waypoint_id, hash = %hash, "Waypoint committed");
        Ok(CommitOutcome {
            status: CommitStatus::Committed,
            commit_hash: Some(hash),
            commit_message: Some(message),
            notices,
        })
    }

    /// Hard-reset the working tree and reload the plan from disk
    pub fn rollback_to_ref(&mut self, reference: &str) -> FlightResult<RollbackResult> {
        let ResetResult { success, message } = self.git.reset_hard(reference)?;
        if self.store.exists() {
            self.plan = self.store.load()?;
        }
        Ok(RollbackResult { success, message })
    }

    /// Log readiness of the parent epic. Never auto-completes: the epic
    /// must itself be executed to verify its own criteria.
    pub fn check_parent_completion(&self, waypoint_id: &str) {
        let Some(parent_id) = self
            .plan
            .get(waypoint_id)
            .and_then(|w| w.parent_id.clone())
        else {
            return;
        };
        if self.plan.children_complete(&parent_id) {
            info!(
                parent = %parent_id,
                "All children complete; parent epic is ready for execution"
            );
        }
    }

    // ── Interventions ──────────────────────────────────────────────────

    /// Resolve the pending intervention.
    ///
    /// `legacy_rollback_tag` is accepted only here, at the outermost API
    /// boundary, and normalized into the resolution's `rollback_ref`.
    pub fn handle_intervention(
        &mut self,
        mut resolution: InterventionResolution,
        legacy_rollback_tag: Option<String>,
    ) -> FlightResult<NextAction> {
        let intervention = self
            .current_intervention
            .take()
            .ok_or_else(|| FlightError::config("no intervention pending"))?;
        let waypoint_id = intervention.waypoint.id.clone();

        if resolution.rollback_ref.is_none() {
            resolution.rollback_ref = legacy_rollback_tag;
        }

        if let Some(log) = self.last_log.as_mut() {
            let mut params = serde_json::Map::new();
            if let Some(n) = resolution.additional_iterations {
                params.insert("additional_iterations".into(), n.into());
            }
            if let Some(r) = &resolution.rollback_ref {
                params.insert("rollback_ref".into(), r.clone().into());
            }
            let _ = log.log_intervention_resolved(resolution.action, params);
        }

        match resolution.action {
            InterventionAction::Retry => {
                if let Some(extra) = resolution.additional_iterations {
                    self.next_max_iterations = Some(self.config.max_iterations + extra);
                }
                self.set_status(&waypoint_id, WaypointStatus::Pending)?;
                let wp = self
                    .plan
                    .get(&waypoint_id)
                    .cloned()
                    .ok_or_else(|| FlightError::unknown_waypoint(&waypoint_id))?;
                Ok(NextAction::Continue(wp))
            }
            InterventionAction::Skip => {
                self.set_status(&waypoint_id, WaypointStatus::Skipped)?;
                match self.select_next_waypoint(false) {
                    Some(next) => Ok(NextAction::Execute(next)),
                    None => Ok(NextAction::Complete(format!(
                        "{waypoint_id} skipped; no runnable waypoint remains"
                    ))),
                }
            }
            InterventionAction::Edit => {
                let modified = resolution
                    .modified_waypoint
                    .ok_or_else(|| FlightError::config("edit resolution without a waypoint"))?;
                let id = modified.id.clone();
                self.update_waypoint(modified)?;
                let wp = self
                    .plan
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| FlightError::unknown_waypoint(&id))?;
                Ok(NextAction::Continue(wp))
            }
            InterventionAction::Rollback => {
                let reference = resolution
                    .rollback_ref
                    .ok_or_else(|| FlightError::config("rollback resolution without a ref"))?;
                let result = self.rollback_to_ref(&reference)?;
                self.set_status(&waypoint_id, WaypointStatus::Pending)?;
                Ok(NextAction::Pause(format!(
                    "Rolled back to {reference}: {}",
                    result.message
                )))
            }
            InterventionAction::Abort => Ok(NextAction::Abort(format!(
                "Aborted at {waypoint_id} ({})",
                intervention.kind
            ))),
        }
    }
}
