//! Execution controller — waypoint selection and directive mapping.
//!
//! Stateless with respect to persistence (the coordinator owns the plan
//! and saves it); stateful with respect to the current run. Converts
//! executor outcomes into [`NextAction`] directives for the UI driver.

use tracing::info;

use flightcore::error::{FlightError, FlightResult};
use flightcore::intervention::Intervention;
use flightcore::models::{FlightPlan, Waypoint, WaypointStatus};
use flightcore::outcome::ExecutionResult;

/// What the driver should do next (closed set)
#[derive(Debug, Clone)]
pub enum NextAction {
    /// Run this waypoint
    Execute(Waypoint),
    /// Keep going with this waypoint (after an intervention retry)
    Continue(Waypoint),
    /// Stop and wait for the operator
    Pause(String),
    /// Show the intervention to the operator
    Intervention(Box<Intervention>),
    /// This unit of work finished; nothing else is runnable yet
    Complete(String),
    /// Every waypoint is complete
    Land(String),
    /// Stop execution entirely
    Abort(String),
}

impl NextAction {
    /// Short action name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Execute(_) => "execute",
            Self::Continue(_) => "continue",
            Self::Pause(_) => "pause",
            Self::Intervention(_) => "intervention",
            Self::Complete(_) => "complete",
            Self::Land(_) => "land",
            Self::Abort(_) => "abort",
        }
    }
}

/// Controller run status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Nothing running
    Idle,
    /// A waypoint is executing
    Running,
    /// Pause requested; takes effect at the next iteration boundary
    PausePending,
    /// Stopped with runnable work blocked
    Paused,
    /// Every waypoint complete
    Done,
}

/// Drives waypoint selection and status transitions for one project
pub struct ExecutionController {
    status: ControllerStatus,
    current_waypoint_id: Option<String>,
}

impl ExecutionController {
    /// Fresh controller
    pub fn new() -> Self {
        Self {
            status: ControllerStatus::Idle,
            current_waypoint_id: None,
        }
    }

    /// Current status
    pub fn status(&self) -> ControllerStatus {
        self.status
    }

    /// Waypoint currently selected for execution
    pub fn current_waypoint_id(&self) -> Option<&str> {
        self.current_waypoint_id.as_deref()
    }

    /// Crash recovery at startup: any stale `in_progress` waypoint goes
    /// back to `pending`. Returns whether the plan changed (caller saves).
    pub fn initialize(&mut self, plan: &mut FlightPlan) -> bool {
        let mut changed = false;
        for wp in &mut plan.waypoints {
            if wp.status == WaypointStatus::InProgress {
                info!(waypoint = %wp.id, "Resetting stale in_progress waypoint to pending");
                wp.status = WaypointStatus::Pending;
                changed = true;
            }
        }
        self.status = ControllerStatus::Idle;
        changed
    }

    /// Whether a waypoint is runnable right now
    fn is_runnable(plan: &FlightPlan, wp: &Waypoint, include_in_progress: bool) -> bool {
        let status_ok = match wp.status {
            WaypointStatus::Pending => true,
            WaypointStatus::InProgress | WaypointStatus::Failed => include_in_progress,
            _ => false,
        };
        status_ok && plan.dependencies_complete(wp) && plan.children_complete(&wp.id)
    }

    /// First runnable waypoint in tree order.
    ///
    /// Dependencies must be complete; epics become selectable only after
    /// every child completes (execution then verifies the epic's own
    /// criteria). `include_in_progress` additionally admits in-progress
    /// and failed waypoints for retries.
    pub fn select_next_waypoint(
        &self,
        plan: &FlightPlan,
        include_in_progress: bool,
    ) -> Option<Waypoint> {
        plan.iterate_in_order()
            .into_iter()
            .map(|(wp, _)| wp)
            .find(|wp| Self::is_runnable(plan, wp, include_in_progress))
            .cloned()
    }

    /// Status the controller lands in when nothing is runnable
    pub fn settle(&mut self, plan: &FlightPlan) -> ControllerStatus {
        let status = plan.completion_status();
        self.status = if status.all_complete() {
            ControllerStatus::Done
        } else if status.has_failed() || status.blocked > 0 {
            ControllerStatus::Paused
        } else {
            ControllerStatus::Idle
        };
        self.status
    }

    /// Begin running a waypoint. Validates selectability first.
    pub fn start(&mut self, plan: &FlightPlan, waypoint_id: &str) -> FlightResult<()> {
        let wp = plan
            .get(waypoint_id)
            .ok_or_else(|| FlightError::unknown_waypoint(waypoint_id))?;
        if !Self::is_runnable(plan, wp, true) {
            return Err(FlightError::invalid_plan(format!(
                "waypoint {} is not selectable (status {}, deps complete: {})",
                wp.id,
                wp.status,
                plan.dependencies_complete(wp)
            )));
        }
        self.current_waypoint_id = Some(waypoint_id.to_string());
        self.status = ControllerStatus::Running;
        Ok(())
    }

    /// Request a pause; honored at the next iteration boundary
    pub fn request_pause(&mut self) {
        if self.status == ControllerStatus::Running {
            self.status = ControllerStatus::PausePending;
        }
    }

    /// Whether a pause request is pending
    pub fn pause_pending(&self) -> bool {
        self.status == ControllerStatus::PausePending
    }

    /// Map an executor outcome to the next directive.
    ///
    /// `pending_intervention` carries the intervention captured when the
    /// executor raised instead of returning.
    pub fn handle_execution_result(
        &mut self,
        plan: &FlightPlan,
        waypoint_id: &str,
        result: ExecutionResult,
        pending_intervention: Option<Intervention>,
    ) -> NextAction {
        self.current_waypoint_id = None;
        match result {
            ExecutionResult::Success => {
                // Parent epic ready once all its children are complete
                if let Some(parent_id) = plan.get(waypoint_id).and_then(|w| w.parent_id.clone()) {
                    if plan.children_complete(&parent_id) {
                        if let Some(parent) = plan.get(&parent_id) {
                            if parent.status != WaypointStatus::Complete {
                                self.status = ControllerStatus::Running;
                                return NextAction::Execute(parent.clone());
                            }
                        }
                    }
                }
                if plan.completion_status().all_complete() {
                    self.status = ControllerStatus::Done;
                    let status = plan.completion_status();
                    return NextAction::Land(format!(
                        "All {} waypoints complete",
                        status.total
                    ));
                }
                match self.select_next_waypoint(plan, false) {
                    Some(next) => {
                        self.status = ControllerStatus::Running;
                        NextAction::Execute(next)
                    }
                    None => {
                        self.settle(plan);
                        NextAction::Complete(format!(
                            "{waypoint_id} complete; no runnable waypoint remains"
                        ))
                    }
                }
            }
            ExecutionResult::Failed
            | ExecutionResult::MaxIterations
            | ExecutionResult::Cancelled => match pending_intervention {
                Some(intervention) => {
                    self.status = ControllerStatus::Paused;
                    NextAction::Intervention(Box::new(intervention))
                }
                None => {
                    self.status = ControllerStatus::Paused;
                    NextAction::Pause(format!("Execution of {waypoint_id} ended: {result}"))
                }
            },
            ExecutionResult::InterventionNeeded => match pending_intervention {
                Some(intervention) => {
                    self.status = ControllerStatus::Paused;
                    NextAction::Intervention(Box::new(intervention))
                }
                None => {
                    self.status = ControllerStatus::Paused;
                    NextAction::Pause(format!(
                        "Execution of {waypoint_id} needs intervention"
                    ))
                }
            },
        }
    }
}

impl Default for ExecutionController {
    fn default() -> Self {
        Self::new()
    }
}
