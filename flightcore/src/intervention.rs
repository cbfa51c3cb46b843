//! Intervention protocol — structured control transfer back to the operator.
//!
//! When execution cannot proceed autonomously, the executor raises an
//! [`InterventionNeeded`] carrying the full context the operator needs to
//! decide between retrying, skipping, editing, rolling back, or aborting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Waypoint;

/// Situations requiring operator intervention (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// Hit the iteration budget without a completion marker
    IterationLimit,
    /// Host-run tests failed on the receipt
    TestFailure,
    /// Only lint-category commands failed
    LintError,
    /// Only type-check commands failed
    TypeError,
    /// Agent output could not be parsed
    ParseError,
    /// Operator interrupt
    UserRequested,
    /// General executor failure
    ExecutionError,
    /// Provider rate limit (429)
    RateLimited,
    /// Provider outage or network failure
    ApiUnavailable,
    /// Configured cost budget reached
    BudgetExceeded,
}

impl InterventionKind {
    /// Default action the UI should suggest for this kind
    pub fn suggested_action(&self) -> InterventionAction {
        match self {
            Self::IterationLimit => InterventionAction::Retry,
            Self::TestFailure => InterventionAction::Edit,
            Self::LintError => InterventionAction::Retry,
            Self::TypeError => InterventionAction::Retry,
            Self::ParseError => InterventionAction::Retry,
            Self::UserRequested => InterventionAction::Abort,
            Self::ExecutionError => InterventionAction::Retry,
            Self::RateLimited => InterventionAction::Retry,
            Self::ApiUnavailable => InterventionAction::Retry,
            Self::BudgetExceeded => InterventionAction::Abort,
        }
    }
}

impl std::fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IterationLimit => "iteration_limit",
            Self::TestFailure => "test_failure",
            Self::LintError => "lint_error",
            Self::TypeError => "type_error",
            Self::ParseError => "parse_error",
            Self::UserRequested => "user_requested",
            Self::ExecutionError => "execution_error",
            Self::RateLimited => "rate_limited",
            Self::ApiUnavailable => "api_unavailable",
            Self::BudgetExceeded => "budget_exceeded",
        };
        write!(f, "{name}")
    }
}

/// Actions the operator can take to resolve an intervention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    /// Try the waypoint again, optionally with more iterations
    Retry,
    /// Mark the waypoint skipped and continue
    Skip,
    /// Edit the waypoint, then retry
    Edit,
    /// Roll the working tree back to a safe ref
    Rollback,
    /// Stop execution entirely
    Abort,
}

impl std::fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Edit => write!(f, "edit"),
            Self::Rollback => write!(f, "rollback"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Context captured when intervention is needed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    /// What went wrong
    pub kind: InterventionKind,
    /// The waypoint being worked
    pub waypoint: Waypoint,
    /// Iteration at which the trigger fired
    pub iteration: u32,
    /// Iteration budget for the run
    pub max_iterations: u32,
    /// Short free-text summary (1-10 lines, includes the last failed
    /// command when one is known)
    pub error_summary: String,
    /// Free-form diagnostic context
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// When the intervention was raised
    pub timestamp: DateTime<Utc>,
}

impl Intervention {
    /// Create an intervention with empty context
    pub fn new(
        kind: InterventionKind,
        waypoint: Waypoint,
        iteration: u32,
        max_iterations: u32,
        error_summary: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            waypoint,
            iteration,
            max_iterations,
            error_summary: error_summary.into(),
            context: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a context key-value pair
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Suggested action for this intervention's kind
    pub fn suggested_action(&self) -> InterventionAction {
        self.kind.suggested_action()
    }
}

/// The operator's decision on a pending intervention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionResolution {
    /// Chosen action
    pub action: InterventionAction,
    /// Extra iterations granted on retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_iterations: Option<u32>,
    /// Target ref for rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_ref: Option<String>,
    /// Replacement waypoint when editing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_waypoint: Option<Waypoint>,
}

impl InterventionResolution {
    /// A plain resolution with no parameters
    pub fn action(action: InterventionAction) -> Self {
        Self {
            action,
            additional_iterations: None,
            rollback_ref: None,
            modified_waypoint: None,
        }
    }

    /// Retry with additional iterations
    pub fn retry_with(additional_iterations: u32) -> Self {
        Self {
            additional_iterations: Some(additional_iterations),
            ..Self::action(InterventionAction::Retry)
        }
    }
}

/// Raised by the executor in lieu of returning a result
#[derive(Debug, Clone, Error)]
#[error(
    "intervention needed: {} at iteration {}/{}",
    .intervention.kind,
    .intervention.iteration,
    .intervention.max_iterations
)]
pub struct InterventionNeeded {
    /// The captured intervention context
    pub intervention: Intervention,
}

impl InterventionNeeded {
    /// Wrap an intervention
    pub fn new(intervention: Intervention) -> Self {
        Self { intervention }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waypoint() -> Waypoint {
        Waypoint::new("WP-1", "Test", "Objective")
    }

    #[test]
    fn test_suggested_actions() {
        assert_eq!(
            InterventionKind::IterationLimit.suggested_action(),
            InterventionAction::Retry
        );
        assert_eq!(
            InterventionKind::TestFailure.suggested_action(),
            InterventionAction::Edit
        );
        assert_eq!(
            InterventionKind::UserRequested.suggested_action(),
            InterventionAction::Abort
        );
        assert_eq!(
            InterventionKind::BudgetExceeded.suggested_action(),
            InterventionAction::Abort
        );
    }

    #[test]
    fn test_intervention_context_builder() {
        let i = Intervention::new(InterventionKind::RateLimited, waypoint(), 3, 10, "429")
            .with_context("api_error_type", "rate_limited")
            .with_context("retry_after_secs", 30);
        assert_eq!(
            i.context.get("api_error_type").unwrap().as_str(),
            Some("rate_limited")
        );
        assert_eq!(i.suggested_action(), InterventionAction::Retry);
    }

    #[test]
    fn test_error_message_includes_kind_and_iteration() {
        let err = InterventionNeeded::new(Intervention::new(
            InterventionKind::IterationLimit,
            waypoint(),
            10,
            10,
            "hit the limit",
        ));
        let msg = err.to_string();
        assert!(msg.contains("iteration_limit"));
        assert!(msg.contains("10/10"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let i = Intervention::new(InterventionKind::ApiUnavailable, waypoint(), 2, 10, "503");
        let json = serde_json::to_string(&i).unwrap();
        assert!(json.contains("\"kind\":\"api_unavailable\""));
        let restored: Intervention = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.kind, InterventionKind::ApiUnavailable);
    }

    #[test]
    fn test_resolution_helpers() {
        let r = InterventionResolution::retry_with(5);
        assert_eq!(r.action, InterventionAction::Retry);
        assert_eq!(r.additional_iterations, Some(5));
        assert!(r.rollback_ref.is_none());
    }
}
