//! Terminal outcomes of a waypoint execution run.

use serde::{Deserialize, Serialize};

/// How an execution run ended.
///
/// The executor terminates through exactly one of these, or raises
/// [`crate::intervention::InterventionNeeded`] instead of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Completion marker seen and receipt verified
    Success,
    /// Receipt invalid or unrecoverable failure
    Failed,
    /// Iteration budget exhausted without a marker
    MaxIterations,
    /// Cooperative cancellation
    Cancelled,
    /// Control handed back to the operator
    InterventionNeeded,
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::MaxIterations => write!(f, "max_iterations"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InterventionNeeded => write!(f, "intervention_needed"),
        }
    }
}
