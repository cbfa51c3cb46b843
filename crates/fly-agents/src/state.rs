//! Executor state machine — explicit states with legal-transition guards.
//!
//! Every transition is validated and journaled so an offline replay can
//! reconstruct the exact path a run took.

use flightcore::journal::ExecutionLogWriter;

/// States of one execution run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    /// Constructed, not yet running
    Idle,
    /// Iterating against the provider
    Running,
    /// Marker seen; receipt pipeline in flight
    Finalizing,
    /// Terminal: receipt verified
    Success,
    /// Terminal: failed
    Failed,
    /// Terminal: iteration budget exhausted
    MaxIterations,
    /// Terminal: cooperative cancel
    Cancelled,
    /// Terminal: handed to the operator
    InterventionNeeded,
}

impl ExecutorState {
    /// Whether no further transitions are allowed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Failed
                | Self::MaxIterations
                | Self::Cancelled
                | Self::InterventionNeeded
        )
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::MaxIterations => write!(f, "max_iterations"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::InterventionNeeded => write!(f, "intervention_needed"),
        }
    }
}

/// Legal edges of the executor state graph:
/// ```text
/// idle → running
/// running → finalizing | cancelled | intervention_needed | max_iterations | failed
/// finalizing → success | running | failed | intervention_needed
/// ```
fn is_legal_transition(from: ExecutorState, to: ExecutorState) -> bool {
    use ExecutorState::*;
    matches!(
        (from, to),
        (Idle, Running)
            | (Running, Finalizing)
            | (Running, Cancelled)
            | (Running, InterventionNeeded)
            | (Running, MaxIterations)
            | (Running, Failed)
            | (Finalizing, Success)
            | (Finalizing, Running)
            | (Finalizing, Failed)
            | (Finalizing, InterventionNeeded)
    )
}

/// Tracks the current state and journals every transition
pub struct StateTracker {
    current: ExecutorState,
}

impl StateTracker {
    /// Fresh tracker in `Idle`
    pub fn new() -> Self {
        Self {
            current: ExecutorState::Idle,
        }
    }

    /// Current state
    pub fn current(&self) -> ExecutorState {
        self.current
    }

    /// Move to `to`, journaling the edge. Illegal edges are rejected.
    pub fn advance(
        &mut self,
        to: ExecutorState,
        reason: Option<String>,
        log: &mut ExecutionLogWriter,
    ) -> bool {
        if !is_legal_transition(self.current, to) {
            tracing::warn!(from = %self.current, to = %to, "Rejected illegal state transition");
            return false;
        }
        let _ = log.log_state_transition(self.current.to_string(), to.to_string(), reason);
        self.current = to;
        true
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flightcore::models::{Project, Waypoint};
    use tempfile::tempdir;

    fn log() -> (tempfile::TempDir, ExecutionLogWriter) {
        let dir = tempdir().unwrap();
        let project = Project::new("sm", dir.path());
        let waypoint = Waypoint::new("WP-1", "T", "O");
        let writer = ExecutionLogWriter::new(&project, &waypoint).unwrap();
        (dir, writer)
    }

    #[test]
    fn test_happy_path_transitions() {
        let (_dir, mut writer) = log();
        let mut tracker = StateTracker::new();
        assert!(tracker.advance(ExecutorState::Running, None, &mut writer));
        assert!(tracker.advance(ExecutorState::Finalizing, Some("marker".into()), &mut writer));
        assert!(tracker.advance(ExecutorState::Success, None, &mut writer));
        assert!(tracker.current().is_terminal());
    }

    #[test]
    fn test_finalize_retry_loop() {
        let (_dir, mut writer) = log();
        let mut tracker = StateTracker::new();
        tracker.advance(ExecutorState::Running, None, &mut writer);
        tracker.advance(ExecutorState::Finalizing, None, &mut writer);
        // Invalid receipt with iterations left goes back to running
        assert!(tracker.advance(ExecutorState::Running, Some("host validation".into()), &mut writer));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let (_dir, mut writer) = log();
        let mut tracker = StateTracker::new();
        assert!(!tracker.advance(ExecutorState::Success, None, &mut writer));
        assert!(!tracker.advance(ExecutorState::Finalizing, None, &mut writer));

        tracker.advance(ExecutorState::Running, None, &mut writer);
        tracker.advance(ExecutorState::Cancelled, None, &mut writer);
        // Terminal: nothing further
        assert!(!tracker.advance(ExecutorState::Running, None, &mut writer));
    }

    #[test]
    fn test_transitions_are_journaled() {
        let (_dir, mut writer) = log();
        let mut tracker = StateTracker::new();
        tracker.advance(ExecutorState::Running, None, &mut writer);
        tracker.advance(ExecutorState::Finalizing, None, &mut writer);

        let content = std::fs::read_to_string(writer.path()).unwrap();
        let transitions: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .filter(|v: &serde_json::Value| v["type"] == "state_transition")
            .collect();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0]["from_state"], "idle");
        assert_eq!(transitions[1]["to_state"], "finalizing");
    }
}
