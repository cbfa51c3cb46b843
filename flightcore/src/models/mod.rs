//! Domain model: waypoints, flight plan, project layout, history journal.

pub mod flight_plan;
pub mod history;
pub mod project;
pub mod waypoint;

pub use flight_plan::{CompletionStatus, FlightPlan, FlightPlanStore};
pub use history::{WaypointHistoryEvent, WaypointHistoryWriter};
pub use project::{slugify, Project, SPEC_POINTER};
pub use waypoint::{Waypoint, WaypointStatus};

/// Length of the truncated spec hash carried on waypoints
const SPEC_HASH_LEN: usize = 20;

/// Content hash of a product spec, used for chart-time staleness checks.
///
/// Normalizes line endings and surrounding whitespace so cosmetic edits
/// do not flag every waypoint as stale.
pub fn compute_spec_hash(spec: &str) -> String {
    let normalized = spec.replace("\r\n", "\n");
    let digest = blake3::hash(normalized.trim().as_bytes());
    digest.to_hex().as_str()[..SPEC_HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_is_stable_and_truncated() {
        let a = compute_spec_hash("# Spec\n\nBody");
        let b = compute_spec_hash("# Spec\r\n\r\nBody\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), SPEC_HASH_LEN);
    }

    #[test]
    fn test_spec_hash_differs_on_content_change() {
        assert_ne!(compute_spec_hash("old"), compute_spec_hash("new"));
    }
}
