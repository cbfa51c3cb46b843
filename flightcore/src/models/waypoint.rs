//! Waypoint model — one planned unit of work with acceptance criteria.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a waypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaypointStatus {
    /// Not yet started
    #[default]
    Pending,
    /// Currently being executed
    InProgress,
    /// All acceptance criteria verified
    Complete,
    /// Execution gave up
    Failed,
    /// Operator chose to skip
    Skipped,
    /// Blocked by a failed or incomplete dependency
    Blocked,
}

impl std::fmt::Display for WaypointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

fn default_created_at() -> DateTime<Utc> {
    Utc::now()
}

/// A unit of planned work inside a flight plan.
///
/// Waypoints form a forest via `parent_id` and a DAG via `dependencies`.
/// A waypoint with children (an epic) is complete only after every child
/// is complete and the epic itself has been executed to verify its own
/// criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Opaque identifier, stable across the plan's lifetime (e.g. "WP-3")
    pub id: String,

    /// Human-readable title
    pub title: String,

    /// Free-text objective describing what to build
    pub objective: String,

    /// Ordered acceptance criteria, addressed by index 0..n-1
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    /// Parent waypoint id (forms the forest)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Waypoint this one was forked from for debugging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_of: Option<String>,

    /// Ids of waypoints that must be complete before this one runs
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Pitfalls and notes accumulated across retries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolution_notes: Vec<String>,

    /// Chart-time summary of the spec slice this waypoint was planned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_context_summary: Option<String>,

    /// Spec section references recorded at chart time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spec_section_refs: Vec<String>,

    /// Content hash of the spec this waypoint was planned against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_context_hash: Option<String>,

    /// Current status
    #[serde(default)]
    pub status: WaypointStatus,

    /// When the waypoint was created
    #[serde(default = "default_created_at")]
    pub created_at: DateTime<Utc>,

    /// When the waypoint reached `Complete`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Waypoint {
    /// Create a waypoint with required fields only
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        objective: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            objective: objective.into(),
            acceptance_criteria: Vec::new(),
            parent_id: None,
            debug_of: None,
            dependencies: Vec::new(),
            resolution_notes: Vec::new(),
            spec_context_summary: None,
            spec_section_refs: Vec::new(),
            spec_context_hash: None,
            status: WaypointStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Add an acceptance criterion
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }

    /// Add a dependency
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Set the parent id
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    /// Mark complete, stamping the completion time
    pub fn mark_complete(&mut self) {
        self.status = WaypointStatus::Complete;
        self.completed_at = Some(Utc::now());
    }

    /// Record a retry pitfall for future attempts
    pub fn add_resolution_note(&mut self, note: impl Into<String>) {
        self.resolution_notes.push(note.into());
    }

    /// Whether an edit to this waypoint's substance forces a re-run.
    ///
    /// Objective, criteria, and dependency changes invalidate any prior
    /// completion; title or note changes do not.
    pub fn substantive_edit(&self, updated: &Waypoint) -> bool {
        self.objective != updated.objective
            || self.acceptance_criteria != updated.acceptance_criteria
            || self.dependencies != updated.dependencies
    }

    /// Id slug used in journal and receipt filenames
    pub fn id_slug(&self) -> String {
        self.id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_minimal_waypoint() {
        let wp = Waypoint::new("WP-1", "Test", "Test objective");
        assert_eq!(wp.id, "WP-1");
        assert_eq!(wp.status, WaypointStatus::Pending);
        assert!(wp.acceptance_criteria.is_empty());
        assert!(wp.dependencies.is_empty());
        assert!(wp.parent_id.is_none());
        assert!(wp.completed_at.is_none());
    }

    #[test]
    fn test_builder_fields() {
        let wp = Waypoint::new("WP-1a", "Sub", "Detailed")
            .with_criterion("Criterion 1")
            .with_criterion("Criterion 2")
            .with_parent("WP-1")
            .with_dependency("WP-0");
        assert_eq!(wp.acceptance_criteria.len(), 2);
        assert_eq!(wp.parent_id.as_deref(), Some("WP-1"));
        assert_eq!(wp.dependencies, vec!["WP-0".to_string()]);
    }

    #[test]
    fn test_mark_complete_stamps_time() {
        let mut wp = Waypoint::new("WP-1", "Test", "Obj");
        wp.mark_complete();
        assert_eq!(wp.status, WaypointStatus::Complete);
        assert!(wp.completed_at.is_some());
    }

    #[test]
    fn test_substantive_edit_detection() {
        let wp = Waypoint::new("WP-1", "Test", "Obj").with_criterion("C1");

        let mut renamed = wp.clone();
        renamed.title = "Renamed".to_string();
        assert!(!wp.substantive_edit(&renamed));

        let mut new_objective = wp.clone();
        new_objective.objective = "Different".to_string();
        assert!(wp.substantive_edit(&new_objective));

        let mut new_criteria = wp.clone();
        new_criteria.acceptance_criteria.push("C2".to_string());
        assert!(wp.substantive_edit(&new_criteria));

        let mut new_deps = wp.clone();
        new_deps.dependencies.push("WP-0".to_string());
        assert!(wp.substantive_edit(&new_deps));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut original = Waypoint::new("WP-1", "Roundtrip", "Test roundtrip")
            .with_criterion("Roundtrip works")
            .with_parent("WP-0")
            .with_dependency("WP-X");
        original.status = WaypointStatus::Failed;

        let json = serde_json::to_string(&original).unwrap();
        let restored: Waypoint = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, original);
    }

    #[test]
    fn test_from_minimal_json() {
        let wp: Waypoint = serde_json::from_str(
            r#"{"id":"WP-2","title":"Restored","objective":"Restored objective"}"#,
        )
        .unwrap();
        assert_eq!(wp.id, "WP-2");
        assert_eq!(wp.status, WaypointStatus::Pending);
        assert!(wp.acceptance_criteria.is_empty());
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&WaypointStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(WaypointStatus::Complete.to_string(), "complete");
    }

    #[test]
    fn test_id_slug() {
        let wp = Waypoint::new("WP-1a", "T", "O");
        assert_eq!(wp.id_slug(), "wp1a");
    }
}
