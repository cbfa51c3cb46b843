//! Flight plan — an ordered forest of waypoints with dependency edges.
//!
//! The plan is a flat vector in tree order plus `parent_id` / `dependencies`
//! edges. There are no cycles by invariant, so index scans are sufficient
//! for every query at this scale.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FlightError, FlightResult};
use crate::models::waypoint::{Waypoint, WaypointStatus};

/// Schema name written to the flight-plan header line
pub const FLIGHT_PLAN_SCHEMA: &str = "flight_plan";
/// Current flight-plan schema version
pub const FLIGHT_PLAN_VERSION: &str = "1.0";

/// Summary of waypoint completion state across the plan
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub total: usize,
    pub complete: usize,
    pub pending: usize,
    pub failed: usize,
    pub blocked: usize,
    pub in_progress: usize,
    pub skipped: usize,
}

impl CompletionStatus {
    /// Whether every waypoint is complete
    pub fn all_complete(&self) -> bool {
        self.total > 0 && self.complete == self.total
    }

    /// Whether any waypoint has failed
    pub fn has_failed(&self) -> bool {
        self.failed > 0
    }
}

/// An ordered forest of waypoints with stable per-run identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightPlan {
    /// Waypoints in persisted tree order
    pub waypoints: Vec<Waypoint>,

    /// When the plan was created
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Default for FlightPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl FlightPlan {
    /// Create an empty plan
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            waypoints: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of waypoints
    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    /// Whether the plan holds no waypoints
    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Append a waypoint at the end of the stored order
    pub fn add_waypoint(&mut self, waypoint: Waypoint) {
        self.waypoints.push(waypoint);
        self.touch();
    }

    /// Look up a waypoint by id
    pub fn get(&self, id: &str) -> Option<&Waypoint> {
        self.waypoints.iter().find(|w| w.id == id)
    }

    /// Look up a waypoint mutably by id
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Waypoint> {
        self.waypoints.iter_mut().find(|w| w.id == id)
    }

    /// Root-level waypoints in stored order
    pub fn roots(&self) -> Vec<&Waypoint> {
        self.waypoints
            .iter()
            .filter(|w| w.parent_id.is_none())
            .collect()
    }

    /// Direct children of a waypoint, in stored order
    pub fn children_of(&self, id: &str) -> Vec<&Waypoint> {
        self.waypoints
            .iter()
            .filter(|w| w.parent_id.as_deref() == Some(id))
            .collect()
    }

    /// Whether a waypoint has children
    pub fn is_epic(&self, id: &str) -> bool {
        self.waypoints
            .iter()
            .any(|w| w.parent_id.as_deref() == Some(id))
    }

    /// Waypoints that list `id` among their dependencies
    pub fn dependents_of(&self, id: &str) -> Vec<&Waypoint> {
        self.waypoints
            .iter()
            .filter(|w| w.dependencies.iter().any(|d| d == id))
            .collect()
    }

    /// Whether every dependency of `waypoint` is complete
    pub fn dependencies_complete(&self, waypoint: &Waypoint) -> bool {
        waypoint.dependencies.iter().all(|dep| {
            self.get(dep)
                .map(|w| w.status == WaypointStatus::Complete)
                .unwrap_or(false)
        })
    }

    /// Whether every child of `id` is complete (vacuously true for leaves)
    pub fn children_complete(&self, id: &str) -> bool {
        self.children_of(id)
            .iter()
            .all(|c| c.status == WaypointStatus::Complete)
    }

    /// Replace a waypoint by id.
    ///
    /// A substantive edit (objective, criteria, or dependencies) resets the
    /// status to pending and clears the completion timestamp. Returns whether
    /// such a reset happened.
    pub fn update_waypoint(&mut self, updated: Waypoint) -> FlightResult<bool> {
        let existing = self
            .get_mut(&updated.id)
            .ok_or_else(|| FlightError::unknown_waypoint(&updated.id))?;

        let reset = existing.substantive_edit(&updated);
        *existing = updated;
        if reset {
            existing.status = WaypointStatus::Pending;
            existing.completed_at = None;
        }
        self.touch();
        Ok(reset)
    }

    /// Remove a waypoint and its entire subtree; returns removed ids
    pub fn remove_waypoint(&mut self, id: &str) -> Vec<String> {
        let mut doomed: HashSet<String> = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            if doomed.insert(current.clone()) {
                for child in self.children_of(&current) {
                    frontier.push(child.id.clone());
                }
            }
        }
        let mut removed: Vec<String> = Vec::new();
        self.waypoints.retain(|w| {
            if doomed.contains(&w.id) {
                removed.push(w.id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.touch();
        }
        removed
    }

    /// Insert waypoints immediately after `after_id` in stored order.
    ///
    /// Unknown anchors append at the end.
    pub fn insert_after(&mut self, after_id: &str, waypoints: Vec<Waypoint>) {
        let at = self
            .waypoints
            .iter()
            .position(|w| w.id == after_id)
            .map(|i| i + 1)
            .unwrap_or(self.waypoints.len());
        for (offset, wp) in waypoints.into_iter().enumerate() {
            self.waypoints.insert(at + offset, wp);
        }
        self.touch();
    }

    /// Reorder root-level siblings to match `new_order`.
    ///
    /// Children travel with their parents; ids absent from `new_order`
    /// keep their relative position at the end.
    pub fn reorder_roots(&mut self, new_order: &[String]) {
        let mut by_root: Vec<(String, Vec<Waypoint>)> = Vec::new();
        for (wp, _) in self.iterate_in_order() {
            if wp.parent_id.is_none() {
                by_root.push((wp.id.clone(), vec![wp.clone()]));
            } else if let Some(last) = by_root.last_mut() {
                last.1.push(wp.clone());
            }
        }

        let mut ordered: Vec<Waypoint> = Vec::with_capacity(self.waypoints.len());
        let mut placed: HashSet<&str> = HashSet::new();
        for root_id in new_order {
            if let Some((_, subtree)) = by_root.iter().find(|(id, _)| id == root_id) {
                placed.insert(root_id.as_str());
                ordered.extend(subtree.iter().cloned());
            }
        }
        for (id, subtree) in &by_root {
            if !placed.contains(id.as_str()) {
                ordered.extend(subtree.iter().cloned());
            }
        }

        self.waypoints = ordered;
        self.touch();
    }

    /// Iterate waypoints in tree order with depth
    pub fn iterate_in_order(&self) -> Vec<(&Waypoint, usize)> {
        let mut out = Vec::with_capacity(self.waypoints.len());
        for root in self.roots() {
            self.push_subtree(root, 0, &mut out);
        }
        out
    }

    fn push_subtree<'a>(
        &'a self,
        node: &'a Waypoint,
        depth: usize,
        out: &mut Vec<(&'a Waypoint, usize)>,
    ) {
        out.push((node, depth));
        for child in self.children_of(&node.id) {
            self.push_subtree(child, depth + 1, out);
        }
    }

    /// Validate dependency edges: unknown ids and cycles are errors.
    ///
    /// Returns human-readable problems; an empty vector means valid.
    pub fn validate_dependencies(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let ids: HashSet<&str> = self.waypoints.iter().map(|w| w.id.as_str()).collect();

        for wp in &self.waypoints {
            for dep in &wp.dependencies {
                if !ids.contains(dep.as_str()) {
                    errors.push(format!("{} depends on unknown waypoint {}", wp.id, dep));
                }
            }
        }

        // Cycle detection: DFS with three-color marking over dependency edges
        let mut state: HashMap<&str, u8> = HashMap::new();
        for wp in &self.waypoints {
            if self.dep_cycle_from(wp.id.as_str(), &mut state) {
                errors.push(format!("Circular dependency involving {}", wp.id));
            }
        }

        errors
    }

    fn dep_cycle_from<'a>(&'a self, id: &'a str, state: &mut HashMap<&'a str, u8>) -> bool {
        match state.get(id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        state.insert(id, 1);
        if let Some(wp) = self.get(id) {
            for dep in &wp.dependencies {
                if let Some(dep_wp) = self.get(dep) {
                    if self.dep_cycle_from(dep_wp.id.as_str(), state) {
                        return true;
                    }
                }
            }
        }
        state.insert(id, 2);
        false
    }

    /// Summarize completion state
    pub fn completion_status(&self) -> CompletionStatus {
        let mut status = CompletionStatus {
            total: self.waypoints.len(),
            ..Default::default()
        };
        for wp in &self.waypoints {
            match wp.status {
                WaypointStatus::Complete => status.complete += 1,
                WaypointStatus::Pending => status.pending += 1,
                WaypointStatus::Failed => status.failed += 1,
                WaypointStatus::Blocked => status.blocked += 1,
                WaypointStatus::InProgress => status.in_progress += 1,
                WaypointStatus::Skipped => status.skipped += 1,
            }
        }
        status
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Persistence — JSONL with a schema header line
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PlanHeader {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(rename = "_schema")]
    schema: String,
    #[serde(rename = "_version")]
    version: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Reads and writes the flight plan file (`flight-plan.jsonl`)
pub struct FlightPlanStore {
    path: PathBuf,
}

impl FlightPlanStore {
    /// Store for a plan file path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the plan file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a plan file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist the plan: header line, then one waypoint per line in tree order
    pub fn save(&self, plan: &FlightPlan) -> FlightResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&self.path)?;
        let header = PlanHeader {
            record_type: "header".to_string(),
            schema: FLIGHT_PLAN_SCHEMA.to_string(),
            version: FLIGHT_PLAN_VERSION.to_string(),
            created_at: plan.created_at,
            updated_at: plan.updated_at,
        };
        writeln!(file, "{}", serde_json::to_string(&header)?)?;
        for (wp, _) in plan.iterate_in_order() {
            writeln!(file, "{}", serde_json::to_string(wp)?)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Load the plan, preserving stored order
    pub fn load(&self) -> FlightResult<FlightPlan> {
        if !self.path.exists() {
            return Err(FlightError::PlanNotFound {
                path: self.path.clone(),
            });
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .transpose()?
            .ok_or_else(|| FlightError::MissingHeader {
                path: self.path.clone(),
            })?;
        let header: PlanHeader =
            serde_json::from_str(&header_line).map_err(|_| FlightError::MissingHeader {
                path: self.path.clone(),
            })?;
        if header.schema != FLIGHT_PLAN_SCHEMA {
            return Err(FlightError::UnsupportedSchema {
                schema: header.schema,
                path: self.path.clone(),
            });
        }

        let mut plan = FlightPlan {
            waypoints: Vec::new(),
            created_at: header.created_at,
            updated_at: header.updated_at,
        };
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Waypoint>(&line) {
                Ok(wp) => plan.waypoints.push(wp),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Skipping malformed plan line"),
            }
        }
        Ok(plan)
    }

    /// Append a single waypoint line without rewriting the file
    pub fn append_waypoint(&self, waypoint: &Waypoint) -> FlightResult<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(waypoint)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn plan_with(ids: &[&str]) -> FlightPlan {
        let mut plan = FlightPlan::new();
        for id in ids {
            plan.add_waypoint(Waypoint::new(*id, format!("Title {id}"), "Objective"));
        }
        plan
    }

    #[test]
    fn test_empty_plan() {
        let plan = FlightPlan::new();
        assert!(plan.is_empty());
        assert_eq!(plan.completion_status().total, 0);
        assert!(!plan.completion_status().all_complete());
    }

    #[test]
    fn test_lookup_and_children() {
        let mut plan = plan_with(&["WP-1"]);
        plan.add_waypoint(Waypoint::new("WP-1a", "Child", "C").with_parent("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-2", "Root 2", "R"));

        assert!(plan.get("WP-1").is_some());
        assert!(plan.get("WP-404").is_none());
        assert_eq!(plan.roots().len(), 2);
        assert_eq!(plan.children_of("WP-1").len(), 1);
        assert!(plan.is_epic("WP-1"));
        assert!(!plan.is_epic("WP-2"));
    }

    #[test]
    fn test_dependents() {
        let mut plan = plan_with(&["WP-1"]);
        plan.add_waypoint(Waypoint::new("WP-2", "Second", "S").with_dependency("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-3", "Third", "T").with_dependency("WP-1"));

        let dependents = plan.dependents_of("WP-1");
        assert_eq!(dependents.len(), 2);
    }

    #[test]
    fn test_iterate_in_order_with_depth() {
        let mut plan = plan_with(&["WP-1"]);
        plan.add_waypoint(Waypoint::new("WP-1a", "Child", "C").with_parent("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-1a1", "Grandchild", "G").with_parent("WP-1a"));
        plan.add_waypoint(Waypoint::new("WP-2", "Root 2", "R"));

        let order: Vec<(&str, usize)> = plan
            .iterate_in_order()
            .into_iter()
            .map(|(w, d)| (w.id.as_str(), d))
            .collect();
        assert_eq!(
            order,
            vec![("WP-1", 0), ("WP-1a", 1), ("WP-1a1", 2), ("WP-2", 0)]
        );
    }

    #[test]
    fn test_update_waypoint_substantive_edit_resets_status() {
        let mut plan = plan_with(&["WP-1"]);
        plan.get_mut("WP-1").unwrap().mark_complete();

        let mut edited = plan.get("WP-1").unwrap().clone();
        edited.objective = "Changed objective".to_string();
        let reset = plan.update_waypoint(edited).unwrap();

        assert!(reset);
        let wp = plan.get("WP-1").unwrap();
        assert_eq!(wp.status, WaypointStatus::Pending);
        assert!(wp.completed_at.is_none());
    }

    #[test]
    fn test_update_waypoint_title_edit_keeps_status() {
        let mut plan = plan_with(&["WP-1"]);
        plan.get_mut("WP-1").unwrap().mark_complete();

        let mut edited = plan.get("WP-1").unwrap().clone();
        edited.title = "New title".to_string();
        let reset = plan.update_waypoint(edited).unwrap();

        assert!(!reset);
        assert_eq!(plan.get("WP-1").unwrap().status, WaypointStatus::Complete);
    }

    #[test]
    fn test_update_unknown_waypoint_fails() {
        let mut plan = FlightPlan::new();
        let err = plan
            .update_waypoint(Waypoint::new("WP-9", "T", "O"))
            .unwrap_err();
        assert!(matches!(err, FlightError::UnknownWaypoint { .. }));
    }

    #[test]
    fn test_remove_waypoint_cascades() {
        let mut plan = plan_with(&["WP-1"]);
        plan.add_waypoint(Waypoint::new("WP-1a", "Child", "C").with_parent("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-2", "Root 2", "R"));

        let mut removed = plan.remove_waypoint("WP-1");
        removed.sort();
        assert_eq!(removed, vec!["WP-1".to_string(), "WP-1a".to_string()]);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_insert_after() {
        let mut plan = plan_with(&["WP-1", "WP-2"]);
        plan.insert_after("WP-1", vec![Waypoint::new("WP-1x", "Inserted", "I")]);
        let ids: Vec<&str> = plan.waypoints.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["WP-1", "WP-1x", "WP-2"]);

        plan.insert_after("WP-404", vec![Waypoint::new("WP-9", "Tail", "T")]);
        assert_eq!(plan.waypoints.last().unwrap().id, "WP-9");
    }

    #[test]
    fn test_reorder_roots_moves_subtrees() {
        let mut plan = plan_with(&["WP-1"]);
        plan.add_waypoint(Waypoint::new("WP-1a", "Child", "C").with_parent("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-2", "Root 2", "R"));

        plan.reorder_roots(&["WP-2".to_string(), "WP-1".to_string()]);
        let ids: Vec<&str> = plan.waypoints.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["WP-2", "WP-1", "WP-1a"]);
    }

    #[test]
    fn test_validate_dependencies_no_cycle() {
        let mut plan = plan_with(&["WP-1"]);
        plan.add_waypoint(Waypoint::new("WP-2", "S", "S").with_dependency("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-3", "T", "T").with_dependency("WP-2"));
        assert!(plan.validate_dependencies().is_empty());
    }

    #[test]
    fn test_validate_dependencies_with_cycle() {
        let mut plan = FlightPlan::new();
        plan.add_waypoint(Waypoint::new("WP-1", "F", "F").with_dependency("WP-3"));
        plan.add_waypoint(Waypoint::new("WP-2", "S", "S").with_dependency("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-3", "T", "T").with_dependency("WP-2"));

        let errors = plan.validate_dependencies();
        assert!(!errors.is_empty());
        assert!(errors.iter().any(|e| e.contains("Circular")));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let mut plan = FlightPlan::new();
        plan.add_waypoint(Waypoint::new("WP-1", "F", "F").with_dependency("WP-404"));
        let errors = plan.validate_dependencies();
        assert!(errors.iter().any(|e| e.contains("unknown")));
    }

    #[test]
    fn test_save_and_load_preserves_order() {
        let dir = tempdir().unwrap();
        let store = FlightPlanStore::new(dir.path().join("flight-plan.jsonl"));

        let mut plan = plan_with(&["WP-1"]);
        plan.add_waypoint(Waypoint::new("WP-1a", "Child", "C").with_parent("WP-1"));
        plan.add_waypoint(Waypoint::new("WP-2", "Root 2", "R"));
        plan.get_mut("WP-1a").unwrap().mark_complete();

        store.save(&plan).unwrap();
        assert!(store.exists());

        let loaded = store.load().unwrap();
        let ids: Vec<&str> = loaded.waypoints.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["WP-1", "WP-1a", "WP-2"]);
        assert_eq!(
            loaded.get("WP-1a").unwrap().status,
            WaypointStatus::Complete
        );
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let store = FlightPlanStore::new(dir.path().join("nope.jsonl"));
        assert!(matches!(
            store.load(),
            Err(FlightError::PlanNotFound { .. })
        ));
    }

    #[test]
    fn test_load_headerless_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flight-plan.jsonl");
        std::fs::write(&path, "{\"id\":\"WP-1\",\"title\":\"T\",\"objective\":\"O\"}\n").unwrap();
        let store = FlightPlanStore::new(&path);
        assert!(matches!(
            store.load(),
            Err(FlightError::MissingHeader { .. })
        ));
    }

    #[test]
    fn test_append_waypoint() {
        let dir = tempdir().unwrap();
        let store = FlightPlanStore::new(dir.path().join("flight-plan.jsonl"));
        let plan = plan_with(&["WP-1"]);
        store.save(&plan).unwrap();

        store
            .append_waypoint(&Waypoint::new("WP-2", "Appended", "A"))
            .unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.get("WP-2").is_some());
    }

    #[test]
    fn test_completion_status_counts() {
        let mut plan = plan_with(&["WP-1", "WP-2", "WP-3"]);
        plan.get_mut("WP-1").unwrap().mark_complete();
        plan.get_mut("WP-2").unwrap().status = WaypointStatus::Failed;

        let status = plan.completion_status();
        assert_eq!(status.total, 3);
        assert_eq!(status.complete, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 1);
        assert!(!status.all_complete());
        assert!(status.has_failed());
    }
}
