//! Waypoint memory — what past runs learned, folded into future prompts.
//!
//! After every execution a record is saved under `.waypoints/memory/`.
//! Before executing a waypoint, the records of its dependencies (and its
//! own prior attempts) become a short context section so the agent does
//! not rediscover the same pitfalls.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use flightcore::error::FlightResult;
use flightcore::models::Waypoint;
use flightcore::outcome::ExecutionResult;

/// Memory schema version
pub const MEMORY_SCHEMA_VERSION: &str = "v1";

/// What one execution run learned about a waypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointMemoryRecord {
    pub schema_version: String,
    pub saved_at: DateTime<Utc>,
    pub waypoint_id: String,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub result: ExecutionResult,
    pub iterations_used: u32,
    pub max_iterations: u32,
    #[serde(default)]
    pub protocol_derailments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub validation_commands: Vec<String>,
    #[serde(default)]
    pub verified_criteria: Vec<usize>,
}

fn memory_path(memory_dir: &Path, waypoint_id: &str) -> PathBuf {
    let slug: String = waypoint_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    memory_dir.join(format!("{slug}.json"))
}

/// Persist a memory record, replacing any prior one for the waypoint
pub fn save_waypoint_memory(memory_dir: &Path, record: &WaypointMemoryRecord) -> FlightResult<()> {
    std::fs::create_dir_all(memory_dir)?;
    let path = memory_path(memory_dir, &record.waypoint_id);
    std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
    Ok(())
}

/// Load the memory record for a waypoint, if any
pub fn load_waypoint_memory(memory_dir: &Path, waypoint_id: &str) -> Option<WaypointMemoryRecord> {
    let path = memory_path(memory_dir, waypoint_id);
    let text = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable memory record");
            None
        }
    }
}

fn render_record(record: &WaypointMemoryRecord, role: &str) -> String {
    let mut line = format!(
        "{} ({role}): {} in {}/{} iterations",
        record.waypoint_id, record.result, record.iterations_used, record.max_iterations
    );
    if !record.changed_files.is_empty() {
        line.push_str(&format!("; touched {}", record.changed_files.join(", ")));
    }
    if !record.validation_commands.is_empty() {
        line.push_str(&format!(
            "; useful commands: {}",
            record.validation_commands.join(", ")
        ));
    }
    if !record.protocol_derailments.is_empty() {
        line.push_str(&format!(
            "; derailments: {}",
            record.protocol_derailments.join("; ")
        ));
    }
    if let Some(error) = &record.error_summary {
        line.push_str(&format!("; last error: {error}"));
    }
    line
}

/// Build the memory-context section for a waypoint's first prompt.
///
/// Returns `None` when neither the waypoint nor its dependencies have any
/// recorded history. Also returns the ids that contributed.
pub fn build_memory_context(
    memory_dir: &Path,
    waypoint: &Waypoint,
) -> Option<(String, Vec<String>)> {
    let mut lines = Vec::new();
    let mut ids = Vec::new();

    for dep in &waypoint.dependencies {
        if let Some(record) = load_waypoint_memory(memory_dir, dep) {
            lines.push(render_record(&record, "dependency"));
            ids.push(record.waypoint_id);
        }
    }
    if let Some(record) = load_waypoint_memory(memory_dir, &waypoint.id) {
        lines.push(render_record(&record, "previous attempt"));
        ids.push(record.waypoint_id);
    }

    if lines.is_empty() {
        None
    } else {
        Some((lines.join("\n"), ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str, result: ExecutionResult) -> WaypointMemoryRecord {
        WaypointMemoryRecord {
            schema_version: MEMORY_SCHEMA_VERSION.to_string(),
            saved_at: Utc::now(),
            waypoint_id: id.to_string(),
            title: "Bootstrap stack".to_string(),
            objective: "Initialize project".to_string(),
            dependencies: vec![],
            result,
            iterations_used: 2,
            max_iterations: 10,
            protocol_derailments: vec![],
            error_summary: None,
            changed_files: vec!["src/main.py".to_string()],
            validation_commands: vec!["pytest -v".to_string()],
            verified_criteria: vec![0],
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let rec = record("WP-000", ExecutionResult::Success);
        save_waypoint_memory(dir.path(), &rec).unwrap();

        let loaded = load_waypoint_memory(dir.path(), "WP-000").unwrap();
        assert_eq!(loaded, rec);
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempdir().unwrap();
        assert!(load_waypoint_memory(dir.path(), "WP-404").is_none());
    }

    #[test]
    fn test_dependency_context() {
        let dir = tempdir().unwrap();
        save_waypoint_memory(dir.path(), &record("WP-000", ExecutionResult::Success)).unwrap();

        let waypoint = Waypoint::new("WP-1", "T", "O").with_dependency("WP-000");
        let (context, ids) = build_memory_context(dir.path(), &waypoint).unwrap();
        assert!(context.contains("WP-000 (dependency"));
        assert!(context.contains("success in 2/10 iterations"));
        assert!(context.contains("pytest -v"));
        assert_eq!(ids, vec!["WP-000".to_string()]);
    }

    #[test]
    fn test_prior_attempt_context() {
        let dir = tempdir().unwrap();
        let mut rec = record("WP-1", ExecutionResult::Failed);
        rec.error_summary = Some("pytest exited 1".to_string());
        rec.protocol_derailments = vec!["claimed completion without exact completion marker".into()];
        save_waypoint_memory(dir.path(), &rec).unwrap();

        let waypoint = Waypoint::new("WP-1", "T", "O");
        let (context, _) = build_memory_context(dir.path(), &waypoint).unwrap();
        assert!(context.contains("previous attempt"));
        assert!(context.contains("pytest exited 1"));
        assert!(context.contains("derailments"));
    }

    #[test]
    fn test_no_history_no_context() {
        let dir = tempdir().unwrap();
        let waypoint = Waypoint::new("WP-1", "T", "O").with_dependency("WP-000");
        assert!(build_memory_context(dir.path(), &waypoint).is_none());
    }
}
