//! Journal reader — resume-by-replay over execution log files.
//!
//! The journal is the authoritative record: completed criteria, cost, and
//! iteration counts are recomputed here from the event stream rather than
//! trusted from any in-memory state.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::error::{FlightError, FlightResult};
use crate::journal::event::{ExecutionEvent, EXECUTION_LOG_SCHEMA};
use crate::models::Project;
use crate::outcome::ExecutionResult;

/// An execution log reconstructed from disk
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    pub execution_id: String,
    pub waypoint_id: String,
    pub waypoint_title: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
    pub total_cost_usd: f64,
    /// All non-header events in file order
    pub events: Vec<ExecutionEvent>,
}

impl ExecutionLog {
    /// Union of criteria indices reported complete across all output events
    pub fn completed_criteria(&self) -> BTreeSet<usize> {
        let mut completed = BTreeSet::new();
        for event in &self.events {
            if let ExecutionEvent::Output {
                criteria_completed, ..
            } = event
            {
                completed.extend(criteria_completed.iter().copied());
            }
        }
        completed
    }

    /// Number of iterations started before the terminal completion record
    pub fn iterations_used(&self) -> u32 {
        let mut count = 0;
        for event in &self.events {
            match event {
                ExecutionEvent::IterationStart { .. } => count += 1,
                ExecutionEvent::Completion { .. } => break,
                _ => {}
            }
        }
        count
    }

    /// Sum of per-record costs (iteration_end + finalize_end)
    pub fn summed_costs(&self) -> f64 {
        self.events
            .iter()
            .map(|e| match e {
                ExecutionEvent::IterationEnd { cost_usd, .. }
                | ExecutionEvent::FinalizeEnd { cost_usd, .. } => cost_usd.unwrap_or(0.0),
                _ => 0.0,
            })
            .sum()
    }
}

/// Loads execution logs from JSONL files
pub struct ExecutionLogReader;

impl ExecutionLogReader {
    /// Load one journal file.
    ///
    /// The first line must be a valid header; files without one are
    /// rejected. Legacy files (header missing the schema marker) get a
    /// best-effort forward migration before parsing. Malformed event
    /// lines are skipped with a warning.
    pub fn load(path: &Path) -> FlightResult<ExecutionLog> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .transpose()?
            .ok_or_else(|| FlightError::MissingHeader {
                path: path.to_path_buf(),
            })?;
        let header_line = migrate_legacy_header(&header_line).ok_or_else(|| {
            FlightError::MissingHeader {
                path: path.to_path_buf(),
            }
        })?;

        let header: ExecutionEvent =
            serde_json::from_str(&header_line).map_err(|_| FlightError::MissingHeader {
                path: path.to_path_buf(),
            })?;
        let ExecutionEvent::Header {
            schema,
            execution_id,
            waypoint_id,
            waypoint_title,
            started_at,
            ..
        } = header
        else {
            return Err(FlightError::MissingHeader {
                path: path.to_path_buf(),
            });
        };
        if schema != EXECUTION_LOG_SCHEMA {
            return Err(FlightError::UnsupportedSchema {
                schema,
                path: path.to_path_buf(),
            });
        }

        let mut log = ExecutionLog {
            execution_id,
            waypoint_id,
            waypoint_title,
            started_at,
            completed_at: None,
            result: None,
            total_cost_usd: 0.0,
            events: Vec::new(),
        };

        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExecutionEvent>(&line) {
                Ok(event) => {
                    if let ExecutionEvent::Completion {
                        result,
                        total_cost_usd,
                        completed_at,
                        ..
                    } = &event
                    {
                        log.result = Some(*result);
                        log.total_cost_usd = *total_cost_usd;
                        log.completed_at = Some(*completed_at);
                    }
                    log.events.push(event);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed journal line")
                }
            }
        }

        Ok(log)
    }

    /// List journal files for a project, newest first
    pub fn list_logs(project: &Project, waypoint_id: Option<&str>) -> Vec<PathBuf> {
        let dir = project.fly_sessions_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let prefix = waypoint_id.map(|id| {
            id.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        });

        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".jsonl") {
                    return false;
                }
                match &prefix {
                    Some(p) => name.starts_with(&format!("{p}-")),
                    None => true,
                }
            })
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        files.into_iter().map(|(_, p)| p).collect()
    }

    /// Load the most recent journal, optionally filtered by waypoint
    pub fn load_latest(
        project: &Project,
        waypoint_id: Option<&str>,
    ) -> FlightResult<Option<ExecutionLog>> {
        match Self::list_logs(project, waypoint_id).first() {
            Some(path) => Ok(Some(Self::load(path)?)),
            None => Ok(None),
        }
    }

    /// Completed criteria for a waypoint from its latest journal
    pub fn completed_criteria(project: &Project, waypoint_id: &str) -> BTreeSet<usize> {
        match Self::load_latest(project, Some(waypoint_id)) {
            Ok(Some(log)) => log.completed_criteria(),
            _ => BTreeSet::new(),
        }
    }
}

/// Forward-migrate a legacy header line.
///
/// Old journals predate the `_schema` marker but still start with a
/// `"type":"header"` record. Stamp the current schema fields in; anything
/// else is not a header and the caller rejects the file.
fn migrate_legacy_header(line: &str) -> Option<String> {
    let mut value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object_mut()?;
    if obj.get("type").and_then(Value::as_str) != Some("header") {
        return None;
    }
    if !obj.contains_key("_schema") {
        obj.insert("_schema".to_string(), Value::from(EXECUTION_LOG_SCHEMA));
        obj.insert(
            "_version".to_string(),
            Value::from(crate::journal::event::EXECUTION_LOG_VERSION),
        );
    }
    serde_json::to_string(&value).ok()
}
