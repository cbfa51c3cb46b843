//! Waypoint-history journal — append-only record of plan mutations.
//!
//! Every coordinator mutation of the flight plan emits one event here so
//! that the evolution of the plan can be replayed independently of the
//! per-execution logs.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::FlightResult;

/// A plan-mutation event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaypointHistoryEvent {
    /// A batch of waypoints was generated by the planner
    Generated {
        waypoint_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A single waypoint was added
    Added {
        waypoint_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insert_after: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A waypoint was edited
    Updated {
        waypoint_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        changed_fields: Vec<String>,
        /// Whether the edit reset the waypoint to pending
        #[serde(default)]
        status_reset: bool,
        timestamp: DateTime<Utc>,
    },
    /// A waypoint (and its subtree) was deleted
    Deleted {
        waypoint_id: String,
        removed_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A waypoint was broken down into sub-waypoints
    BrokenDown {
        parent_id: String,
        sub_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Root-level siblings were reordered
    Reprioritized {
        previous_order: Vec<String>,
        new_order: Vec<String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        rationale: String,
        timestamp: DateTime<Utc>,
    },
    /// A debug waypoint was forked from an existing one
    DebugForked {
        source_id: String,
        debug_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl WaypointHistoryEvent {
    /// Event type name as written to the journal
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Generated { .. } => "generated",
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
            Self::BrokenDown { .. } => "broken_down",
            Self::Reprioritized { .. } => "reprioritized",
            Self::DebugForked { .. } => "debug_forked",
        }
    }
}

/// Appends waypoint-history events to a JSONL file
pub struct WaypointHistoryWriter {
    path: PathBuf,
}

impl WaypointHistoryWriter {
    /// Writer for a history file path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Append one event
    pub fn log(&self, event: &WaypointHistoryEvent) -> FlightResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    /// Read all events back (skips malformed lines)
    pub fn read_all(&self) -> FlightResult<Vec<WaypointHistoryEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(&self.path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Skipping malformed history line"),
            }
        }
        Ok(events)
    }
}
