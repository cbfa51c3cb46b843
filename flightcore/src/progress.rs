//! Progress events delivered to the UI callback during execution.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Protocol-level step a progress event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    /// An iteration is starting
    Executing,
    /// A text chunk arrived from the provider
    Streaming,
    /// The agent invoked a tool
    ToolUse,
    /// The completion marker was accepted
    Complete,
    /// Something went wrong
    Error,
    /// A structured stage report was parsed
    Stage,
    /// The finalize pipeline is running
    Finalizing,
}

impl std::fmt::Display for ProgressStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing => write!(f, "executing"),
            Self::Streaming => write!(f, "streaming"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Stage => write!(f, "stage"),
            Self::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// A file touched by an agent tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    /// Tool that performed the operation
    pub tool_name: String,
    /// File path, glob pattern, or truncated command
    pub file_path: String,
    /// Line number when the tool reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

/// One progress update delivered to the callback
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub waypoint_id: String,
    pub iteration: u32,
    pub total_iterations: u32,
    pub step: ProgressStep,
    pub output: String,
    pub criteria_completed: BTreeSet<usize>,
    pub file_operations: Vec<FileOperation>,
}

/// Shared callback invoked on every streamed chunk and protocol boundary
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;
