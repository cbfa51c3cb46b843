//! Flight-execution core.
//!
//! This library holds everything the waypoint executor and journey
//! coordinator build on:
//! - the domain model (waypoints, flight plan, project layout)
//! - the append-only execution journal with resume-by-replay
//! - evidence capture, checklist receipts, and the receipt finalizer
//! - stack detection and validation-command resolution
//! - the intervention taxonomy
//! - borrowed collaborator boundaries (LLM provider, git service)
//!
//! The core never depends on a concrete provider SDK; binaries wire the
//! [`provider::AgentProvider`] and [`git::GitService`] implementations.

pub mod config;
pub mod error;
pub mod evidence;
pub mod finalizer;
pub mod git;
pub mod intervention;
pub mod journal;
pub mod metrics;
pub mod models;
pub mod outcome;
pub mod progress;
pub mod provider;
pub mod receipt;
pub mod stack;

pub use config::{Checklist, FlyConfig, GitConfig, DEFAULT_MAX_ITERATIONS};
pub use error::{FlightError, FlightResult};
pub use evidence::{CapturedEvidence, ValidationCategory};
pub use finalizer::{Finalize, FinalizeFailure, FinalizeInputs, ReceiptFinalizer};
pub use intervention::{
    Intervention, InterventionAction, InterventionKind, InterventionNeeded,
    InterventionResolution,
};
pub use journal::{ExecutionEvent, ExecutionLog, ExecutionLogReader, ExecutionLogWriter};
pub use metrics::CostTracker;
pub use models::{
    compute_spec_hash, CompletionStatus, FlightPlan, FlightPlanStore, Project, Waypoint,
    WaypointStatus,
};
pub use outcome::ExecutionResult;
pub use progress::{FileOperation, ProgressCallback, ProgressStep, ProgressUpdate};
pub use provider::{
    AgentProvider, AgentRequest, EventStream, ProviderError, ProviderEvent, RetryingProvider,
};
pub use receipt::{
    ChecklistItem, ChecklistReceipt, ChecklistStatus, CriterionStatus, CriterionVerification,
    ReceiptBuilder,
};
pub use stack::{StackConfig, StackType, ValidationCommand};
