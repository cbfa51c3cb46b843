//! Append-only execution journal with resume-by-replay semantics.

pub mod event;
pub mod reader;
pub mod writer;

pub use event::{ExecutionEvent, SpecContextUsage, EXECUTION_LOG_SCHEMA, EXECUTION_LOG_VERSION};
pub use reader::{ExecutionLog, ExecutionLogReader};
pub use writer::ExecutionLogWriter;
