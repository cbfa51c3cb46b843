//! Captured validation evidence and command classification.
//!
//! Evidence comes from two sources with identical shape: host-run
//! validation commands (hard evidence) and agent-reported tool calls
//! (soft evidence). Both decode output bytes lossily and stamp a capture
//! time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code recorded when a host validation command times out
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Stderr suffix appended on timeout
pub const TIMEOUT_SUFFIX: &str = "Command timed out";

/// Category of a validation command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    Lint,
    Type,
    Test,
    Format,
    Build,
}

impl ValidationCategory {
    /// Category name as used in overrides and journal entries
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lint => "lint",
            Self::Type => "type",
            Self::Test => "test",
            Self::Format => "format",
            Self::Build => "build",
        }
    }
}

impl std::fmt::Display for ValidationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ValidationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lint" => Ok(Self::Lint),
            "type" => Ok(Self::Type),
            "test" => Ok(Self::Test),
            "format" => Ok(Self::Format),
            "build" => Ok(Self::Build),
            other => Err(format!("unknown validation category: {other}")),
        }
    }
}

/// Output captured from one command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvidence {
    /// The exact command string that ran
    pub command: String,
    /// Process exit code (124 on timeout)
    pub exit_code: i32,
    /// Decoded stdout
    pub stdout: String,
    /// Decoded stderr
    pub stderr: String,
    /// When the capture started
    pub captured_at: DateTime<Utc>,
}

impl CapturedEvidence {
    /// Evidence for a command that ran to completion
    pub fn new(
        command: impl Into<String>,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            captured_at: Utc::now(),
        }
    }

    /// Evidence for a command that hit the wall-clock timeout
    pub fn timed_out(
        command: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        let mut stderr = stderr.into();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(TIMEOUT_SUFFIX);
        Self {
            command: command.into(),
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: stdout.into(),
            stderr,
            captured_at: Utc::now(),
        }
    }

    /// Whether the command succeeded
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Decode raw output bytes, replacing invalid UTF-8
pub fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Normalize a command string for evidence-map keys.
///
/// Token-splits via shell rules when possible so quoting differences
/// collapse; falls back to whitespace collapsing for unparseable input.
pub fn normalize_command(command: &str) -> String {
    match shlex::split(command) {
        Some(tokens) if !tokens.is_empty() => tokens.join(" "),
        _ => command.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// Guess the validation category of a command by its tooling keywords
pub fn detect_validation_category(command: &str) -> Option<ValidationCategory> {
    let lower = normalize_command(command).to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("pytest")
        || has("cargo test")
        || has("cargo nextest")
        || has("go test")
        || has("npm test")
        || has("npx jest")
        || has("swift test")
        || has("unittest")
    {
        return Some(ValidationCategory::Test);
    }
    if has("ruff")
        || has("clippy")
        || has("eslint")
        || has("golangci")
        || has("go vet")
        || has("flake8")
        || has("pylint")
        || has(" lint")
        || lower.starts_with("lint")
    {
        return Some(ValidationCategory::Lint);
    }
    if has("mypy") || has("tsc") || has("pyright") || has("typecheck") {
        return Some(ValidationCategory::Type);
    }
    if has("fmt --check") || has("black --check") || has("prettier") || has("gofmt") {
        return Some(ValidationCategory::Format);
    }
    if has("cargo build")
        || has("cargo check")
        || has("go build")
        || has("npm run build")
        || has("swift build")
        || has("make")
        || has("tsc --build")
    {
        return Some(ValidationCategory::Build);
    }
    None
}
