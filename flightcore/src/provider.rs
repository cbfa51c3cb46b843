//! LLM provider boundary.
//!
//! The core never links a provider SDK. It consumes an async event stream
//! through the [`AgentProvider`] trait; the binary wires a concrete
//! implementation. Provider failures are classified deterministically so
//! the executor can map them to interventions without string-matching at
//! every call site.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::warn;

use crate::intervention::InterventionKind;

/// Fixed backoff schedule for pre-stream retries.
///
/// One retry: transient failures either clear quickly or deserve an
/// intervention with full context.
pub const RETRY_SCHEDULE: &[Duration] = &[Duration::from_secs(2)];

/// An event yielded by the provider stream
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A chunk of assistant text
    Chunk { text: String },
    /// A tool invocation observed inside the stream
    ToolUse {
        tool_name: String,
        tool_input: serde_json::Value,
        tool_output: Option<String>,
    },
    /// The stream finished
    Complete {
        full_text: String,
        session_id: Option<String>,
        cost_usd: Option<f64>,
        tokens_in: Option<u64>,
        tokens_out: Option<u64>,
    },
}

/// One provider invocation
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// User-turn prompt
    pub prompt: String,
    /// System prompt
    pub system_prompt: String,
    /// Tools the agent may use
    pub allowed_tools: Vec<String>,
    /// Working directory for tool execution
    pub cwd: PathBuf,
    /// Provider-side session to resume, carrying prior context
    pub resume_session_id: Option<String>,
}

impl AgentRequest {
    /// Request with the standard editing tool set
    pub fn new(prompt: impl Into<String>, system_prompt: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: system_prompt.into(),
            allowed_tools: ["Read", "Write", "Edit", "Bash", "Glob", "Grep"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cwd,
            resume_session_id: None,
        }
    }

    /// Resume an existing provider session
    pub fn with_resume(mut self, session_id: Option<String>) -> Self {
        self.resume_session_id = session_id;
        self
    }

    /// Restrict the allowed tool set
    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = tools.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Classified provider failures (closed set)
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("provider rate limited: {message}")]
    RateLimited { message: String },

    #[error("provider temporarily unavailable: {message}")]
    ApiUnavailable { message: String },

    #[error("configured budget ${limit_usd:.2} reached (current cost ${current_usd:.2})")]
    BudgetExceeded { limit_usd: f64, current_usd: f64 },

    #[error("provider quota exhausted: {message}")]
    QuotaExhausted { message: String },

    #[error("transient network failure: {message}")]
    TransientNetwork { message: String },

    #[error("provider stream failed: {message}")]
    Other { message: String },
}

impl ProviderError {
    /// Deterministically classify a raw provider failure message
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate-limit") {
            Self::RateLimited { message }
        } else if lower.contains("quota") || lower.contains("credit balance") {
            Self::QuotaExhausted { message }
        } else if lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("529")
            || lower.contains("unavailable")
            || lower.contains("overloaded")
        {
            Self::ApiUnavailable { message }
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("dns")
            || lower.contains("broken pipe")
        {
            Self::TransientNetwork { message }
        } else {
            Self::Other { message }
        }
    }

    /// Whether the pre-stream retry wrapper may try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ApiUnavailable { .. } | Self::TransientNetwork { .. }
        )
    }

    /// Intervention kind this failure maps to when surfaced
    pub fn intervention_kind(&self) -> InterventionKind {
        match self {
            Self::RateLimited { .. } => InterventionKind::RateLimited,
            Self::ApiUnavailable { .. } | Self::TransientNetwork { .. } => {
                InterventionKind::ApiUnavailable
            }
            Self::BudgetExceeded { .. } | Self::QuotaExhausted { .. } => {
                InterventionKind::BudgetExceeded
            }
            Self::Other { .. } => InterventionKind::ExecutionError,
        }
    }

    /// Short tag written into intervention context maps
    pub fn api_error_type(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ApiUnavailable { .. } => "api_unavailable",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::TransientNetwork { .. } => "transient_network",
            Self::Other { .. } => "other",
        }
    }
}

/// Stream of provider events
pub type EventStream = BoxStream<'static, Result<ProviderEvent, ProviderError>>;

/// The provider boundary consumed by the executor and the judge
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Start a streaming agent invocation
    async fn query(&self, request: AgentRequest) -> Result<EventStream, ProviderError>;
}

/// Retry wrapper applying [`RETRY_SCHEDULE`] before any event is yielded.
///
/// Once the underlying stream has produced its first event the wrapper
/// steps aside: retrying mid-stream would re-run tool side effects.
pub struct RetryingProvider {
    inner: Arc<dyn AgentProvider>,
}

impl RetryingProvider {
    /// Wrap a provider
    pub fn new(inner: Arc<dyn AgentProvider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AgentProvider for RetryingProvider {
    async fn query(&self, request: AgentRequest) -> Result<EventStream, ProviderError> {
        let mut attempt = 0usize;
        loop {
            let outcome = match self.inner.query(request.clone()).await {
                Ok(mut stream) => match stream.next().await {
                    None => Ok(futures::stream::empty().boxed()),
                    Some(Ok(first)) => {
                        Ok(futures::stream::once(async move { Ok(first) })
                            .chain(stream)
                            .boxed())
                    }
                    Some(Err(e)) => Err(e),
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < RETRY_SCHEDULE.len() => {
                    warn!(error = %e, attempt, "Provider failed before first event, retrying");
                    tokio::time::sleep(RETRY_SCHEDULE[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Collect a full stream into (text, tool events, completion).
///
/// Used by the finalize judge path where no chunk-level processing is
/// needed.
pub async fn drain_stream(
    mut stream: EventStream,
) -> Result<(String, Vec<ProviderEvent>, Option<ProviderEvent>), ProviderError> {
    let mut text = String::new();
    let mut tool_events = Vec::new();
    let mut complete = None;
    while let Some(event) = stream.next().await {
        match event? {
            ProviderEvent::Chunk { text: t } => text.push_str(&t),
            tool @ ProviderEvent::ToolUse { .. } => tool_events.push(tool),
            done @ ProviderEvent::Complete { .. } => complete = Some(done),
        }
    }
    Ok((text, tool_events, complete))
}
