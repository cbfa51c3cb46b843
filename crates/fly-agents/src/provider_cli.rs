//! Subprocess provider — adapts an agent CLI's stream-json output.
//!
//! Spawns the configured agent CLI (`claude -p ... --output-format
//! stream-json` by default) and translates its stdout JSONL events into
//! [`ProviderEvent`]s. The core only ever sees the [`AgentProvider`]
//! trait; this adapter is wired by the binary.

use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use flightcore::provider::{
    AgentProvider, AgentRequest, EventStream, ProviderError, ProviderEvent,
};

/// Channel capacity between the reader task and the consumer
const EVENT_BUFFER: usize = 64;

/// Provider that shells out to an agent CLI
pub struct CliAgentProvider {
    command: String,
    extra_args: Vec<String>,
}

impl CliAgentProvider {
    /// Provider spawning `command` for each query
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            extra_args: Vec::new(),
        }
    }

    /// Additional fixed arguments appended to every invocation
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if !request.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(request.system_prompt.clone());
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        if let Some(session) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Translate one stream-json line into a provider event
fn parse_stream_line(line: &str) -> Option<ProviderEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Skipping non-JSON provider line");
            return None;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            // Assistant turn: concatenate text blocks, surface tool_use blocks
            let content = value.pointer("/message/content")?.as_array()?.clone();
            let mut text = String::new();
            for block in &content {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => {
                        return Some(ProviderEvent::ToolUse {
                            tool_name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_string(),
                            tool_input: block.get("input").cloned().unwrap_or(Value::Null),
                            tool_output: None,
                        });
                    }
                    _ => {}
                }
            }
            (!text.is_empty()).then_some(ProviderEvent::Chunk { text })
        }
        Some("user") => {
            // Tool results come back on the user turn
            let content = value.pointer("/message/content")?.as_array()?;
            for block in content {
                if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                    let output = match block.get("content") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    return Some(ProviderEvent::ToolUse {
                        tool_name: block
                            .get("tool_name")
                            .and_then(Value::as_str)
                            .unwrap_or("Bash")
                            .to_string(),
                        tool_input: block.get("input").cloned().unwrap_or(Value::Null),
                        tool_output: Some(output),
                    });
                }
            }
            None
        }
        Some("result") => Some(ProviderEvent::Complete {
            full_text: value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            session_id: value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
            tokens_in: value.pointer("/usage/input_tokens").and_then(Value::as_u64),
            tokens_out: value
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64),
        }),
        _ => None,
    }
}

#[async_trait]
impl AgentProvider for CliAgentProvider {
    async fn query(&self, request: AgentRequest) -> Result<EventStream, ProviderError> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(self.build_args(&request))
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::classify(format!("failed to spawn agent CLI: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::classify("agent CLI produced no stdout"))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<Result<ProviderEvent, ProviderError>>(EVENT_BUFFER);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_stream_line(&line) {
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::classify(format!(
                                "agent CLI stream failed: {e}"
                            ))))
                            .await;
                        break;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() => {
                    let mut detail = String::new();
                    if let Some(stderr) = stderr {
                        let mut err_lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = err_lines.next_line().await {
                            detail.push_str(&line);
                            detail.push('\n');
                            if detail.len() > 2000 {
                                break;
                            }
                        }
                    }
                    warn!(code = ?status.code(), "Agent CLI exited non-zero");
                    let _ = tx
                        .send(Err(ProviderError::classify(format!(
                            "agent CLI exited with {status}: {}",
                            detail.trim()
                        ))))
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx
                        .send(Err(ProviderError::classify(format!(
                            "agent CLI wait failed: {e}"
                        ))))
                        .await;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
