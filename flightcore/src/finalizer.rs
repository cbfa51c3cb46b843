//! Receipt finalization — build, validate, and verify execution receipts.
//!
//! Four phases: resolve validation commands, run them on the host,
//! build a receipt from the captured evidence, and ask an LLM judge to
//! verify. The structural check is authoritative; the judge is advisory
//! and any failure in the judge path defaults to trusting the evidence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::evidence::{
    decode_output, detect_validation_category, normalize_command, CapturedEvidence,
    ValidationCategory,
};
use crate::journal::ExecutionLogWriter;
use crate::metrics::CostTracker;
use crate::models::{Project, Waypoint};
use crate::progress::{ProgressCallback, ProgressStep, ProgressUpdate};
use crate::provider::{drain_stream, AgentProvider, AgentRequest, ProviderEvent};
use crate::receipt::{ChecklistReceipt, CriterionVerification, ReceiptBuilder};
use crate::stack::ValidationCommand;

/// Wall-clock timeout per host validation command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

static VERDICT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<receipt-verdict status="(valid|invalid)">(.*?)</receipt-verdict>"#)
        .expect("verdict pattern compiles")
});

/// Why a finalize pass returned invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeFailure {
    /// A host-run validation command failed
    HostValidation,
    /// No evidence was captured at all
    NoEvidence,
    /// Host validations were disabled but no soft evidence exists
    SoftEvidenceMissing,
    /// The LLM judge explicitly rejected the receipt
    JudgeRejected,
}

/// Failure details short enough to embed in a retry prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSummary {
    pub kind: FinalizeFailure,
    pub summary: String,
}

impl FailureSummary {
    /// Summary truncated to `max_chars`
    pub fn truncated(&self, max_chars: usize) -> String {
        if self.summary.len() <= max_chars {
            return self.summary.clone();
        }
        let mut end = max_chars;
        while !self.summary.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &self.summary[..end])
    }
}

/// Everything the executor hands the finalizer after marker detection
#[derive(Debug, Clone, Default)]
pub struct FinalizeInputs {
    /// Criterion verifications parsed from agent output, keyed by index
    pub captured_criteria: BTreeMap<usize, CriterionVerification>,
    /// Commands resolved by the stack detector
    pub validation_commands: Vec<ValidationCommand>,
    /// Commands the model reported via markers (fallback source)
    pub reported_commands: Vec<String>,
    /// Tool-call evidence keyed by normalized command
    pub tool_evidence_by_command: BTreeMap<String, CapturedEvidence>,
    /// Tool-call evidence keyed by detected category
    pub tool_evidence_by_category: BTreeMap<ValidationCategory, CapturedEvidence>,
    /// Whether host validations run at all
    pub host_validations: bool,
    /// Iteration budget, for progress reporting
    pub max_iterations: u32,
}

/// Finalize boundary the executor drives; tests substitute stubs
#[async_trait]
pub trait Finalize: Send {
    /// Build and verify a receipt; true means the waypoint may succeed
    async fn finalize(&mut self, log: &mut ExecutionLogWriter, inputs: &FinalizeInputs) -> bool;

    /// Failure details from the most recent invalid finalize
    fn last_failure(&self) -> Option<&FailureSummary>;
}

/// Builds and verifies execution receipts from captured evidence
pub struct ReceiptFinalizer {
    project: Project,
    waypoint: Waypoint,
    judge: Option<Arc<dyn AgentProvider>>,
    cost: Arc<CostTracker>,
    on_progress: Option<ProgressCallback>,
    command_timeout: Duration,
    last_failure: Option<FailureSummary>,
}

impl ReceiptFinalizer {
    /// Finalizer for one waypoint
    pub fn new(project: Project, waypoint: Waypoint, cost: Arc<CostTracker>) -> Self {
        Self {
            project,
            waypoint,
            judge: None,
            cost,
            on_progress: None,
            command_timeout: COMMAND_TIMEOUT,
            last_failure: None,
        }
    }

    /// Attach an LLM judge for the verify phase
    pub fn with_judge(mut self, judge: Arc<dyn AgentProvider>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Attach a progress callback
    pub fn with_progress(mut self, on_progress: ProgressCallback) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Override the per-command timeout (tests)
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn progress(&self, max_iterations: u32, output: &str) {
        if let Some(cb) = &self.on_progress {
            cb(ProgressUpdate {
                waypoint_id: self.waypoint.id.clone(),
                iteration: max_iterations,
                total_iterations: max_iterations,
                step: ProgressStep::Finalizing,
                output: output.to_string(),
                criteria_completed: Default::default(),
                file_operations: Vec::new(),
            });
        }
    }

    fn fail(&mut self, kind: FinalizeFailure, summary: impl Into<String>) -> bool {
        self.last_failure = Some(FailureSummary {
            kind,
            summary: summary.into(),
        });
        false
    }

    /// Build validation commands from model-reported markers
    pub fn fallback_commands_from_reported(reported: &[String]) -> Vec<ValidationCommand> {
        let mut commands = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for raw in reported {
            let trimmed = raw.trim();
            if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
                continue;
            }
            let category =
                detect_validation_category(trimmed).unwrap_or(ValidationCategory::Test);
            commands.push(ValidationCommand::new(
                category.as_str(),
                trimmed,
                category,
            ));
        }
        commands
    }

    /// Execute validation commands on the host, sequentially, capturing
    /// evidence keyed by command label. Each `(command, cwd)` tuple runs
    /// at most once.
    pub async fn run_validation_commands(
        &self,
        log: &mut ExecutionLogWriter,
        project_path: &Path,
        commands: &[ValidationCommand],
    ) -> BTreeMap<String, CapturedEvidence> {
        let mut evidence = BTreeMap::new();
        let mut ran: std::collections::BTreeSet<(String, PathBuf)> = Default::default();
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let path_env = augmented_path();

        for cmd in commands {
            let cwd = cmd
                .cwd
                .clone()
                .unwrap_or_else(|| project_path.to_path_buf());
            if !ran.insert((cmd.command.clone(), cwd.clone())) {
                continue;
            }

            let captured = self
                .run_one_command(&shell, &path_env, &cwd, &cmd.command)
                .await;

            info!(
                category = %cmd.category,
                command = %cmd.command,
                exit_code = captured.exit_code,
                "Ran validation command"
            );
            let _ = log.log_finalize_tool_call(
                "ValidationCommand",
                serde_json::json!({
                    "command": cmd.command,
                    "category": cmd.category.as_str(),
                    "name": cmd.name,
                }),
                Some(format!("exit_code={}", captured.exit_code)),
            );

            let label = if cmd.name.is_empty() {
                cmd.command.clone()
            } else {
                cmd.name.clone()
            };
            evidence.insert(label, captured);
        }
        evidence
    }

    async fn run_one_command(
        &self,
        shell: &str,
        path_env: &str,
        cwd: &Path,
        command: &str,
    ) -> CapturedEvidence {
        let started = Utc::now();
        let mut proc = tokio::process::Command::new(shell);
        proc.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .env("PATH", path_env)
            .kill_on_drop(true);

        // New process group so a timeout kills the whole tree, including
        // anything the command spawned.
        #[cfg(unix)]
        proc.process_group(0);

        match tokio::time::timeout(self.command_timeout, proc.output()).await {
            Ok(Ok(output)) => {
                let mut captured = CapturedEvidence::new(
                    command,
                    output.status.code().unwrap_or(1),
                    decode_output(&output.stdout),
                    decode_output(&output.stderr),
                );
                captured.captured_at = started;
                captured
            }
            Ok(Err(e)) => {
                let mut captured = CapturedEvidence::new(
                    command,
                    1,
                    "",
                    format!("Error running validation command: {e}"),
                );
                captured.captured_at = started;
                captured
            }
            Err(_) => {
                let mut captured = CapturedEvidence::timed_out(command, "", "");
                captured.captured_at = started;
                captured
            }
        }
    }

    fn save_receipt(
        &self,
        builder: ReceiptBuilder,
        soft_evidence: Option<&BTreeMap<String, CapturedEvidence>>,
    ) -> crate::error::FlightResult<(ChecklistReceipt, PathBuf)> {
        let receipts_dir = self.project.receipts_dir();
        std::fs::create_dir_all(&receipts_dir)?;
        let stem = format!(
            "{}-{}",
            self.waypoint.id_slug(),
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let path = receipts_dir.join(format!("{stem}.json"));
        let receipt = builder.build(&receipts_dir, &stem, soft_evidence);
        receipt.save(&path)?;
        info!(path = %path.display(), "Receipt saved");
        Ok((receipt, path))
    }

    async fn finalize_soft_only(
        &mut self,
        log: &mut ExecutionLogWriter,
        inputs: &FinalizeInputs,
        mut builder: ReceiptBuilder,
        commands_to_run: &[ValidationCommand],
        soft_missing: bool,
    ) -> bool {
        self.progress(
            inputs.max_iterations,
            "Host validations OFF (evidence from tool calls only)...",
        );

        if commands_to_run.is_empty() {
            builder.capture_skipped(
                "host_validations",
                "Host validation skipped (LLM-as-judge only)",
            );
        } else {
            for cmd in commands_to_run {
                let by_command = inputs
                    .tool_evidence_by_command
                    .get(&normalize_command(&cmd.command));
                let evidence =
                    by_command.or_else(|| inputs.tool_evidence_by_category.get(&cmd.category));
                match evidence {
                    Some(ev) => {
                        let label = if cmd.name.is_empty() {
                            cmd.command.clone()
                        } else {
                            cmd.name.clone()
                        };
                        builder.capture(label, ev);
                    }
                    None => builder.capture_skipped(
                        if cmd.name.is_empty() {
                            cmd.command.clone()
                        } else {
                            cmd.name.clone()
                        },
                        "Host validation skipped (LLM-as-judge only)",
                    ),
                }
            }
        }

        self.capture_criteria(log, inputs, &mut builder);

        let soft: BTreeMap<String, CapturedEvidence> = if inputs.tool_evidence_by_category.is_empty()
        {
            inputs.tool_evidence_by_command.clone()
        } else {
            inputs
                .tool_evidence_by_category
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect()
        };
        let soft = (!soft.is_empty()).then_some(soft);

        let Ok((receipt, path)) = self.save_receipt(builder, soft.as_ref()) else {
            let _ = log.log_finalize_end(None);
            let _ = log.log_receipt_validated("", false, Some("Failed to save receipt".into()));
            return self.fail(FinalizeFailure::NoEvidence, "Failed to save receipt");
        };

        let _ = log.log_finalize_end(None);
        if soft_missing {
            let _ = log.log_receipt_validated(
                path.display().to_string(),
                false,
                Some("Soft validation evidence missing".into()),
            );
            return self.fail(
                FinalizeFailure::SoftEvidenceMissing,
                "Soft validation evidence missing: no tool-reported validation output captured",
            );
        }
        if !receipt.is_valid() {
            let failed: Vec<String> = receipt
                .failed_items()
                .iter()
                .map(|i| i.item.clone())
                .collect();
            let summary = format!("Tool-reported validation failed: {}", failed.join(", "));
            let _ = log.log_receipt_validated(path.display().to_string(), false, Some(summary.clone()));
            return self.fail(FinalizeFailure::HostValidation, summary);
        }
        let _ = log.log_receipt_validated(
            path.display().to_string(),
            true,
            Some("Host validation skipped (LLM-as-judge only)".into()),
        );
        true
    }

    fn capture_criteria(
        &self,
        log: &mut ExecutionLogWriter,
        inputs: &FinalizeInputs,
        builder: &mut ReceiptBuilder,
    ) {
        for (idx, criterion) in &inputs.captured_criteria {
            info!(index = idx, status = %criterion.status, "Adding criterion verification");
            let _ = log.log_finalize_tool_call(
                "CapturedCriterion",
                serde_json::json!({"index": idx, "criterion": criterion.criterion}),
                Some(criterion.status.to_string()),
            );
            builder.capture_criterion(criterion.clone());
        }
    }

    async fn verify_with_judge(
        &mut self,
        log: &mut ExecutionLogWriter,
        receipt: &ChecklistReceipt,
        receipt_path: &Path,
        max_iterations: u32,
    ) -> bool {
        let Some(judge) = self.judge.clone() else {
            let _ = log.log_finalize_end(None);
            let _ = log.log_receipt_validated(
                receipt_path.display().to_string(),
                true,
                Some("LLM verification skipped".into()),
            );
            return true;
        };

        self.progress(max_iterations, "Verifying receipt with LLM judge...");

        let request = AgentRequest::new(
            build_verification_prompt(receipt),
            "Verify the checklist receipt. Output your verdict.",
            self.project.path().to_path_buf(),
        )
        .with_tools(&[]);

        let outcome = match judge.query(request).await {
            Ok(stream) => drain_stream(stream).await,
            Err(e) => Err(e),
        };

        let (output, cost) = match outcome {
            Ok((text, _tools, complete)) => {
                let cost = match complete {
                    Some(ProviderEvent::Complete { cost_usd, .. }) => cost_usd,
                    _ => None,
                };
                (text, cost)
            }
            Err(e) => {
                // Trust the structural evidence when the judge path fails
                warn!(error = %e, "Receipt verification failed; trusting evidence");
                let _ = log.log_error(0, format!("Verification error: {e}"));
                let _ = log.log_finalize_end(None);
                let _ = log.log_receipt_validated(
                    receipt_path.display().to_string(),
                    true,
                    Some("LLM verification skipped".into()),
                );
                return true;
            }
        };

        self.cost.record(cost);
        if !output.is_empty() {
            let _ = log.log_finalize_output(output.clone());
        }

        match VERDICT_PATTERN.captures(&output) {
            Some(caps) => {
                let valid = &caps[1] == "valid";
                let reasoning = caps[2].trim().to_string();
                let _ = log.log_finalize_end(cost);
                let _ = log.log_receipt_validated(
                    receipt_path.display().to_string(),
                    valid,
                    Some(reasoning.clone()),
                );
                if valid {
                    info!(reason = %reasoning, "Receipt verified");
                    true
                } else {
                    warn!(reason = %reasoning, "Receipt rejected by judge");
                    self.fail(
                        FinalizeFailure::JudgeRejected,
                        format!("Receipt rejected: {reasoning}"),
                    )
                }
            }
            None => {
                warn!("No verdict marker in judge response, using structural validation");
                let _ = log.log_finalize_end(cost);
                let _ = log.log_receipt_validated(
                    receipt_path.display().to_string(),
                    true,
                    Some("LLM verdict not found, using format check".into()),
                );
                true
            }
        }
    }
}

#[async_trait]
impl Finalize for ReceiptFinalizer {
    async fn finalize(&mut self, log: &mut ExecutionLogWriter, inputs: &FinalizeInputs) -> bool {
        self.last_failure = None;
        let _ = log.log_finalize_start();
        self.progress(
            inputs.max_iterations,
            "Running host validations and building receipt...",
        );

        let mut builder = ReceiptBuilder::new(
            self.waypoint.id.clone(),
            self.waypoint.title.clone(),
            self.waypoint.objective.clone(),
            self.waypoint.acceptance_criteria.clone(),
        );

        let commands_to_run = if inputs.validation_commands.is_empty() {
            Self::fallback_commands_from_reported(&inputs.reported_commands)
        } else {
            inputs.validation_commands.clone()
        };

        let soft_missing = !commands_to_run.is_empty()
            && inputs.tool_evidence_by_command.is_empty()
            && inputs.tool_evidence_by_category.is_empty();

        if !inputs.host_validations {
            return self
                .finalize_soft_only(log, inputs, builder, &commands_to_run, soft_missing)
                .await;
        }

        if commands_to_run.is_empty() {
            warn!("No validation commands available to run for receipt");
            let _ = log.log_finalize_end(None);
            let _ = log.log_receipt_validated(
                "",
                false,
                Some("No validation commands provided".into()),
            );
            return self.fail(
                FinalizeFailure::NoEvidence,
                "No validation commands provided",
            );
        }

        let project_path = self.project.path().to_path_buf();
        let host_evidence = self
            .run_validation_commands(log, &project_path, &commands_to_run)
            .await;
        for (label, evidence) in &host_evidence {
            builder.capture(label.clone(), evidence);
        }

        self.capture_criteria(log, inputs, &mut builder);

        if !builder.has_evidence() {
            warn!("No validation evidence captured");
            let _ = log.log_finalize_end(None);
            let _ = log.log_receipt_validated("", false, Some("No evidence captured".into()));
            return self.fail(FinalizeFailure::NoEvidence, "No evidence captured");
        }

        let Ok((receipt, receipt_path)) = self.save_receipt(builder, None) else {
            let _ = log.log_finalize_end(None);
            let _ = log.log_receipt_validated("", false, Some("Failed to save receipt".into()));
            return self.fail(FinalizeFailure::NoEvidence, "Failed to save receipt");
        };

        if !receipt.is_valid() {
            let failed = receipt.failed_items();
            let names: Vec<&str> = failed.iter().map(|i| i.item.as_str()).collect();
            warn!(failed = ?names, "Validation commands failed");

            let detail = failed
                .first()
                .map(|item| {
                    let stderr_excerpt: String = item.stderr.chars().take(300).collect();
                    format!(
                        "Host validation failed. {} exited {}: {}",
                        item.command,
                        item.exit_code.unwrap_or(1),
                        stderr_excerpt.trim()
                    )
                })
                .unwrap_or_else(|| "Host validation failed".to_string());

            let _ = log.log_finalize_end(None);
            let _ = log.log_receipt_validated(
                receipt_path.display().to_string(),
                false,
                Some(format!("Failed: {}", names.join(", "))),
            );
            return self.fail(FinalizeFailure::HostValidation, detail);
        }

        self.verify_with_judge(log, &receipt, &receipt_path, inputs.max_iterations)
            .await
    }

    fn last_failure(&self) -> Option<&FailureSummary> {
        self.last_failure.as_ref()
    }
}

/// PATH with user-shell shim directories appended when they exist
fn augmented_path() -> String {
    let mut parts: Vec<String> = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        for extra in [
            home.join(".local/share/mise/shims"),
            home.join(".local/bin"),
            home.join(".cargo/bin"),
        ] {
            let extra_str = extra.to_string_lossy().into_owned();
            if extra.exists() && !parts.contains(&extra_str) {
                parts.push(extra_str);
            }
        }
    }
    parts.join(":")
}

/// Prompt asking the judge to verify a receipt
pub fn build_verification_prompt(receipt: &ChecklistReceipt) -> String {
    let mut prompt = format!(
        "## Receipt Verification\n\n\
         Waypoint: {} — {}\n\
         Objective: {}\n\n\
         ## Acceptance Criteria\n",
        receipt.waypoint_id, receipt.title, receipt.objective
    );
    for (i, criterion) in receipt.acceptance_criteria.iter().enumerate() {
        prompt.push_str(&format!("[{i}] {criterion}\n"));
    }

    prompt.push_str("\n## Validation Evidence\n");
    for item in &receipt.checklist {
        prompt.push_str(&format!(
            "- {} `{}` status={} exit={}\n",
            item.item,
            item.command,
            item.status,
            item.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ));
    }
    for item in &receipt.soft_checklist {
        prompt.push_str(&format!(
            "- (agent-reported) {} `{}` exit={}\n",
            item.item,
            item.command,
            item.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ));
    }

    if !receipt.criteria_verifications.is_empty() {
        prompt.push_str("\n## Criterion Verifications\n");
        for cv in &receipt.criteria_verifications {
            prompt.push_str(&format!(
                "[{}] {} — {}: {}\n",
                cv.index, cv.criterion, cv.status, cv.evidence
            ));
        }
    }

    prompt.push_str(
        "\n## Instructions\n\
         Judge whether this evidence demonstrates that every acceptance \
         criterion was met. Be strict: missing evidence is a failure.\n\n\
         Output exactly one verdict marker:\n\
         <receipt-verdict status=\"valid\">reason</receipt-verdict>\n\
         or\n\
         <receipt-verdict status=\"invalid\">reason</receipt-verdict>\n",
    );
    prompt
}
