//! Checklist receipts — persisted structural evidence that a waypoint's
//! acceptance criteria were met.
//!
//! A receipt carries two parallel checklists: hard items backed by
//! host-run validation commands, and soft items backed by evidence the
//! agent reported through tool calls. Receipts are write-once; the
//! coordinator only reads them back.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FlightResult;
use crate::evidence::CapturedEvidence;

/// Inline output larger than this spills to a side file
const MAX_INLINE_OUTPUT: usize = 10_000;

/// Outcome of one checklist item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Passed,
    Failed,
    Skipped,
}

impl std::fmt::Display for ChecklistStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One checklist entry with its captured output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    /// Item name (category or command label)
    pub item: String,
    /// Command that produced the evidence (empty for pure skips)
    #[serde(default)]
    pub command: String,
    /// Exit code when the command ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Pass/fail/skip
    pub status: ChecklistStatus,
    /// Inline stdout (possibly truncated when spilled)
    #[serde(default)]
    pub stdout: String,
    /// Inline stderr (possibly truncated when spilled)
    #[serde(default)]
    pub stderr: String,
    /// Side file holding full stdout, when spilled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    /// Side file holding full stderr, when spilled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
    /// Free-text evidence note
    #[serde(default)]
    pub evidence: String,
}

/// Status reported by the model for one criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    Verified,
    Failed,
}

impl std::fmt::Display for CriterionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verified => write!(f, "verified"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-criterion verification parsed from agent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionVerification {
    /// Criterion index (0..n-1)
    pub index: usize,
    /// Criterion text as the model restated it
    pub criterion: String,
    /// Model-reported status
    pub status: CriterionStatus,
    /// Supporting evidence text
    pub evidence: String,
}

/// A persisted execution receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistReceipt {
    pub waypoint_id: String,
    pub title: String,
    pub objective: String,
    pub acceptance_criteria: Vec<String>,
    /// Hard items: host-run validations
    pub checklist: Vec<ChecklistItem>,
    /// Soft items: tool-reported evidence
    #[serde(default)]
    pub soft_checklist: Vec<ChecklistItem>,
    /// Per-criterion verification block
    #[serde(default)]
    pub criteria_verifications: Vec<CriterionVerification>,
    pub created_at: DateTime<Utc>,
}

impl ChecklistReceipt {
    /// Hard items that failed
    pub fn failed_items(&self) -> Vec<&ChecklistItem> {
        self.checklist
            .iter()
            .filter(|i| i.status == ChecklistStatus::Failed)
            .collect()
    }

    /// Whether any evidence was captured at all
    pub fn has_evidence(&self) -> bool {
        !self.checklist.is_empty()
            || !self.soft_checklist.is_empty()
            || !self.criteria_verifications.is_empty()
    }

    /// Structural validity: every hard item passed or skipped, and at
    /// least one criterion or command produced evidence.
    pub fn is_valid(&self) -> bool {
        self.failed_items().is_empty() && self.has_evidence()
    }

    /// Persist as pretty JSON
    pub fn save(&self, path: &Path) -> FlightResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load from disk
    pub fn load(path: &Path) -> FlightResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Accumulates evidence and builds the final receipt
pub struct ReceiptBuilder {
    waypoint_id: String,
    title: String,
    objective: String,
    acceptance_criteria: Vec<String>,
    items: Vec<ChecklistItem>,
    criteria: BTreeMap<usize, CriterionVerification>,
}

impl ReceiptBuilder {
    /// Builder for one waypoint
    pub fn new(
        waypoint_id: impl Into<String>,
        title: impl Into<String>,
        objective: impl Into<String>,
        acceptance_criteria: Vec<String>,
    ) -> Self {
        Self {
            waypoint_id: waypoint_id.into(),
            title: title.into(),
            objective: objective.into(),
            acceptance_criteria,
            items: Vec::new(),
            criteria: BTreeMap::new(),
        }
    }

    /// Capture host-run evidence as a hard item
    pub fn capture(&mut self, name: impl Into<String>, evidence: &CapturedEvidence) {
        let status = if evidence.passed() {
            ChecklistStatus::Passed
        } else {
            ChecklistStatus::Failed
        };
        self.items.push(ChecklistItem {
            item: name.into(),
            command: evidence.command.clone(),
            exit_code: Some(evidence.exit_code),
            status,
            stdout: evidence.stdout.clone(),
            stderr: evidence.stderr.clone(),
            stdout_path: None,
            stderr_path: None,
            evidence: format!("exit_code={}", evidence.exit_code),
        });
    }

    /// Record a hard item that was deliberately not run
    pub fn capture_skipped(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.items.push(ChecklistItem {
            item: name.into(),
            command: String::new(),
            exit_code: None,
            status: ChecklistStatus::Skipped,
            stdout: String::new(),
            stderr: String::new(),
            stdout_path: None,
            stderr_path: None,
            evidence: reason.into(),
        });
    }

    /// Record a model-reported criterion verification (last write wins per index)
    pub fn capture_criterion(&mut self, verification: CriterionVerification) {
        self.criteria.insert(verification.index, verification);
    }

    /// Whether anything has been captured
    pub fn has_evidence(&self) -> bool {
        !self.items.is_empty() || !self.criteria.is_empty()
    }

    /// Build the receipt, spilling oversized outputs next to it.
    ///
    /// `soft_evidence` becomes the soft checklist, keyed by label.
    pub fn build(
        mut self,
        output_dir: &Path,
        output_prefix: &str,
        soft_evidence: Option<&BTreeMap<String, CapturedEvidence>>,
    ) -> ChecklistReceipt {
        for (i, item) in self.items.iter_mut().enumerate() {
            spill_item(item, output_dir, output_prefix, i);
        }

        let soft_checklist = soft_evidence
            .map(|map| {
                map.iter()
                    .map(|(label, ev)| ChecklistItem {
                        item: label.clone(),
                        command: ev.command.clone(),
                        exit_code: Some(ev.exit_code),
                        status: if ev.passed() {
                            ChecklistStatus::Passed
                        } else {
                            ChecklistStatus::Failed
                        },
                        stdout: truncate(&ev.stdout),
                        stderr: truncate(&ev.stderr),
                        stdout_path: None,
                        stderr_path: None,
                        evidence: "reported by agent tool call".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ChecklistReceipt {
            waypoint_id: self.waypoint_id,
            title: self.title,
            objective: self.objective,
            acceptance_criteria: self.acceptance_criteria,
            checklist: self.items,
            soft_checklist,
            criteria_verifications: self.criteria.into_values().collect(),
            created_at: Utc::now(),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.len() > MAX_INLINE_OUTPUT {
        let mut end = MAX_INLINE_OUTPUT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}… [truncated]", &text[..end])
    } else {
        text.to_string()
    }
}

fn spill_item(item: &mut ChecklistItem, output_dir: &Path, prefix: &str, index: usize) {
    if item.stdout.len() > MAX_INLINE_OUTPUT {
        let path = output_dir.join(format!("{prefix}-{index}-stdout.txt"));
        if write_spill(&path, &item.stdout) {
            item.stdout_path = Some(path.to_string_lossy().into_owned());
            item.stdout = truncate(&item.stdout);
        }
    }
    if item.stderr.len() > MAX_INLINE_OUTPUT {
        let path = output_dir.join(format!("{prefix}-{index}-stderr.txt"));
        if write_spill(&path, &item.stderr) {
            item.stderr_path = Some(path.to_string_lossy().into_owned());
            item.stderr = truncate(&item.stderr);
        }
    }
}

fn write_spill(path: &Path, content: &str) -> bool {
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return false;
        }
    }
    std::fs::write(path, content).is_ok()
}
