//! Prompt construction for the execution loop and its kickoff retries.
//!
//! Prompt building is a pure function of the waypoint, the spec state,
//! the detected stack, and what has been captured so far — keep it free
//! of I/O so it stays testable in isolation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use flightcore::config::Checklist;
use flightcore::models::SPEC_POINTER;
use flightcore::receipt::CriterionVerification;
use flightcore::stack::{build_validation_section, StackConfig};

use crate::markers::completion_marker;

/// Reason code named in every kickoff prompt after iteration 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickoffReason {
    /// Normal continuation
    Continue,
    /// Alias completion or missing structured report
    ProtocolViolation,
    /// The finalizer found a failing host validation
    HostValidationFailed,
    /// The agent touched blocked paths
    ScopeDrift,
    /// Recovering from a transient error
    ErrorRetry,
}

impl fmt::Display for KickoffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::ProtocolViolation => write!(f, "protocol_violation"),
            Self::HostValidationFailed => write!(f, "host_validation_failed"),
            Self::ScopeDrift => write!(f, "scope_drift"),
            Self::ErrorRetry => write!(f, "error_retry"),
        }
    }
}

/// Spec-context staleness inputs for the first prompt
#[derive(Debug, Clone, Default)]
pub struct SpecStaleness {
    /// Chart-time context no longer matches the live spec
    pub stale: bool,
    /// Hash of the live spec
    pub current_spec_hash: Option<String>,
}

const SAFETY_RULES: &str = "\
## Safety Rules
- STAY IN THE PROJECT working directory at all times.
- NEVER read, write, or execute anything outside the project root.
- NEVER modify git history, remotes, or credentials.
- Keep changes minimal and focused on this waypoint's objective.";

/// System prompt for the execution agent
pub fn system_prompt(project_path: &Path) -> String {
    format!(
        "You are implementing a software waypoint as part of a larger project.\n\
         You have access to file and bash tools to read, write, and execute code.\n\
         Your working directory is {path}. NEVER leave it.\n\n\
         Work methodically:\n\
         1. First understand the existing codebase\n\
         2. Make minimal, focused changes\n\
         3. Test after each change\n\
         4. Iterate until done\n\n\
         When complete, output the completion marker specified in the instructions.",
        path = project_path.display()
    )
}

/// Full first-iteration prompt
#[allow(clippy::too_many_arguments)]
pub fn build_execution_prompt(
    waypoint: &flightcore::models::Waypoint,
    project_path: &Path,
    checklist: &Checklist,
    stacks: &[StackConfig],
    overrides: &BTreeMap<flightcore::evidence::ValidationCategory, String>,
    memory_context: Option<&str>,
    staleness: &SpecStaleness,
) -> String {
    let mut prompt = format!(
        "## Current Waypoint: {id}\n{title}\n\n## Objective\n{objective}\n\n\
         ## Acceptance Criteria (must all pass)\n",
        id = waypoint.id,
        title = waypoint.title,
        objective = waypoint.objective,
    );
    for (i, criterion) in waypoint.acceptance_criteria.iter().enumerate() {
        prompt.push_str(&format!("[{i}] {criterion}\n"));
    }

    if let Some(summary) = &waypoint.spec_context_summary {
        prompt.push_str("\n## Waypoint Spec Context (Chart-Time)\n");
        prompt.push_str(summary);
        prompt.push('\n');
        if !waypoint.spec_section_refs.is_empty() {
            prompt.push_str("Relevant spec sections:\n");
            for section in &waypoint.spec_section_refs {
                prompt.push_str(&format!("- {section}\n"));
            }
        }
        prompt.push_str(&format!("Canonical file: `{SPEC_POINTER}`\n"));
    }

    if staleness.stale {
        prompt.push_str("\n## Spec Context Status\n");
        prompt.push_str(
            "WARNING: this waypoint's chart-time spec context appears stale; \
             the product spec changed after planning. Re-read the canonical \
             spec file before relying on the summary above.\n",
        );
        if let Some(wp_hash) = &waypoint.spec_context_hash {
            prompt.push_str(&format!("- waypoint spec hash: {wp_hash}\n"));
        }
        if let Some(current) = &staleness.current_spec_hash {
            prompt.push_str(&format!("- current spec hash: {current}\n"));
        }
    }

    if let Some(memory) = memory_context {
        prompt.push_str("\n## Prior Waypoint Memory\n");
        prompt.push_str(memory);
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\n## Working Directory\n{}\n\n{SAFETY_RULES}\n",
        project_path.display()
    ));

    prompt.push_str("\n## Validation\n");
    prompt.push_str(&build_validation_section(stacks, overrides));
    prompt.push('\n');

    if !checklist.items.is_empty() {
        prompt.push_str("\n## Checklist\n");
        for item in &checklist.items {
            prompt.push_str(&format!("- [ ] {item}\n"));
        }
    }

    prompt.push_str(&format!(
        "\n## Reporting Protocol\n\
         For every acceptance criterion you verify, output a structured report:\n\
         <acceptance-criterion>\n\
         <index>N</index>\n\
         <status>verified</status>\n\
         <text>criterion text</text>\n\
         <evidence>what you ran or inspected, and what it showed</evidence>\n\
         </acceptance-criterion>\n\
         Use <status>failed</status> when a criterion does not hold yet.\n\n\
         Report every validation command you run:\n\
         <validation-command>the exact command</validation-command>\n\n\
         ## Completion Signal\n\
         When ALL acceptance criteria are met and validations pass, output \
         exactly this marker:\n{marker}\n\
         Only the marker above counts. Do not use aliases like \
         \"{id} COMPLETE\" or \"implementation is complete\".\n\n\
         Begin implementing this waypoint now.\n",
        marker = completion_marker(&waypoint.id),
        id = waypoint.id,
    ));

    prompt
}

/// Short kickoff prompt for iterations after the first
pub fn build_kickoff_prompt(
    reason: KickoffReason,
    detail: &str,
    waypoint_id: &str,
    captured_criteria: &BTreeMap<usize, CriterionVerification>,
) -> String {
    let mut prompt = format!(
        "Continue working on waypoint {waypoint_id}.\n\nReason: {reason}\n"
    );
    if !detail.is_empty() {
        prompt.push_str(&format!("Detail: {detail}\n"));
    }
    if !captured_criteria.is_empty() {
        let verified: Vec<String> = captured_criteria
            .values()
            .map(|c| format!("[{}] {}", c.index, c.status))
            .collect();
        prompt.push_str(&format!(
            "Criteria reported so far: {}\n",
            verified.join(", ")
        ));
    }
    prompt.push_str(&format!(
        "\nWhen every criterion is verified, output exactly:\n{marker}\n\
         Do not use aliases; only the exact marker ends the waypoint.\n",
        marker = completion_marker(waypoint_id)
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use flightcore::evidence::ValidationCategory;
    use flightcore::models::Waypoint;
    use flightcore::receipt::CriterionStatus;
    use flightcore::stack::StackType;
    use std::path::PathBuf;

    fn waypoint() -> Waypoint {
        let mut wp = Waypoint::new(
            "WP-1",
            "Implement feature X",
            "Build feature X with full test coverage",
        )
        .with_criterion("Code works")
        .with_criterion("Tests pass")
        .with_criterion("Documentation updated");
        wp.spec_context_summary = Some(
            "Implement feature X according to the requirements and validate with focused tests."
                .to_string(),
        );
        wp.spec_section_refs = vec!["3.1 Feature X".to_string(), "6.2 Validation".to_string()];
        wp.spec_context_hash = Some("abc123def456abc123de".to_string());
        wp
    }

    fn checklist() -> Checklist {
        Checklist::with_items(vec![
            "Code passes linting".to_string(),
            "All tests pass".to_string(),
        ])
    }

    fn build(wp: &Waypoint, staleness: &SpecStaleness) -> String {
        build_execution_prompt(
            wp,
            &PathBuf::from("/my/project"),
            &checklist(),
            &[StackConfig::canonical(StackType::Python, None)],
            &BTreeMap::new(),
            None,
            staleness,
        )
    }

    #[test]
    fn test_includes_waypoint_fields() {
        let prompt = build(&waypoint(), &SpecStaleness::default());
        assert!(prompt.contains("WP-1"));
        assert!(prompt.contains("Implement feature X"));
        assert!(prompt.contains("Build feature X with full test coverage"));
    }

    #[test]
    fn test_includes_indexed_criteria() {
        let prompt = build(&waypoint(), &SpecStaleness::default());
        assert!(prompt.contains("[0] Code works"));
        assert!(prompt.contains("[1] Tests pass"));
        assert!(prompt.contains("[2] Documentation updated"));
    }

    #[test]
    fn test_includes_spec_context_without_inlining_spec() {
        let prompt = build(&waypoint(), &SpecStaleness::default());
        assert!(prompt.contains("Waypoint Spec Context (Chart-Time)"));
        assert!(prompt.contains("Implement feature X according to the requirements"));
        assert!(prompt.contains("3.1 Feature X"));
        assert!(prompt.contains("6.2 Validation"));
        assert!(prompt.contains("Canonical file: `docs/product-spec.md`"));
    }

    #[test]
    fn test_stale_spec_warning_with_hashes() {
        let staleness = SpecStaleness {
            stale: true,
            current_spec_hash: Some("feedfacebeadfeedface".to_string()),
        };
        let prompt = build(&waypoint(), &staleness);
        assert!(prompt.contains("Spec Context Status"));
        assert!(prompt.contains("appears stale"));
        assert!(prompt.contains("waypoint spec hash: abc123def456abc123de"));
        assert!(prompt.contains("current spec hash: feedfacebeadfeedface"));
    }

    #[test]
    fn test_includes_project_path_and_safety_rules() {
        let prompt = build(&waypoint(), &SpecStaleness::default());
        assert!(prompt.contains("/my/project"));
        assert!(prompt.contains("STAY IN THE PROJECT"));
        assert!(prompt.contains("NEVER"));
    }

    #[test]
    fn test_includes_checklist_and_validation_section() {
        let prompt = build(&waypoint(), &SpecStaleness::default());
        assert!(prompt.contains("Code passes linting"));
        assert!(prompt.contains("All tests pass"));
        assert!(prompt.contains("ruff check ."));
        assert!(prompt.contains("pytest"));
        assert!(prompt.contains("mypy"));
    }

    #[test]
    fn test_includes_completion_and_criterion_markers() {
        let prompt = build(&waypoint(), &SpecStaleness::default());
        assert!(prompt.contains("<waypoint-complete>WP-1</waypoint-complete>"));
        assert!(prompt.contains("<acceptance-criterion>"));
        assert!(prompt.contains("<index>N</index>"));
        assert!(prompt.contains("<status>verified</status>"));
        assert!(prompt.contains("<text>"));
        assert!(prompt.contains("<evidence>"));
        assert!(prompt.contains("<validation-command>"));
    }

    #[test]
    fn test_memory_context_section() {
        let prompt = build_execution_prompt(
            &waypoint(),
            &PathBuf::from("/p"),
            &Checklist::default(),
            &[],
            &BTreeMap::new(),
            Some("WP-000 (dependency): succeeded in 2 iterations"),
            &SpecStaleness::default(),
        );
        assert!(prompt.contains("Prior Waypoint Memory"));
        assert!(prompt.contains("WP-000 (dependency)"));
    }

    #[test]
    fn test_validation_overrides_reach_prompt() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ValidationCategory::Test, "uv run pytest -v".to_string());
        let prompt = build_execution_prompt(
            &waypoint(),
            &PathBuf::from("/p"),
            &Checklist::default(),
            &[StackConfig::canonical(StackType::Python, None)],
            &overrides,
            None,
            &SpecStaleness::default(),
        );
        assert!(prompt.contains("uv run pytest -v"));
    }

    #[test]
    fn test_kickoff_prompt_names_reason_and_marker() {
        let prompt = build_kickoff_prompt(
            KickoffReason::ProtocolViolation,
            "missing completion marker",
            "WP-1",
            &BTreeMap::new(),
        );
        assert!(prompt.contains("Reason: protocol_violation"));
        assert!(prompt.contains("missing completion marker"));
        assert!(prompt.contains("<waypoint-complete>WP-1</waypoint-complete>"));
        assert!(prompt.contains("Do not use aliases"));
    }

    #[test]
    fn test_kickoff_prompt_lists_captured_criteria() {
        let mut captured = BTreeMap::new();
        captured.insert(
            0,
            CriterionVerification {
                index: 0,
                criterion: "C0".to_string(),
                status: CriterionStatus::Verified,
                evidence: "e".to_string(),
            },
        );
        let prompt =
            build_kickoff_prompt(KickoffReason::Continue, "", "WP-1", &captured);
        assert!(prompt.contains("Criteria reported so far"));
        assert!(prompt.contains("[0] verified"));
    }

    #[test]
    fn test_reason_code_names() {
        assert_eq!(KickoffReason::HostValidationFailed.to_string(), "host_validation_failed");
        assert_eq!(KickoffReason::ScopeDrift.to_string(), "scope_drift");
        assert_eq!(KickoffReason::ErrorRetry.to_string(), "error_retry");
    }

    #[test]
    fn test_system_prompt_mentions_cwd() {
        let prompt = system_prompt(&PathBuf::from("/my/project"));
        assert!(prompt.contains("/my/project"));
        assert!(prompt.contains("NEVER"));
        assert!(prompt.to_lowercase().contains("working directory"));
    }
}
