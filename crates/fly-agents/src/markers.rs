//! Parsing of structured markers in agent output.
//!
//! The executor trusts exactly one completion signal — the canonical
//! `<waypoint-complete>` marker. Everything else the agent emits
//! ("WP-1 COMPLETE", "implementation is complete") is a protocol
//! violation and feeds the next kickoff prompt instead.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use flightcore::progress::FileOperation;
use flightcore::receipt::{CriterionStatus, CriterionVerification};

/// Bash commands longer than this are truncated in progress events
const MAX_COMMAND_PREVIEW: usize = 60;

/// Window captured around an intervention trigger
const REASON_WINDOW: usize = 250;

pub(crate) static CRITERION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<acceptance-criterion>\s*<index>(\d+)</index>\s*<status>(verified|failed)</status>\s*<text>(.*?)</text>\s*<evidence>(.*?)</evidence>\s*</acceptance-criterion>",
    )
    .expect("criterion pattern compiles")
});

static VALIDATION_COMMAND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<validation-command>(.*?)</validation-command>")
        .expect("validation command pattern compiles")
});

/// Markers in agent text that request a human handoff
const INTERVENTION_MARKERS: &[&str] = &[
    "cannot proceed",
    "need human help",
    "blocked by",
    "unable to complete",
    "requires manual",
];

/// The canonical completion marker for a waypoint
pub fn completion_marker(waypoint_id: &str) -> String {
    format!("<waypoint-complete>{waypoint_id}</waypoint-complete>")
}

/// Whether the canonical marker appears in `text`
pub fn contains_completion_marker(text: &str, waypoint_id: &str) -> bool {
    text.contains(&completion_marker(waypoint_id))
}

/// Whether the agent claimed completion without the canonical marker
pub fn claimed_completion_alias(text: &str, waypoint_id: &str) -> bool {
    if contains_completion_marker(text, waypoint_id) {
        return false;
    }
    let upper = text.to_uppercase();
    upper.contains(&format!("{} COMPLETE", waypoint_id.to_uppercase()))
        || upper.contains("IMPLEMENTATION IS COMPLETE")
        || upper.contains("WAYPOINT COMPLETE")
        || upper.contains("WAYPOINT IS COMPLETE")
        || upper.contains("ALL CRITERIA MET")
}

/// Parse `<acceptance-criterion>` blocks into verifications
pub fn parse_criterion_markers(text: &str) -> Vec<CriterionVerification> {
    CRITERION_PATTERN
        .captures_iter(text)
        .filter_map(|caps| {
            let index: usize = caps[1].parse().ok()?;
            let status = match &caps[2] {
                "verified" => CriterionStatus::Verified,
                _ => CriterionStatus::Failed,
            };
            Some(CriterionVerification {
                index,
                criterion: caps[3].trim().to_string(),
                status,
                evidence: caps[4].trim().to_string(),
            })
        })
        .collect()
}

/// Parse `<validation-command>` blocks into trimmed command strings
pub fn parse_validation_commands(text: &str) -> Vec<String> {
    VALIDATION_COMMAND_PATTERN
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Derive a file-operation record from a tool call, when the tool is
/// file-shaped. Unknown tools yield `None`.
pub fn extract_file_operation(
    tool_name: &str,
    tool_input: &serde_json::Value,
) -> Option<FileOperation> {
    let str_field = |key: &str| {
        tool_input
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let file_path = match tool_name {
        "Edit" | "Write" | "Read" => str_field("file_path")?,
        "Glob" => str_field("pattern")?,
        "Grep" => str_field("path")?,
        "Bash" => {
            let command = str_field("command")?;
            if command.len() > MAX_COMMAND_PREVIEW {
                let mut end = MAX_COMMAND_PREVIEW;
                while !command.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &command[..end])
            } else {
                command
            }
        }
        _ => return None,
    };

    Some(FileOperation {
        tool_name: tool_name.to_string(),
        file_path,
        line_number: tool_input
            .get("line_number")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32),
    })
}

/// Whether a file tool call reaches outside the project root.
///
/// Relative paths resolve inside the project by construction; absolute
/// paths must sit under the root.
pub fn is_blocked_path_access(
    tool_name: &str,
    tool_input: &serde_json::Value,
    project_root: &Path,
) -> bool {
    let path_field = match tool_name {
        "Edit" | "Write" | "Read" => "file_path",
        "Grep" => "path",
        _ => return false,
    };
    let Some(path) = tool_input.get(path_field).and_then(|v| v.as_str()) else {
        return false;
    };
    let path = Path::new(path);
    path.is_absolute() && !path.starts_with(project_root)
}

/// Whether agent output asks for a human handoff
pub fn needs_intervention(output: &str) -> bool {
    let lower = output.to_lowercase();
    INTERVENTION_MARKERS.iter().any(|m| lower.contains(m))
}

/// Extract a short reason around the first intervention marker
pub fn extract_intervention_reason(output: &str) -> String {
    let lower = output.to_lowercase();
    for marker in INTERVENTION_MARKERS {
        if let Some(at) = lower.find(marker) {
            let start = at.saturating_sub(REASON_WINDOW);
            let end = (at + marker.len() + REASON_WINDOW).min(output.len());
            let mut s = start;
            while !output.is_char_boundary(s) {
                s += 1;
            }
            let mut e = end;
            while !output.is_char_boundary(e) {
                e -= 1;
            }
            return output[s..e].trim().to_string();
        }
    }
    "Agent requested human intervention".to_string()
}

/// Classify protocol derailments at the end of an iteration
pub fn detect_protocol_issues(
    iteration_output: &str,
    waypoint_id: &str,
    stage_reports_logged: usize,
    scope_drift_detected: bool,
) -> Vec<String> {
    let mut issues = Vec::new();
    if claimed_completion_alias(iteration_output, waypoint_id) {
        issues.push("claimed completion without exact completion marker".to_string());
        if stage_reports_logged == 0 {
            issues.push("missing structured stage report".to_string());
        }
    }
    if scope_drift_detected {
        issues.push("attempted tool access to blocked project areas".to_string());
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_single_criterion() {
        let text = "<acceptance-criterion>\n<index>0</index>\n<status>verified</status>\n\
                    <text>Feature implemented</text>\n\
                    <evidence>Code review shows implementation is complete.</evidence>\n\
                    </acceptance-criterion>";
        let parsed = parse_criterion_markers(text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].index, 0);
        assert_eq!(parsed[0].status, CriterionStatus::Verified);
        assert_eq!(parsed[0].criterion, "Feature implemented");
        assert!(parsed[0].evidence.contains("Code review"));
    }

    #[test]
    fn test_matches_multiple_criteria() {
        let text = "noise\n\
            <acceptance-criterion><index>0</index><status>verified</status><text>A</text><evidence>a</evidence></acceptance-criterion>\n\
            more noise\n\
            <acceptance-criterion><index>1</index><status>verified</status><text>B</text><evidence>b</evidence></acceptance-criterion>\n\
            <acceptance-criterion><index>2</index><status>failed</status><text>C</text><evidence>missing</evidence></acceptance-criterion>";
        let parsed = parse_criterion_markers(text);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2].index, 2);
        assert_eq!(parsed[2].status, CriterionStatus::Failed);
    }

    #[test]
    fn test_no_match_on_invalid_format() {
        let invalid = [
            // Missing status
            "<acceptance-criterion><index>0</index><text>T</text><evidence>E</evidence></acceptance-criterion>",
            // Missing index
            "<acceptance-criterion><status>verified</status><text>T</text><evidence>E</evidence></acceptance-criterion>",
            // Missing evidence
            "<acceptance-criterion><index>0</index><status>verified</status><text>T</text></acceptance-criterion>",
            // Non-numeric index
            "<acceptance-criterion><index>abc</index><status>verified</status><text>T</text><evidence>E</evidence></acceptance-criterion>",
        ];
        for text in invalid {
            assert!(parse_criterion_markers(text).is_empty(), "matched: {text}");
        }
    }

    #[test]
    fn test_multiline_evidence() {
        let text = "<acceptance-criterion>\n<index>0</index>\n<status>verified</status>\n\
                    <text>Tests pass</text>\n<evidence>\nLine 1.\nLine 2.\nLine 3.\n</evidence>\n\
                    </acceptance-criterion>";
        let parsed = parse_criterion_markers(text);
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].evidence.contains("Line 1."));
        assert!(parsed[0].evidence.contains("Line 3."));
    }

    #[test]
    fn test_validation_command_markers() {
        let text = "<validation-command>pytest -v</validation-command>\n\
                    <validation-command>\n  ruff check .\n</validation-command>\n\
                    <validation-command></validation-command>";
        assert_eq!(
            parse_validation_commands(text),
            vec!["pytest -v".to_string(), "ruff check .".to_string()]
        );
    }

    #[test]
    fn test_completion_marker_exact_only() {
        assert!(contains_completion_marker(
            "done <waypoint-complete>WP-1</waypoint-complete>",
            "WP-1"
        ));
        assert!(!contains_completion_marker("**WP-1 COMPLETE**", "WP-1"));
        assert!(!contains_completion_marker(
            "<waypoint-complete>WP-2</waypoint-complete>",
            "WP-1"
        ));
    }

    #[test]
    fn test_alias_detection() {
        assert!(claimed_completion_alias(
            "Implementation is complete. **WP-1 COMPLETE**",
            "WP-1"
        ));
        assert!(claimed_completion_alias("The waypoint is complete.", "WP-1"));
        assert!(!claimed_completion_alias(
            "<waypoint-complete>WP-1</waypoint-complete>",
            "WP-1"
        ));
        assert!(!claimed_completion_alias("Still working on tests.", "WP-1"));
    }

    #[test]
    fn test_extract_file_operations() {
        let op = extract_file_operation(
            "Edit",
            &serde_json::json!({"file_path": "/project/src/main.py", "content": "..."}),
        )
        .unwrap();
        assert_eq!(op.tool_name, "Edit");
        assert_eq!(op.file_path, "/project/src/main.py");

        let op =
            extract_file_operation("Glob", &serde_json::json!({"pattern": "**/*.py"})).unwrap();
        assert_eq!(op.file_path, "**/*.py");

        let op = extract_file_operation(
            "Grep",
            &serde_json::json!({"pattern": "def main", "path": "/project/src"}),
        )
        .unwrap();
        assert_eq!(op.file_path, "/project/src");
    }

    #[test]
    fn test_bash_command_truncation() {
        let op = extract_file_operation("Bash", &serde_json::json!({"command": "pytest -v"}))
            .unwrap();
        assert_eq!(op.file_path, "pytest -v");

        let long = "x".repeat(100);
        let op = extract_file_operation("Bash", &serde_json::json!({ "command": long })).unwrap();
        assert_eq!(op.file_path.len(), MAX_COMMAND_PREVIEW + 3);
        assert!(op.file_path.ends_with("..."));
    }

    #[test]
    fn test_unknown_tool_and_missing_fields() {
        assert!(extract_file_operation("TodoWrite", &serde_json::json!({"some": "param"})).is_none());
        assert!(extract_file_operation("Edit", &serde_json::json!({"content": "..."})).is_none());
        assert!(extract_file_operation("Read", &serde_json::json!({"file_path": 123})).is_none());
    }

    #[test]
    fn test_blocked_path_detection() {
        let root = Path::new("/project");
        assert!(is_blocked_path_access(
            "Write",
            &serde_json::json!({"file_path": "/etc/passwd"}),
            root
        ));
        assert!(!is_blocked_path_access(
            "Write",
            &serde_json::json!({"file_path": "/project/src/lib.rs"}),
            root
        ));
        assert!(!is_blocked_path_access(
            "Write",
            &serde_json::json!({"file_path": "src/lib.rs"}),
            root
        ));
        assert!(!is_blocked_path_access(
            "Bash",
            &serde_json::json!({"command": "cat /etc/passwd"}),
            root
        ));
    }

    #[test]
    fn test_needs_intervention_markers() {
        assert!(needs_intervention("I cannot proceed with this task"));
        assert!(needs_intervention("NEED HUMAN HELP"));
        assert!(needs_intervention("This is blocked by a missing dependency"));
        assert!(needs_intervention("I am unable to complete this"));
        assert!(needs_intervention("This requires manual configuration"));
        assert!(!needs_intervention("Writing test file..."));
        assert!(!needs_intervention("All tests pass!"));
    }

    #[test]
    fn test_extract_intervention_reason() {
        let output =
            "Some context. I cannot proceed because the API key is missing. More text.";
        let reason = extract_intervention_reason(output);
        assert!(reason.to_lowercase().contains("cannot proceed"));
        assert!(reason.to_lowercase().contains("api key"));

        assert_eq!(
            extract_intervention_reason("No markers here"),
            "Agent requested human intervention"
        );
    }

    #[test]
    fn test_detect_protocol_issues() {
        let issues = detect_protocol_issues(
            "Implementation is complete. **WP-1 COMPLETE**",
            "WP-1",
            0,
            true,
        );
        assert!(issues
            .iter()
            .any(|i| i.contains("claimed completion without exact completion marker")));
        assert!(issues.iter().any(|i| i.contains("missing structured stage report")));
        assert!(issues
            .iter()
            .any(|i| i.contains("attempted tool access to blocked project areas")));

        assert!(detect_protocol_issues("normal progress", "WP-1", 0, false).is_empty());
    }
}
