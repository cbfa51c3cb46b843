//! End-to-end scenarios for the iterative executor loop.
//!
//! A scripted provider plays back canned event sequences per iteration
//! so the loop's protocol handling, retry behavior, failure
//! classification, and journal output can be asserted deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tempfile::tempdir;

use flightcore::config::Checklist;
use flightcore::evidence::ValidationCategory;
use flightcore::finalizer::{FailureSummary, Finalize, FinalizeFailure, FinalizeInputs};
use flightcore::intervention::InterventionKind;
use flightcore::journal::{ExecutionEvent, ExecutionLogReader, ExecutionLogWriter};
use flightcore::metrics::CostTracker;
use flightcore::models::{Project, Waypoint};
use flightcore::outcome::ExecutionResult;
use flightcore::progress::ProgressStep;
use flightcore::provider::{
    AgentProvider, AgentRequest, EventStream, ProviderError, ProviderEvent, RetryingProvider,
};
use fly_agents::executor::WaypointExecutor;

type Script = Vec<Result<ProviderEvent, ProviderError>>;

/// Provider that plays back one scripted event sequence per query
struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    async fn query(&self, request: AgentRequest) -> Result<EventStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("provider queried more times than scripted");
        Ok(futures::stream::iter(script).boxed())
    }
}

fn chunk(text: &str) -> Result<ProviderEvent, ProviderError> {
    Ok(ProviderEvent::Chunk {
        text: text.to_string(),
    })
}

fn complete(session_id: &str, cost: f64) -> Result<ProviderEvent, ProviderError> {
    Ok(ProviderEvent::Complete {
        full_text: String::new(),
        session_id: Some(session_id.to_string()),
        cost_usd: Some(cost),
        tokens_in: None,
        tokens_out: None,
    })
}

fn criterion(index: usize, status: &str) -> String {
    format!(
        "<acceptance-criterion><index>{index}</index><status>{status}</status>\
         <text>Criterion {index}</text><evidence>checked at index {index}</evidence>\
         </acceptance-criterion>"
    )
}

fn marker(id: &str) -> String {
    format!("<waypoint-complete>{id}</waypoint-complete>")
}

/// Finalizer stub that always validates
struct OkFinalizer {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Finalize for OkFinalizer {
    async fn finalize(&mut self, _log: &mut ExecutionLogWriter, _inputs: &FinalizeInputs) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }
    fn last_failure(&self) -> Option<&FailureSummary> {
        None
    }
}

/// Finalizer stub that fails with host-validation diagnostics, then passes
struct RetryFinalizer {
    calls: Arc<AtomicUsize>,
    failure: FailureSummary,
}

impl RetryFinalizer {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            failure: FailureSummary {
                kind: FinalizeFailure::HostValidation,
                summary: "Host validation failed. cargo clippy -- -D warnings exited 101: \
                          unused assignment in validator.rs:90"
                    .to_string(),
            },
        }
    }
}

#[async_trait]
impl Finalize for RetryFinalizer {
    async fn finalize(&mut self, _log: &mut ExecutionLogWriter, _inputs: &FinalizeInputs) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) >= 1
    }
    fn last_failure(&self) -> Option<&FailureSummary> {
        Some(&self.failure)
    }
}

/// Finalizer stub that never validates
struct InvalidFinalizer {
    failure: FailureSummary,
}

#[async_trait]
impl Finalize for InvalidFinalizer {
    async fn finalize(&mut self, _log: &mut ExecutionLogWriter, _inputs: &FinalizeInputs) -> bool {
        false
    }
    fn last_failure(&self) -> Option<&FailureSummary> {
        Some(&self.failure)
    }
}

fn setup(criteria: &[&str]) -> (tempfile::TempDir, Project, Waypoint) {
    let dir = tempdir().unwrap();
    let project = Project::new("loop-test", dir.path());
    project.ensure_dirs().unwrap();
    let mut waypoint = Waypoint::new("WP-1", "Loop test", "Exercise the loop");
    for c in criteria {
        waypoint = waypoint.with_criterion(*c);
    }
    (dir, project, waypoint)
}

fn journal_events(project: &Project) -> Vec<ExecutionEvent> {
    let log = ExecutionLogReader::load_latest(project, Some("WP-1"))
        .unwrap()
        .expect("journal written");
    log.events
}

// ── S1: happy path over two iterations with real host validations ──────

#[tokio::test]
async fn happy_path_runs_host_validations_and_succeeds() {
    let (_dir, project, waypoint) = setup(&["Criterion 0", "Criterion 1"]);

    let provider = ScriptedProvider::new(vec![
        vec![
            chunk("Starting implementation.\n"),
            chunk(&criterion(0, "verified")),
            complete("session-abc", 0.10),
        ],
        vec![
            chunk(&criterion(1, "verified")),
            chunk("<validation-command>true</validation-command>\n"),
            chunk(&marker("WP-1")),
            complete("session-abc", 0.20),
        ],
    ]);

    // Overrides route every detected category to portable shell commands
    // so the real finalizer can run host validations on any machine
    let mut checklist = Checklist::default();
    checklist
        .validation_overrides
        .insert(ValidationCategory::Lint, "echo lint ok".to_string());
    checklist
        .validation_overrides
        .insert(ValidationCategory::Type, "echo typecheck ok".to_string());
    checklist
        .validation_overrides
        .insert(ValidationCategory::Test, "true".to_string());

    let cost = Arc::new(CostTracker::unlimited());
    let mut executor = WaypointExecutor::new(
        project.clone(),
        waypoint,
        "A Python service validated with pytest",
        provider.clone(),
        cost.clone(),
    )
    .with_checklist(checklist)
    .with_max_iterations(10);

    let result = executor.execute().await.unwrap();
    assert_eq!(result, ExecutionResult::Success);

    let log = ExecutionLogReader::load_latest(&project, Some("WP-1"))
        .unwrap()
        .unwrap();

    // Replay equals the live counters
    assert_eq!(log.iterations_used(), 2);
    assert_eq!(log.result, Some(ExecutionResult::Success));
    assert_eq!(
        log.completed_criteria().into_iter().collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert!((log.summed_costs() - log.total_cost_usd).abs() < 0.005);
    assert!((log.total_cost_usd - 0.30).abs() < 0.005);

    // Exactly one completion, and the expected event shape
    let events = log.events;
    let count = |t: &str| events.iter().filter(|e| e.event_type() == t).count();
    assert_eq!(count("iteration_start"), 2);
    assert_eq!(count("iteration_end"), 2);
    assert_eq!(count("completion_detected"), 1);
    assert_eq!(count("finalize_start"), 1);
    assert_eq!(count("completion"), 1);
    let validation_calls = events
        .iter()
        .filter(|e| {
            matches!(e, ExecutionEvent::FinalizeToolCall { tool_name, .. } if tool_name == "ValidationCommand")
        })
        .count();
    assert_eq!(validation_calls, 3);
    assert!(events.iter().any(
        |e| matches!(e, ExecutionEvent::ReceiptValidated { valid: true, .. })
    ));

    // Criteria completion is monotonic across output events
    let mut seen: Vec<usize> = Vec::new();
    for event in &events {
        if let ExecutionEvent::Output {
            criteria_completed, ..
        } = event
        {
            assert!(
                seen.iter().all(|c| criteria_completed.contains(c)),
                "criteria set shrank"
            );
            seen = criteria_completed.clone();
        }
    }

    // A receipt landed on disk
    let receipts = std::fs::read_dir(project.receipts_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        .count();
    assert_eq!(receipts, 1);
}

// ── S2: host-validation failure retries with a reason code ─────────────

#[tokio::test]
async fn host_validation_failure_retries_then_succeeds() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![
        vec![chunk(&marker("WP-1")), complete("session-abc", 0.1)],
        vec![chunk(&marker("WP-1")), complete("session-abc", 0.1)],
    ]);

    let calls = Arc::new(AtomicUsize::new(0));
    let cost = Arc::new(CostTracker::unlimited());
    let mut executor = WaypointExecutor::new(
        project.clone(),
        waypoint,
        "spec",
        provider.clone(),
        cost,
    )
    .with_finalizer(Box::new(RetryFinalizer::new(calls.clone())));

    let result = executor.execute().await.unwrap();
    assert_eq!(result, ExecutionResult::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].resume_session_id, None);
    assert_eq!(requests[1].resume_session_id.as_deref(), Some("session-abc"));
    assert!(requests[1].prompt.contains("Reason: host_validation_failed"));
    assert!(requests[1]
        .prompt
        .contains("cargo clippy -- -D warnings exited 101"));

    let events = journal_events(&project);
    let starts = events
        .iter()
        .filter(|e| e.event_type() == "iteration_start")
        .count();
    assert_eq!(starts, 2);
}

#[tokio::test]
async fn persistent_invalid_receipt_escalates() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![
        vec![chunk(&marker("WP-1")), complete("s", 0.1)],
        vec![chunk(&marker("WP-1")), complete("s", 0.1)],
    ]);

    let mut executor = WaypointExecutor::new(
        project,
        waypoint,
        "spec",
        provider,
        Arc::new(CostTracker::unlimited()),
    )
    .with_max_iterations(2)
    .with_finalizer(Box::new(InvalidFinalizer {
        failure: FailureSummary {
            kind: FinalizeFailure::HostValidation,
            summary: "Host validation failed. cargo clippy -- -D warnings exited 101.".to_string(),
        },
    }));

    let err = executor.execute().await.unwrap_err();
    assert_eq!(err.intervention.kind, InterventionKind::TestFailure);
    assert!(err.intervention.error_summary.contains("exited 101"));
}

// ── S3: protocol violation (alias completion) ──────────────────────────

#[tokio::test]
async fn alias_completion_is_a_protocol_violation() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![
        vec![
            chunk("Implementation is complete.\n**WP-1 COMPLETE**"),
            complete("session-abc", 0.05),
        ],
        vec![chunk(&marker("WP-1")), complete("session-abc", 0.05)],
    ]);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut executor = WaypointExecutor::new(
        project.clone(),
        waypoint,
        "spec",
        provider.clone(),
        Arc::new(CostTracker::unlimited()),
    )
    .with_finalizer(Box::new(OkFinalizer {
        calls: calls.clone(),
    }));

    let result = executor.execute().await.unwrap();
    assert_eq!(result, ExecutionResult::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    // The alias must not end the loop; iteration 2 resumes the session
    // with an explicit protocol nudge
    assert_eq!(requests[1].resume_session_id.as_deref(), Some("session-abc"));
    assert!(requests[1].prompt.contains("Reason: protocol_violation"));
    assert!(requests[1]
        .prompt
        .contains("<waypoint-complete>WP-1</waypoint-complete>"));

    // Protocol violations are not security violations
    let events = journal_events(&project);
    assert!(!events
        .iter()
        .any(|e| e.event_type() == "security_violation"));
}

// ── S4: rate limit before any output ───────────────────────────────────

struct RateLimitedProvider {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentProvider for RateLimitedProvider {
    async fn query(&self, _request: AgentRequest) -> Result<EventStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::classify(
            "429 Too Many Requests: rate limit exceeded",
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limit_retries_once_then_raises_intervention() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let calls = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(RetryingProvider::new(Arc::new(RateLimitedProvider {
        calls: calls.clone(),
    })));

    let mut executor = WaypointExecutor::new(
        project,
        waypoint,
        "spec",
        provider,
        Arc::new(CostTracker::unlimited()),
    );

    let err = executor.execute().await.unwrap_err();
    let intervention = err.intervention;
    assert_eq!(intervention.kind, InterventionKind::RateLimited);
    assert_eq!(
        intervention.context.get("api_error_type").unwrap(),
        "rate_limited"
    );
    assert!(intervention.error_summary.to_lowercase().contains("rate limit"));
    // One initial attempt plus the wrapper's single scheduled retry
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ── S5: budget exhaustion surfaces context, never retries ──────────────

#[tokio::test]
async fn budget_exceeded_raises_with_context() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    // The provider must never be queried once the budget is blown
    let provider = ScriptedProvider::new(vec![]);
    let cost = Arc::new(CostTracker::with_budget(10.0));
    cost.record(Some(11.0));

    let mut executor = WaypointExecutor::new(project, waypoint, "spec", provider.clone(), cost);

    let err = executor.execute().await.unwrap_err();
    let intervention = err.intervention;
    assert_eq!(intervention.kind, InterventionKind::BudgetExceeded);
    assert_eq!(
        intervention.context.get("api_error_type").unwrap(),
        "budget_exceeded"
    );
    assert_eq!(
        intervention.context.get("configured_budget_usd").unwrap(),
        &serde_json::json!(10.0)
    );
    assert_eq!(
        intervention.context.get("current_cost_usd").unwrap(),
        &serde_json::json!(11.0)
    );
    assert!(intervention
        .error_summary
        .to_lowercase()
        .contains("configured budget $10.00 reached"));
    assert!(provider.requests().is_empty());
}

// ── S6: cooperative cancellation mid-stream ────────────────────────────

#[tokio::test]
async fn cancellation_mid_stream_stops_cleanly() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![vec![
        chunk("thinking about the problem...\n"),
        chunk("writing some code...\n"),
        complete("s", 0.05),
    ]]);

    let finalize_calls = Arc::new(AtomicUsize::new(0));
    let mut executor = WaypointExecutor::new(
        project.clone(),
        waypoint,
        "spec",
        provider,
        Arc::new(CostTracker::unlimited()),
    )
    .with_finalizer(Box::new(OkFinalizer {
        calls: finalize_calls.clone(),
    }));

    // Cancel from inside the first streaming progress update
    let token = executor.cancel_token();
    executor = executor.with_progress(Arc::new(move |update| {
        if update.step == ProgressStep::Streaming {
            token.cancel();
        }
    }));

    let result = executor.execute().await.unwrap();
    assert_eq!(result, ExecutionResult::Cancelled);
    assert_eq!(finalize_calls.load(Ordering::SeqCst), 0);

    let events = journal_events(&project);
    let starts = events
        .iter()
        .filter(|e| e.event_type() == "iteration_start")
        .count();
    assert_eq!(starts, 1);
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::Completion { result: ExecutionResult::Cancelled, .. }
    )));

    // No receipt for a cancelled run
    let receipts = std::fs::read_dir(project.receipts_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .count();
    assert_eq!(receipts, 0);
}

// ── Max iterations without progress ────────────────────────────────────

#[tokio::test]
async fn stuck_run_exits_with_max_iterations() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![
        vec![chunk("still looking around\n"), complete("s", 0.01)],
        vec![chunk("hmm\n"), complete("s", 0.01)],
    ]);

    let mut executor = WaypointExecutor::new(
        project.clone(),
        waypoint,
        "spec",
        provider,
        Arc::new(CostTracker::unlimited()),
    )
    .with_max_iterations(2);

    let result = executor.execute().await.unwrap();
    assert_eq!(result, ExecutionResult::MaxIterations);

    let events = journal_events(&project);
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::Completion { result: ExecutionResult::MaxIterations, .. }
    )));
}

#[tokio::test]
async fn progressing_run_hits_iteration_limit_intervention() {
    let (_dir, project, waypoint) = setup(&["Criterion 0", "Criterion 1"]);

    // Verifies a criterion each round but never emits the marker
    let provider = ScriptedProvider::new(vec![
        vec![chunk(&criterion(0, "verified")), complete("s", 0.01)],
        vec![chunk(&criterion(1, "verified")), complete("s", 0.01)],
    ]);

    let mut executor = WaypointExecutor::new(
        project,
        waypoint,
        "spec",
        provider,
        Arc::new(CostTracker::unlimited()),
    )
    .with_max_iterations(2);

    let err = executor.execute().await.unwrap_err();
    assert_eq!(err.intervention.kind, InterventionKind::IterationLimit);
    assert_eq!(err.intervention.iteration, 2);
    assert_eq!(err.intervention.max_iterations, 2);
}

// ── Agent-requested handoff with failed-command diagnostics ────────────

#[tokio::test]
async fn failed_bash_command_surfaces_in_intervention() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![vec![
        Ok(ProviderEvent::ToolUse {
            tool_name: "Bash".to_string(),
            tool_input: serde_json::json!({
                "command": "cargo run -- /missing/project 2>&1 | head -30"
            }),
            tool_output: Some(
                "error: could not find `Cargo.toml` in `/missing/project`".to_string(),
            ),
        }),
        chunk("I am blocked by a missing manifest and cannot continue.\n"),
        complete("s", 0.02),
    ]]);

    let mut executor = WaypointExecutor::new(
        project,
        waypoint,
        "spec",
        provider,
        Arc::new(CostTracker::unlimited()),
    );

    let err = executor.execute().await.unwrap_err();
    let intervention = err.intervention;
    assert_eq!(intervention.kind, InterventionKind::ExecutionError);
    assert!(intervention.error_summary.contains("Failed command:"));
    assert!(intervention
        .error_summary
        .contains("cargo run -- /missing/project"));
    assert!(intervention
        .error_summary
        .contains("could not find `Cargo.toml`"));
}

// ── Session memory lands on disk after a run ───────────────────────────

#[tokio::test]
async fn run_saves_waypoint_memory() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![vec![
        chunk(&criterion(0, "verified")),
        chunk(&marker("WP-1")),
        complete("s", 0.02),
    ]]);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut executor = WaypointExecutor::new(
        project.clone(),
        waypoint,
        "spec",
        provider,
        Arc::new(CostTracker::unlimited()),
    )
    .with_finalizer(Box::new(OkFinalizer { calls }));

    executor.execute().await.unwrap();

    let record = fly_agents::load_waypoint_memory(&project.memory_dir(), "WP-1").unwrap();
    assert_eq!(record.result, ExecutionResult::Success);
    assert_eq!(record.iterations_used, 1);
    assert_eq!(record.verified_criteria, vec![0]);
}

// ── Scope drift is journaled and fed back ──────────────────────────────

#[tokio::test]
async fn blocked_path_access_sets_scope_drift() {
    let (_dir, project, waypoint) = setup(&["Criterion 0"]);

    let provider = ScriptedProvider::new(vec![
        vec![
            Ok(ProviderEvent::ToolUse {
                tool_name: "Write".to_string(),
                tool_input: serde_json::json!({"file_path": "/etc/cron.d/evil"}),
                tool_output: None,
            }),
            chunk("trying something\n"),
            complete("s", 0.01),
        ],
        vec![chunk(&marker("WP-1")), complete("s", 0.01)],
    ]);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut executor = WaypointExecutor::new(
        project.clone(),
        waypoint,
        "spec",
        provider.clone(),
        Arc::new(CostTracker::unlimited()),
    )
    .with_finalizer(Box::new(OkFinalizer { calls }));

    let result = executor.execute().await.unwrap();
    assert_eq!(result, ExecutionResult::Success);

    let events = journal_events(&project);
    assert!(events
        .iter()
        .any(|e| e.event_type() == "security_violation"));

    let requests = provider.requests();
    assert!(requests[1].prompt.contains("Reason: scope_drift"));
}
