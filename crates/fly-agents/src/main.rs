//! Headless FLY driver.
//!
//! Runs the waypoint loop over a project from the command line: select
//! the next runnable waypoint, execute it, commit on success, and keep
//! going until the plan lands, pauses, or needs intervention.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flightcore::config::FlyConfig;
use flightcore::git::ProcessGit;
use flightcore::models::{FlightPlan, FlightPlanStore, Project, Waypoint};
use flightcore::outcome::ExecutionResult;
use flightcore::progress::{ProgressCallback, ProgressStep};

use fly_agents::coordinator::JourneyCoordinator;
use fly_agents::provider_cli::CliAgentProvider;
use fly_agents::NextAction;

/// Autonomous waypoint execution over a flight plan
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scaffold project directories and a sample flight plan
    Init {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Execute runnable waypoints until the plan lands or pauses
    Fly {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Execute only this waypoint, then stop
        #[arg(long)]
        waypoint: Option<String>,
        /// Override the per-waypoint iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Skip host validations (receipt from tool evidence only)
        #[arg(long, default_value_t = false)]
        no_host_validations: bool,
    },
    /// Show plan completion status
    Status {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Args::parse().command {
        Command::Init { path, name } => init(path, name),
        Command::Fly {
            path,
            waypoint,
            max_iterations,
            no_host_validations,
        } => fly(path, waypoint, max_iterations, no_host_validations).await,
        Command::Status { path } => status(path),
    }
}

fn project_at(path: &PathBuf, name: Option<String>) -> Result<Project> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project path {} does not exist", path.display()))?;
    let name = name.unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });
    Ok(Project::new(name, root))
}

fn init(path: PathBuf, name: Option<String>) -> Result<()> {
    std::fs::create_dir_all(&path)?;
    let project = project_at(&path, name)?;
    project.ensure_dirs()?;

    let store = FlightPlanStore::new(project.flight_plan_path());
    if store.exists() {
        bail!("flight plan already exists at {}", store.path().display());
    }
    let mut plan = FlightPlan::new();
    plan.add_waypoint(
        Waypoint::new("WP-1", "Bootstrap the project", "Set up the project skeleton")
            .with_criterion("Project builds cleanly")
            .with_criterion("A smoke test passes"),
    );
    store.save(&plan)?;

    println!("Initialized project '{}' at {}", project.slug, project.path().display());
    println!("Edit {} and docs/product-spec.md, then run `fly-agents fly`", store.path().display());
    Ok(())
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|update| match update.step {
        ProgressStep::Executing | ProgressStep::Finalizing | ProgressStep::Complete => {
            eprintln!(
                "[{}] iter {}/{} {}: {}",
                update.waypoint_id,
                update.iteration,
                update.total_iterations,
                update.step,
                update.output.trim()
            );
        }
        _ => {}
    })
}

async fn fly(
    path: PathBuf,
    only_waypoint: Option<String>,
    max_iterations: Option<u32>,
    no_host_validations: bool,
) -> Result<()> {
    let project = project_at(&path, None)?;
    project.ensure_dirs()?;

    let mut config = FlyConfig::load(project.path())?;
    if let Some(max) = max_iterations {
        config.max_iterations = max;
    }
    if no_host_validations {
        config.host_validations = false;
    }

    let git = Arc::new(ProcessGit::new(project.path()));
    let provider = Arc::new(CliAgentProvider::new(config.provider_command.clone()));
    let mut coordinator = JourneyCoordinator::open(project, git, provider, config)?;
    coordinator.initialize()?;

    let mut next = match &only_waypoint {
        Some(id) => coordinator
            .plan()
            .get(id)
            .cloned()
            .with_context(|| format!("unknown waypoint {id}"))?,
        None => match coordinator.select_next_waypoint(false) {
            Some(wp) => wp,
            None => {
                println!("Nothing runnable. {}", summary_line(&coordinator));
                return Ok(());
            }
        },
    };

    loop {
        info!(waypoint = %next.id, title = %next.title, "Executing waypoint");
        let result = coordinator
            .execute_waypoint(&next.id, Some(progress_printer()))
            .await?;

        if result == ExecutionResult::Success {
            let outcome = coordinator.commit_waypoint(&next.id)?;
            for notice in &outcome.notices {
                eprintln!("note [{:?}]: {}", notice.severity, notice.message);
            }
        }

        if only_waypoint.is_some() {
            println!("{}: {result}", next.id);
            return Ok(());
        }

        match coordinator.handle_execution_result(&next.id, result) {
            NextAction::Execute(wp) | NextAction::Continue(wp) => next = wp,
            NextAction::Land(message) => {
                println!("Landed: {message}");
                return Ok(());
            }
            NextAction::Complete(message) => {
                println!("Done for now: {message}");
                return Ok(());
            }
            NextAction::Pause(message) => {
                println!("Paused: {message}");
                return Ok(());
            }
            NextAction::Intervention(intervention) => {
                println!(
                    "Intervention needed on {} ({}): {}",
                    intervention.waypoint.id, intervention.kind, intervention.error_summary
                );
                println!("Suggested action: {}", intervention.suggested_action());
                bail!("intervention required");
            }
            NextAction::Abort(reason) => bail!("aborted: {reason}"),
        }
    }
}

fn summary_line(coordinator: &JourneyCoordinator) -> String {
    let status = coordinator.completion_status();
    format!(
        "{}/{} complete, {} pending, {} failed, {} skipped (cost ${:.2})",
        status.complete,
        status.total,
        status.pending,
        status.failed,
        status.skipped,
        coordinator.total_cost_usd()
    )
}

fn status(path: PathBuf) -> Result<()> {
    let project = project_at(&path, None)?;
    let store = FlightPlanStore::new(project.flight_plan_path());
    let plan = store.load()?;

    for (wp, depth) in plan.iterate_in_order() {
        println!(
            "{}{} [{}] {}",
            "  ".repeat(depth),
            wp.id,
            wp.status,
            wp.title
        );
    }
    let status = plan.completion_status();
    println!(
        "\n{}/{} complete, {} pending, {} failed",
        status.complete, status.total, status.pending, status.failed
    );
    Ok(())
}
