//! CLI command handlers.

pub mod adapters;

use anyhow::{Context, Result};
use conductor::config::EngineConfig;
use conductor::engine::{StatusReport, WorkflowEngine};
use conductor::run::{Phase, RunStatus};
use conductor::store::FsBackend;
use console::style;
use std::sync::Arc;

use adapters::{CommandAgent, GhCli};

/// Wire the engine with the filesystem backend and the CLI adapters.
fn build_engine(config: &EngineConfig) -> WorkflowEngine {
    let backend = Arc::new(FsBackend::new(&config.data_dir));
    let agent = Arc::new(CommandAgent::from_config(config));
    let github = Arc::new(GhCli::new());
    WorkflowEngine::new(config.clone(), backend, agent, github)
}

/// `conductor start <feature>`: create a run and drive it until it
/// completes, fails, or pauses for human input.
pub async fn start(config: EngineConfig, feature: &str, no_drive: bool) -> Result<()> {
    let engine = build_engine(&config);
    let run_id = engine.start_run(feature)?;
    println!("{} {}", style("Created run").bold(), style(&run_id).cyan());

    if no_drive {
        return Ok(());
    }
    let status = engine.resume_run(&run_id).await?;
    print_outcome(&run_id, status);
    print_report(&engine.get_status(&run_id)?);
    Ok(())
}

/// `conductor resume <run_id>`: continue from the latest checkpoint.
pub async fn resume(config: EngineConfig, run_id: &str) -> Result<()> {
    let engine = build_engine(&config);
    let status = engine.resume_run(run_id).await?;
    print_outcome(run_id, status);
    print_report(&engine.get_status(run_id)?);
    Ok(())
}

/// `conductor status <run_id>`: report without driving.
pub fn status(config: EngineConfig, run_id: &str, json: bool) -> Result<()> {
    let engine = build_engine(&config);
    let report = engine.get_status(run_id)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize status")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

/// `conductor step <run_id> <phase>`: run one phase in isolation.
pub async fn step(config: EngineConfig, run_id: &str, phase: &str) -> Result<()> {
    let phase: Phase = phase
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("Unknown phase name")?;
    let engine = build_engine(&config);
    let report = engine.step_phase(run_id, phase).await?;

    println!(
        "{} {} — {} output(s), {} missing",
        style("Stepped").bold(),
        style(phase).cyan(),
        report.outputs,
        report.missing
    );
    println!(
        "  conflicts: {} opened, {} auto-resolved",
        report.conflicts_opened, report.conflicts_auto_resolved
    );
    if report.blocked {
        println!("  {}", style("exit predicate blocked").yellow());
    }
    Ok(())
}

/// `conductor list`: every persisted run.
pub fn list(config: EngineConfig) -> Result<()> {
    let engine = build_engine(&config);
    let runs = engine.list_runs()?;
    if runs.is_empty() {
        println!("No runs yet.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {}  {}  {}",
            style(&run.run_id).cyan(),
            status_styled(run.status()),
            run.phase(),
            run.feature
        );
    }
    Ok(())
}

fn print_outcome(run_id: &str, status: RunStatus) {
    match status {
        RunStatus::Completed => {
            println!("{} {}", style("Completed").green().bold(), run_id)
        }
        RunStatus::Failed => println!("{} {}", style("Failed").red().bold(), run_id),
        RunStatus::PausedForHuman => println!(
            "{} {} — waiting on PR feedback; run `conductor resume {}` after replying",
            style("Paused").yellow().bold(),
            run_id,
            run_id
        ),
        other => println!("{} {}", other, run_id),
    }
}

fn print_report(report: &StatusReport) {
    println!(
        "  phase: {}  status: {}  checkpoints: {}",
        style(report.phase).cyan(),
        status_styled(report.status),
        report.checkpoints
    );
    if let Some(error) = &report.error {
        println!("  {} {}", style("error:").red(), error);
    }
    for conflict in &report.open_conflicts {
        println!(
            "  {} [{}/{}] {} — personas: {}",
            style("open conflict").yellow(),
            conflict.kind,
            conflict.severity,
            conflict.question,
            conflict
                .personas
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}

fn status_styled(status: RunStatus) -> console::StyledObject<&'static str> {
    match status {
        RunStatus::Completed => style("completed").green(),
        RunStatus::Failed => style("failed").red(),
        RunStatus::PausedForHuman => style("paused_for_human").yellow(),
        RunStatus::Running => style("running").cyan(),
        RunStatus::Pending => style("pending").dim(),
    }
}
