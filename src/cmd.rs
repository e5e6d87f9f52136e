//! CLI command implementations.

use anyhow::Result;
use console::style;
use std::sync::Arc;
use uuid::Uuid;

use conductor::capability::ProcessCapability;
use conductor::config::Config;
use conductor::coordinator::PipelineCoordinator;
use conductor::run::{RunStatus, RunStore, StageStatus, WorkflowRun};
use conductor::store::CheckpointStore;

fn coordinator(config: &Config) -> Result<PipelineCoordinator> {
    let capability = Arc::new(ProcessCapability::new(
        &config.capability_cmd,
        config.capability_args.clone(),
        config.log_dir.clone(),
    ));
    PipelineCoordinator::new(config.clone(), capability.clone(), capability)
}

pub fn cmd_init(config: &Config) -> Result<()> {
    config.ensure_dirs()?;
    let written = config.write_starter_config()?;

    println!();
    if written {
        println!(
            "Initialized {} with a starter config.",
            config.data_dir.display()
        );
    } else {
        println!(
            "{} already initialized; config left untouched.",
            config.data_dir.display()
        );
    }
    if config.spec_file.exists() {
        println!("Spec: {}", config.spec_file.display());
    } else {
        println!(
            "Spec: {} ({})",
            config.spec_file.display(),
            style("missing - create it before starting a run").yellow()
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_start(config: &Config, request: &str) -> Result<()> {
    let run = coordinator(config)?.start(request).await?;
    print_outcome(&run);
    Ok(())
}

pub async fn cmd_resume(config: &Config, run_id: Uuid) -> Result<()> {
    let run = coordinator(config)?.resume(run_id).await?;
    print_outcome(&run);
    Ok(())
}

pub fn cmd_status(config: &Config, run_id: Option<Uuid>) -> Result<()> {
    match run_id {
        Some(id) => show_run(config, id),
        None => list_runs(config),
    }
}

pub async fn cmd_cancel(config: &Config, run_id: Uuid) -> Result<()> {
    coordinator(config)?.cancel(run_id).await?;
    println!("Cancellation requested for run {run_id}.");
    Ok(())
}

pub fn cmd_discard_checkpoint(config: &Config, run_id: Uuid, force: bool) -> Result<()> {
    if !force {
        anyhow::bail!(
            "refusing to discard the checkpoint without --force; \
             the run would re-execute every stage from the start"
        );
    }
    let removed = CheckpointStore::new(config.runs_dir.clone()).discard(run_id)?;
    if removed {
        println!("Checkpoint for run {run_id} discarded.");
    } else {
        println!("Run {run_id} has no checkpoint.");
    }
    Ok(())
}

fn show_run(config: &Config, run_id: Uuid) -> Result<()> {
    let report = coordinator(config)?.status(run_id)?;
    let run = &report.run;

    println!();
    println!("Run {}", run.id);
    println!("Request: {}", run.request);
    println!("Status:  {}", styled_status(run.status));
    if let Some(err) = &run.last_error {
        println!("Error:   {err}");
    }
    if let Some(alignment) = &report.alignment {
        let verdict = if alignment.aligned {
            style("aligned").green()
        } else {
            style("rejected").red()
        };
        println!("Gate:    {verdict} - {}", alignment.rationale);
    }

    println!();
    println!("{:<16} {:<10} {:>9}  Summary", "Stage", "Status", "Duration");
    for stage in &run.stages {
        let stats = report
            .checkpoint
            .as_ref()
            .and_then(|cp| cp.stats.get(stage));
        let status = match stats {
            Some(_) => StageStatus::Succeeded,
            None if run.stage_name(run.current_stage) == Some(stage.as_str()) => {
                match run.status {
                    RunStatus::Running => StageStatus::Running,
                    RunStatus::Failed => StageStatus::Failed,
                    _ => StageStatus::Pending,
                }
            }
            None => StageStatus::Pending,
        };
        match stats {
            Some(s) => println!(
                "{:<16} {:<10} {:>7}ms  {}",
                stage,
                styled_stage_status(status),
                s.duration_ms,
                s.summary
            ),
            None => println!("{:<16} {:<10}", stage, styled_stage_status(status)),
        }
    }

    if !report.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in &report.artifacts {
            println!(
                "  {:<16} {:<16} {}",
                artifact.stage, artifact.kind, artifact.created_at
            );
        }
    }
    println!();
    Ok(())
}

fn list_runs(config: &Config) -> Result<()> {
    let runs = RunStore::new(config.runs_dir.clone()).list()?;
    if runs.is_empty() {
        println!();
        println!("No runs yet. Submit one with 'conductor start <request>'.");
        println!();
        return Ok(());
    }

    println!();
    println!("{:<38} {:<11} {:<7} Request", "Run", "Status", "Stage");
    for run in runs {
        println!(
            "{:<38} {:<11} {:<3}/{:<3} {}",
            run.id,
            run.status,
            run.current_stage,
            run.stages.len(),
            truncate(&run.request, 48)
        );
    }
    println!();
    Ok(())
}

fn print_outcome(run: &WorkflowRun) {
    println!();
    println!("Run {}", run.id);
    match run.status {
        RunStatus::Completed => println!("Status: {}", style("completed").green()),
        RunStatus::Aborted => println!(
            "Status: {} - request rejected by the alignment gate (see 'conductor status {}')",
            style("aborted").red(),
            run.id
        ),
        RunStatus::Failed => {
            println!("Status: {}", style("failed").red());
            if let Some(err) = &run.last_error {
                println!("Error:  {err}");
            }
            println!("Committed stages are kept; resume with 'conductor resume {}'.", run.id);
        }
        RunStatus::Cancelled => println!(
            "Status: {} - resume with 'conductor resume {}'",
            style("cancelled").yellow(),
            run.id
        ),
        other => println!("Status: {other}"),
    }
    println!();
}

fn styled_status(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Completed => style(text).green(),
        RunStatus::Failed | RunStatus::Aborted => style(text).red(),
        RunStatus::Cancelled => style(text).yellow(),
        RunStatus::Running => style(text).cyan(),
        _ => style(text).dim(),
    }
}

fn styled_stage_status(status: StageStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        StageStatus::Succeeded => style(text).green(),
        StageStatus::Running => style(text).cyan(),
        StageStatus::Failed => style(text).red(),
        StageStatus::Pending => style(text).dim(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{cut}…")
}
