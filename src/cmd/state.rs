//! Progress inspection and reset: `lakehost list`, `status`, `reset`.

use anyhow::Result;
use console::style;
use serde::Serialize;

use super::super::Cli;
use lakehost::orchestrator::RebootPolicy;
use lakehost::steps::StepRegistry;

pub fn cmd_list(cli: &Cli) -> Result<()> {
    use lakehost::ui::InstallerUI;

    let (config, state) = super::load_context(cli)?;
    let simulate = super::simulate(cli, &config);
    let progress = state.load()?;

    println!();
    if simulate {
        println!("{}", style("Dry-run progress").cyan());
    }
    InstallerUI::new(cli.verbose, simulate).print_step_list(
        &StepRegistry::standard(),
        &progress,
        &RebootPolicy::standard(),
    );
    println!();
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    state_file: String,
    dry_run: bool,
    last_completed_step: Option<String>,
    last_run_at: Option<String>,
    next_step: Option<String>,
    completed: usize,
    total: usize,
}

pub fn cmd_status(cli: &Cli, json: bool) -> Result<()> {
    let (config, state) = super::load_context(cli)?;
    let progress = state.load()?;
    let registry = StepRegistry::standard();
    let next = registry.next_index(progress.last_completed_step.as_deref());

    let report = StatusReport {
        state_file: state.path().display().to_string(),
        dry_run: super::simulate(cli, &config),
        last_completed_step: progress.last_completed_step.clone(),
        last_run_at: progress.last_run_at.map(|t| t.to_rfc3339()),
        next_step: registry.steps().get(next).map(|s| s.id.to_string()),
        completed: next,
        total: registry.len(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("Installer Status");
    println!("================");
    println!();
    println!("State file: {}", report.state_file);
    if report.dry_run {
        println!("Mode:       {}", style("dry-run").cyan());
    }
    println!(
        "Last step:  {}",
        report.last_completed_step.as_deref().unwrap_or("(none)")
    );
    if let Some(at) = progress.last_run_at {
        println!("Completed:  {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if progress.last_completed_step.is_some() && progress.known_step().is_none() {
        println!(
            "            {}",
            style("unknown to this version, the next run starts over").yellow()
        );
    }
    println!("Progress:   {}/{}", report.completed, report.total);
    match registry.steps().get(next) {
        Some(step) => println!(
            "Next:       {} ({})",
            style(step.id).cyan().bold(),
            step.display_name
        ),
        None => println!("Next:       {}", style("all steps complete").green()),
    }
    println!();
    Ok(())
}

pub fn cmd_reset(cli: &Cli, force: bool) -> Result<()> {
    use lakehost::gates::{ApprovalGate, TerminalPrompter};

    let (_, state) = super::load_context(cli)?;
    if !force {
        let prompter = TerminalPrompter::new();
        let gate = ApprovalGate::new(&prompter, cli.yes);
        if !gate.confirm("This will forget all installation progress. Are you sure?")? {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let _lock = super::acquire_lock(cli)?;
    state.reset()?;
    tracing::info!(state = %state.path().display(), "install state reset");
    println!("Reset complete");
    Ok(())
}
