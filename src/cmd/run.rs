//! Step execution: `lakehost run` and `lakehost step <id>`.

use anyhow::{Context, Result};
use console::style;
use std::process::ExitCode;

use super::super::Cli;
use lakehost::command::SystemRunner;
use lakehost::orchestrator::{RunStop, StepStatus};
use lakehost::steps::StepId;

enum Target {
    Resume,
    From(StepId),
    Single(StepId),
}

fn parse_step(id: &str) -> Result<StepId> {
    id.parse::<StepId>().with_context(|| {
        format!(
            "Valid steps: {}",
            StepId::ALL
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })
}

fn print_dry_run_summary(runner: &SystemRunner) {
    let commands = runner.simulated_commands();
    println!();
    println!(
        "{} {} command(s) would have run:",
        style("dry-run").cyan().bold(),
        commands.len()
    );
    for command in commands {
        println!("  {}", style(command).dim());
    }
}

/// Resume at the next pending step, or start at `--from`.
pub async fn cmd_run(cli: &Cli, from: Option<&str>) -> Result<ExitCode> {
    let target = match from {
        Some(id) => Target::From(parse_step(id)?),
        None => Target::Resume,
    };
    execute(cli, target).await
}

/// Run one step regardless of progress.
pub async fn cmd_step(cli: &Cli, id: &str) -> Result<ExitCode> {
    execute(cli, Target::Single(parse_step(id)?)).await
}

async fn execute(cli: &Cli, target: Target) -> Result<ExitCode> {
    use lakehost::gates::{ApprovalGate, TerminalPrompter};
    use lakehost::orchestrator::{
        InstallEnv, Orchestrator, RebootCoordinator, RebootPolicy, SystemRebooter,
    };
    use lakehost::reconcile::VirshControl;
    use lakehost::steps::StepRegistry;
    use lakehost::ui::InstallerUI;

    let store = super::config_store(cli);
    let (config, state) = super::load_context(cli)?;
    let simulate = super::simulate(cli, &config);
    let _lock = super::acquire_lock(cli)?;
    tracing::info!(
        config = %store.path().display(),
        state = %state.path().display(),
        simulate,
        "installer starting"
    );

    let runner = SystemRunner::new(simulate);
    let virt = VirshControl::new(&runner);
    let prompter = TerminalPrompter::new();
    let rebooter = SystemRebooter::new(&runner);
    let mut orchestrator = Orchestrator::new(
        StepRegistry::standard(),
        InstallEnv {
            config: &store,
            state: &state,
            runner: &runner,
            virt: &virt,
        },
        ApprovalGate::new(&prompter, cli.yes),
        RebootCoordinator::new(RebootPolicy::standard(), &rebooter),
    )
    .with_ui(InstallerUI::new(cli.verbose, simulate));

    let failed = match target {
        Target::Resume => matches!(orchestrator.run().await?.stop, RunStop::Failed(_)),
        Target::From(id) => {
            let index = orchestrator
                .registry()
                .position(id)
                .with_context(|| format!("step {id} is not registered"))?;
            matches!(orchestrator.run_from(index).await.stop, RunStop::Failed(_))
        }
        Target::Single(id) => matches!(
            orchestrator.run_single(id).await?,
            StepStatus::Failed(_)
        ),
    };
    if simulate {
        print_dry_run_summary(&runner);
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
