use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::orchestrator::{InstallState, RebootPolicy, RunReport, RunStop, SkipReason, StepStatus};
use crate::steps::{Step, StepRegistry};
use crate::ui::icons::{CHECK, CROSS, DRY_RUN, PENDING, REBOOT, RUNNING, SKIP, SPARKLE, WARN};

/// Terminal output for the installer: step headers, a spinner while a
/// handler runs, and end-of-run summaries.
///
/// Logs go to stderr through `tracing`; everything here is for the operator
/// and goes to stdout.
pub struct InstallerUI {
    verbose: bool,
    simulate: bool,
}

impl InstallerUI {
    pub fn new(verbose: bool, simulate: bool) -> Self {
        Self { verbose, simulate }
    }

    /// Print a full-width cyan separator line.
    pub fn print_separator(&self) {
        println!("{}", style("═".repeat(70)).cyan());
    }

    pub fn print_step_header(&self, step: &Step, total: usize) {
        println!();
        self.print_separator();
        println!(
            "{} Step {}/{}: {}",
            RUNNING,
            style(step.ordinal).yellow().bold(),
            total,
            style(&step.display_name).bold()
        );
        if self.verbose {
            println!("  {} {}", style("id:").dim(), step.id);
        }
        if self.simulate {
            println!("  {}{}", DRY_RUN, style("dry-run: commands are logged, not executed").dim());
        }
        self.print_separator();
    }

    /// Spinner shown while a handler runs. Hidden when stderr is not a terminal.
    pub fn start_spinner(&self, step: &Step) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {msg} {elapsed:.dim}")
                .expect("progress bar template is a valid static string"),
        );
        spinner.set_message(step.display_name.clone());
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    }

    pub fn step_finished(&self, step: &Step, status: &StepStatus) {
        let line = match status {
            StepStatus::Succeeded => format!("{} {} complete", CHECK, style(step.id).green()),
            StepStatus::Rebooting => {
                format!("{} {} complete, rebooting", CHECK, style(step.id).green())
            }
            StepStatus::Skipped(SkipReason::Declined) => {
                format!("{} {} skipped", SKIP, style(step.id).dim())
            }
            StepStatus::Skipped(SkipReason::Precondition(message)) => format!(
                "{} {} skipped: {}",
                WARN,
                style(step.id).yellow(),
                message
            ),
            StepStatus::Failed(message) => {
                format!("{} {} failed: {}", CROSS, style(step.id).red().bold(), message)
            }
            StepStatus::Aborted => format!("{} stopped before {}", CROSS, step.id),
        };
        println!("{line}");
    }

    pub fn reboot_notice(&self, step: &Step) {
        println!(
            "\n{} {} requires a restart. Rebooting now; run `lakehost run` again afterwards.\n",
            REBOOT,
            style(step.id).yellow().bold()
        );
    }

    pub fn print_run_summary(&self, report: &RunReport) {
        println!();
        if report.nothing_to_do() {
            println!("{} All steps are already complete.", SPARKLE);
            return;
        }
        let counts = format!(
            "{} succeeded, {} skipped",
            style(report.succeeded()).green(),
            style(report.skipped()).yellow()
        );
        match report.stop {
            RunStop::Finished => println!("{} Installer finished ({counts}).", SPARKLE),
            RunStop::Failed(id) => println!(
                "{} Stopped at {} ({counts}). Fix the problem and run again to resume.",
                CROSS,
                style(id).red().bold()
            ),
            RunStop::Reboot(id) => println!(
                "{} Rebooting after {} ({counts}).",
                REBOOT,
                style(id).yellow()
            ),
            RunStop::Aborted(id) => println!(
                "{} Stopped by operator before {} ({counts}).",
                CROSS,
                style(id).yellow()
            ),
        }
    }

    /// Step table for `lakehost list`.
    pub fn print_step_list(
        &self,
        registry: &StepRegistry,
        state: &InstallState,
        policy: &RebootPolicy,
    ) {
        let next = registry.next_index(state.last_completed_step.as_deref());
        for (index, step) in registry.steps().iter().enumerate() {
            let marker = if index < next {
                format!("{}", CHECK)
            } else {
                format!("{}", PENDING)
            };
            let reboot = if policy.contains(step.id) {
                style("(reboot)").dim().to_string()
            } else {
                String::new()
            };
            let id = format!("{:<18}", step.id.as_str());
            let id = if index == next {
                style(id).cyan().bold().to_string()
            } else {
                id
            };
            println!(
                "{marker}{:>2}. {id} {} {reboot}",
                step.ordinal, step.display_name
            );
        }
    }
}
