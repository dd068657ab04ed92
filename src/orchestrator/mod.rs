//! The step state machine.
//!
//! Per step: confirm, run the handler, record success, maybe reboot.
//! Only a success on the forward path moves the persisted state, so any
//! invocation can be interrupted and the next one resumes at
//! [`Orchestrator::next_step`].

pub mod reboot;
pub mod state;

pub use reboot::{RebootCoordinator, RebootPolicy, Rebooter, SystemRebooter};
pub use state::{InstallState, StateManager};

use anyhow::Context;
use tracing::{error, info, warn};

use crate::command::CommandRunner;
use crate::config::ConfigStore;
use crate::gates::{ApprovalGate, GateDecision};
use crate::reconcile::VirtControl;
use crate::steps::{Step, StepContext, StepId, StepOutcome, StepRegistry};
use crate::ui::InstallerUI;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Declined,
    Precondition(String),
}

/// Terminal state of one step attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Skipped(SkipReason),
    Succeeded,
    /// Succeeded and the host restart was issued.
    Rebooting,
    Failed(String),
    /// The operator stopped the installer at the confirmation.
    Aborted,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// Reached the end of the registry.
    Finished,
    Failed(StepId),
    Reboot(StepId),
    Aborted(StepId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub results: Vec<(StepId, StepStatus)>,
    pub stop: RunStop,
}

impl RunReport {
    /// Nothing was pending when the run started.
    pub fn nothing_to_do(&self) -> bool {
        self.results.is_empty() && self.stop == RunStop::Finished
    }

    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, s)| matches!(s, StepStatus::Succeeded | StepStatus::Rebooting))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, s)| matches!(s, StepStatus::Skipped(_)))
            .count()
    }
}

/// Collaborators shared by every step of one invocation.
pub struct InstallEnv<'a> {
    pub config: &'a ConfigStore,
    pub state: &'a StateManager,
    pub runner: &'a dyn CommandRunner,
    pub virt: &'a dyn VirtControl,
}

pub struct Orchestrator<'a> {
    registry: StepRegistry,
    env: InstallEnv<'a>,
    gate: ApprovalGate<'a>,
    reboot: RebootCoordinator<'a>,
    ui: InstallerUI,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        registry: StepRegistry,
        env: InstallEnv<'a>,
        gate: ApprovalGate<'a>,
        reboot: RebootCoordinator<'a>,
    ) -> Self {
        let ui = InstallerUI::new(false, env.runner.simulate());
        Self {
            registry,
            env,
            gate,
            reboot,
            ui,
        }
    }

    pub fn with_ui(mut self, ui: InstallerUI) -> Self {
        self.ui = ui;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Index of the first pending step; `registry().len()` when all are done.
    pub fn next_index(&self) -> anyhow::Result<usize> {
        let state = self.env.state.load()?;
        Ok(self
            .registry
            .next_index(state.last_completed_step.as_deref()))
    }

    pub fn next_step(&self) -> anyhow::Result<Option<&Step>> {
        let index = self.next_index()?;
        Ok(self.registry.steps().get(index))
    }

    /// Resume at the first pending step. A no-op when everything is done.
    pub async fn run(&mut self) -> anyhow::Result<RunReport> {
        let index = self.next_index()?;
        if index >= self.registry.len() {
            info!("all steps already completed");
            let report = RunReport {
                results: Vec::new(),
                stop: RunStop::Finished,
            };
            self.ui.print_run_summary(&report);
            return Ok(report);
        }
        Ok(self.run_from(index).await)
    }

    /// Run every step from `index` to the end, stopping at the first
    /// failure, reboot or abort. Skipped steps do not stop the run.
    pub async fn run_from(&mut self, index: usize) -> RunReport {
        let steps: Vec<Step> = self.registry.steps().iter().skip(index).cloned().collect();
        let mut results = Vec::with_capacity(steps.len());
        let mut stop = RunStop::Finished;

        for step in &steps {
            let status = self.run_step(step, true).await;
            results.push((step.id, status.clone()));
            stop = match status {
                StepStatus::Failed(_) => RunStop::Failed(step.id),
                StepStatus::Rebooting => RunStop::Reboot(step.id),
                StepStatus::Aborted => RunStop::Aborted(step.id),
                StepStatus::Succeeded | StepStatus::Skipped(_) => continue,
            };
            break;
        }

        let report = RunReport { results, stop };
        self.ui.print_run_summary(&report);
        report
    }

    /// Run one step out of order. State advances only when `id` is the
    /// next pending step.
    pub async fn run_single(&mut self, id: StepId) -> anyhow::Result<StepStatus> {
        let position = self
            .registry
            .position(id)
            .with_context(|| format!("step {id} is not registered"))?;
        let advance = position == self.next_index()?;
        if !advance {
            info!(step = %id, "running out of order, install state will not change");
        }
        let step = self.registry.steps()[position].clone();
        Ok(self.run_step(&step, advance).await)
    }

    /// Confirm, execute, record. Never returns an error: every failure is
    /// folded into [`StepStatus::Failed`] at this boundary.
    pub async fn run_step(&mut self, step: &Step, advance: bool) -> StepStatus {
        self.ui.print_step_header(step, self.registry.len());

        let status = match self.gate.check_step(step) {
            Ok(GateDecision::Approved | GateDecision::ApprovedAll) => {
                self.execute(step, advance).await
            }
            Ok(GateDecision::Declined) => StepStatus::Skipped(SkipReason::Declined),
            Ok(GateDecision::Aborted) => StepStatus::Aborted,
            Err(e) => StepStatus::Failed(format!(
                "confirmation failed: {e:#} (use --yes when not on a terminal)"
            )),
        };

        match &status {
            StepStatus::Failed(message) => error!(step = %step.id, "{message}"),
            StepStatus::Skipped(SkipReason::Precondition(message)) => {
                warn!(step = %step.id, "skipped: {message}")
            }
            _ => info!(step = %step.id, status = ?status, "step finished"),
        }
        self.ui.step_finished(step, &status);
        status
    }

    async fn execute(&mut self, step: &Step, advance: bool) -> StepStatus {
        let config = match self.env.config.load() {
            Ok(config) => config,
            Err(e) => return StepStatus::Failed(format!("cannot load config: {e}")),
        };
        let ctx = StepContext {
            config: &config,
            store: self.env.config,
            runner: self.env.runner,
            virt: self.env.virt,
        };

        let spinner = self.ui.start_spinner(step);
        let result = step.handler().run(&ctx).await;
        spinner.finish_and_clear();

        match result {
            Ok(StepOutcome::Completed) => {}
            Ok(StepOutcome::PreconditionMissing(message)) => {
                return StepStatus::Skipped(SkipReason::Precondition(message));
            }
            Err(e) => return StepStatus::Failed(format!("{e:#}")),
        }

        if advance && let Err(e) = self.env.state.record(step.id) {
            return StepStatus::Failed(format!("step succeeded but state was not saved: {e}"));
        }

        if !self.reboot.should_reboot(step.id, self.env.runner.simulate()) {
            return StepStatus::Succeeded;
        }
        self.ui.reboot_notice(step);
        match self.reboot.trigger().await {
            Ok(_) => StepStatus::Rebooting,
            Err(e) => StepStatus::Failed(format!(
                "step succeeded but the reboot failed, reboot manually: {e:#}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reboot::testing::RecordingRebooter;
    use super::*;
    use crate::command::recording::RecordingRunner;
    use crate::gates::testing::ScriptedPrompter;
    use crate::reconcile::fake::FakeVirt;
    use crate::steps::StepHandler;
    use crate::steps::testing::{Scripted, ScriptedHandler, dyn_handler};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: ConfigStore,
        state: StateManager,
        runner: RecordingRunner,
        virt: FakeVirt,
        rebooter: RecordingRebooter,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_runner(RecordingRunner::new())
        }

        fn with_runner(runner: RecordingRunner) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                config: ConfigStore::new(dir.path().join("lakehost.toml")),
                state: StateManager::new(dir.path().join("state.toml")),
                _dir: dir,
                runner,
                virt: FakeVirt::new(),
                rebooter: RecordingRebooter::new(),
            }
        }

        fn orchestrator<'a>(
            &'a self,
            handlers: &[(StepId, &Arc<ScriptedHandler>)],
            prompter: &'a ScriptedPrompter,
            auto: bool,
        ) -> Orchestrator<'a> {
            let entries: Vec<(StepId, Arc<dyn StepHandler>)> = handlers
                .iter()
                .map(|(id, h)| (*id, dyn_handler(h)))
                .collect();
            Orchestrator::new(
                StepRegistry::from_handlers(entries).unwrap(),
                InstallEnv {
                    config: &self.config,
                    state: &self.state,
                    runner: &self.runner,
                    virt: &self.virt,
                },
                ApprovalGate::new(prompter, auto),
                RebootCoordinator::new(RebootPolicy::standard(), &self.rebooter),
            )
        }

        fn last(&self) -> Option<String> {
            self.state.load().unwrap().last_completed_step
        }
    }

    fn three_ok() -> [Arc<ScriptedHandler>; 3] {
        [ScriptedHandler::ok(), ScriptedHandler::ok(), ScriptedHandler::ok()]
    }

    #[tokio::test]
    async fn test_consecutive_successes_advance_state() {
        let fx = Fixture::new();
        let [a, b, c] = three_ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[
                (StepId::HostNetwork, &a),
                (StepId::KvmInstall, &b),
                (StepId::SriovVfs, &c),
            ],
            &prompter,
            true,
        );

        assert_eq!(orch.next_step().unwrap().unwrap().id, StepId::HostNetwork);
        let first = orch.registry().steps()[0].clone();
        let status = orch.run_step(&first, true).await;
        assert_eq!(status, StepStatus::Succeeded);
        assert_eq!(fx.last().as_deref(), Some("host_network"));
        assert_eq!(orch.next_step().unwrap().unwrap().id, StepId::KvmInstall);

        let report = orch.run().await.unwrap();
        assert_eq!(report.stop, RunStop::Finished);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(fx.last().as_deref(), Some("sriov_vfs"));
        assert!(orch.next_step().unwrap().is_none());
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));
    }

    #[test]
    fn test_unknown_state_starts_at_first_step() {
        let fx = Fixture::new();
        fx.state
            .save(&InstallState {
                last_completed_step: Some("gpu_passthrough".into()),
                last_run_at: None,
            })
            .unwrap();
        let [a, b, _] = three_ok();
        let prompter = ScriptedPrompter::new();
        let orch = fx.orchestrator(
            &[(StepId::HostNetwork, &a), (StepId::KvmInstall, &b)],
            &prompter,
            true,
        );
        assert_eq!(orch.next_step().unwrap().unwrap().id, StepId::HostNetwork);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let fx = Fixture::new();
        let [a, b, _] = three_ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[(StepId::HostNetwork, &a), (StepId::KvmInstall, &b)],
            &prompter,
            true,
        );
        orch.run().await.unwrap();
        let state_after_first = fx.state.load().unwrap();

        let report = orch.run().await.unwrap();
        assert!(report.nothing_to_do());
        assert_eq!(fx.state.load().unwrap(), state_after_first);
        assert_eq!((a.calls(), b.calls()), (1, 1));
    }

    #[tokio::test]
    async fn test_decline_leaves_state_empty() {
        let fx = Fixture::new();
        let [a, b, _] = three_ok();
        // decline the first step, then stop
        let prompter = ScriptedPrompter::new().select_answers([Some(2), Some(3)]);
        let mut orch = fx.orchestrator(
            &[(StepId::HostNetwork, &a), (StepId::KvmInstall, &b)],
            &prompter,
            false,
        );

        let report = orch.run().await.unwrap();
        assert_eq!(
            report.results[0],
            (StepId::HostNetwork, StepStatus::Skipped(SkipReason::Declined))
        );
        assert_eq!(report.stop, RunStop::Aborted(StepId::KvmInstall));
        assert!(fx.state.load().unwrap().is_empty());
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_reboot_step_reboots_once_and_halts() {
        let fx = Fixture::new();
        let [a, iommu, next] = three_ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[
                (StepId::KvmInstall, &a),
                (StepId::KernelIommu, &iommu),
                (StepId::SriovVfs, &next),
            ],
            &prompter,
            true,
        );

        let report = orch.run().await.unwrap();
        assert_eq!(report.stop, RunStop::Reboot(StepId::KernelIommu));
        assert_eq!(fx.rebooter.count(), 1);
        assert_eq!(next.calls(), 0);
        assert_eq!(fx.last().as_deref(), Some("kernel_iommu"));

        // after the restart the next invocation resumes past the reboot step
        let rebooter = RecordingRebooter::new();
        let mut resumed = Orchestrator::new(
            StepRegistry::from_handlers(vec![
                (StepId::KvmInstall, dyn_handler(&a)),
                (StepId::KernelIommu, dyn_handler(&iommu)),
                (StepId::SriovVfs, dyn_handler(&next)),
            ])
            .unwrap(),
            InstallEnv {
                config: &fx.config,
                state: &fx.state,
                runner: &fx.runner,
                virt: &fx.virt,
            },
            ApprovalGate::new(&prompter, true),
            RebootCoordinator::new(RebootPolicy::standard(), &rebooter),
        );
        let report = resumed.run().await.unwrap();
        assert_eq!(report.stop, RunStop::Finished);
        assert_eq!(next.calls(), 1);
        assert_eq!(iommu.calls(), 1);
        assert_eq!(rebooter.count(), 0);
    }

    #[tokio::test]
    async fn test_simulate_does_not_reboot() {
        let fx = Fixture::with_runner(RecordingRunner::with_simulate(true));
        let [iommu, next, _] = three_ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[(StepId::KernelIommu, &iommu), (StepId::SriovVfs, &next)],
            &prompter,
            true,
        );
        let report = orch.run().await.unwrap();
        assert_eq!(report.stop, RunStop::Finished);
        assert_eq!(fx.rebooter.count(), 0);
        assert_eq!(next.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_halts_and_is_resumable() {
        let fx = Fixture::new();
        let a = ScriptedHandler::ok();
        let b = ScriptedHandler::new(vec![Scripted::Fail("apt-get exited 100"), Scripted::Complete]);
        let c = ScriptedHandler::ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[
                (StepId::HostNetwork, &a),
                (StepId::KvmInstall, &b),
                (StepId::Storage, &c),
            ],
            &prompter,
            true,
        );

        let report = orch.run().await.unwrap();
        assert_eq!(report.stop, RunStop::Failed(StepId::KvmInstall));
        assert!(matches!(&report.results[1].1, StepStatus::Failed(m) if m.contains("apt-get")));
        assert_eq!(fx.last().as_deref(), Some("host_network"));
        assert_eq!(c.calls(), 0);

        let report = orch.run().await.unwrap();
        assert_eq!(report.stop, RunStop::Finished);
        assert_eq!(a.calls(), 1);
        assert_eq!(fx.last().as_deref(), Some("storage"));
    }

    #[tokio::test]
    async fn test_precondition_skips_and_continues() {
        let fx = Fixture::new();
        let a = ScriptedHandler::new(vec![Scripted::Precondition("no mgmt_interface")]);
        let b = ScriptedHandler::ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[(StepId::HostNetwork, &a), (StepId::KvmInstall, &b)],
            &prompter,
            true,
        );
        let report = orch.run().await.unwrap();
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.stop, RunStop::Finished);
        assert_eq!(fx.last().as_deref(), Some("kvm_install"));
    }

    #[tokio::test]
    async fn test_out_of_order_step_does_not_advance() {
        let fx = Fixture::new();
        let [a, b, c] = three_ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[
                (StepId::HostNetwork, &a),
                (StepId::KvmInstall, &b),
                (StepId::Storage, &c),
            ],
            &prompter,
            true,
        );

        assert_eq!(orch.run_single(StepId::Storage).await.unwrap(), StepStatus::Succeeded);
        assert!(fx.state.load().unwrap().is_empty());

        assert_eq!(orch.run_single(StepId::HostNetwork).await.unwrap(), StepStatus::Succeeded);
        assert_eq!(fx.last().as_deref(), Some("host_network"));
        assert!(orch.run_single(StepId::DeployDa).await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_reboot_step_consults_policy() {
        let fx = Fixture::new();
        let [a, iommu, _] = three_ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(
            &[(StepId::HostNetwork, &a), (StepId::KernelIommu, &iommu)],
            &prompter,
            true,
        );
        assert_eq!(
            orch.run_single(StepId::KernelIommu).await.unwrap(),
            StepStatus::Rebooting
        );
        assert_eq!(fx.rebooter.count(), 1);
    }

    #[tokio::test]
    async fn test_failed_reboot_is_reported() {
        let mut fx = Fixture::new();
        fx.rebooter = RecordingRebooter::failing();
        let iommu = ScriptedHandler::ok();
        let prompter = ScriptedPrompter::new();
        let mut orch = fx.orchestrator(&[(StepId::KernelIommu, &iommu)], &prompter, true);
        let report = orch.run().await.unwrap();
        assert_eq!(report.stop, RunStop::Failed(StepId::KernelIommu));
        // the step itself is done
        assert_eq!(fx.last().as_deref(), Some("kernel_iommu"));
    }
}
