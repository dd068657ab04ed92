//! Hardware resource reconciliation for the two VMs.
//!
//! A [`VmResourceBinding`] names one device a VM should have. The
//! [`Reconciler`] drives the VM's live and persistent definitions toward it
//! and then verifies both by reading the definitions back, independent of
//! what the mutating calls returned:
//!
//! 1. read the run state; a shut-off VM has nothing live to verify
//! 2. compare both definitions with the target; a match is a no-op
//! 3. detach whatever occupies the target's slot (live first, then persistent)
//! 4. attach with one combined call, falling back to live then persistent
//! 5. re-verify with bounded retries, waiting longer when only the
//!    persistent side is outstanding
//! 6. one detach/reattach recovery cycle, then a final verification
//!
//! The result is a [`ReconcileOutcome`]; only `Failed` should stop a step.

mod binding;
pub mod cpu;
mod device;
mod domain;
pub mod vf;
mod virt;

#[cfg(test)]
pub mod fake;

pub use binding::{BindingKind, DeviceSpec, VmResourceBinding};
pub use device::{DeviceIdentity, PciAddress, compare_device_paths};
pub use domain::{DiskEntry, DomainDevices, parse_domain_xml};
pub use virt::{Definition, RunState, Scope, VirshControl, VirtControl};

use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::errors::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Present in the persistent definition and, if running, in the live one.
    FullyConsistent,
    /// Present live; the persistent definition has not caught up.
    LiveOnly,
    Failed,
}

impl ReconcileOutcome {
    pub fn classify(running: bool, live_verified: bool, config_verified: bool) -> Self {
        match (live_verified, config_verified) {
            (true, true) => ReconcileOutcome::FullyConsistent,
            (true, false) if running => ReconcileOutcome::LiveOnly,
            _ => ReconcileOutcome::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ReconcileOutcome::Failed)
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileOutcome::FullyConsistent => "fully consistent",
            ReconcileOutcome::LiveOnly => "live only, persistence pending",
            ReconcileOutcome::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub verify_attempts: u32,
    pub verify_delay: Duration,
    /// Extra attempts granted once live is verified and persistent is not.
    pub extended_attempts: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        (&ReconcileConfig::default()).into()
    }
}

impl From<&ReconcileConfig> for ReconcileSettings {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            verify_attempts: config.verify_attempts,
            verify_delay: Duration::from_millis(config.verify_delay_ms),
            extended_attempts: config.extended_attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub binding: VmResourceBinding,
    pub outcome: ReconcileOutcome,
    /// Whether any attach or detach was attempted.
    pub changed: bool,
    /// Whether the recovery cycle ran.
    pub recovered: bool,
    /// Changes were only simulated and not verified.
    pub simulated: bool,
    pub error: Option<String>,
}

/// The worst outcome among `reports`; `FullyConsistent` when empty.
pub fn overall_outcome(reports: &[ReconcileReport]) -> ReconcileOutcome {
    let mut overall = ReconcileOutcome::FullyConsistent;
    for report in reports {
        match report.outcome {
            ReconcileOutcome::Failed => return ReconcileOutcome::Failed,
            ReconcileOutcome::LiveOnly => overall = ReconcileOutcome::LiveOnly,
            ReconcileOutcome::FullyConsistent => {}
        }
    }
    overall
}

/// Both definitions as last read.
struct Snapshot {
    live: Option<DomainDevices>,
    persistent: DomainDevices,
}

#[derive(Default)]
struct Progress {
    running: bool,
    changed: bool,
    recovered: bool,
    simulated: bool,
}

pub struct Reconciler<'a> {
    virt: &'a dyn VirtControl,
    settings: ReconcileSettings,
}

impl<'a> Reconciler<'a> {
    pub fn new(virt: &'a dyn VirtControl, settings: ReconcileSettings) -> Self {
        Self { virt, settings }
    }

    pub async fn reconcile_all(&self, bindings: Vec<VmResourceBinding>) -> Vec<ReconcileReport> {
        let mut reports = Vec::with_capacity(bindings.len());
        for binding in bindings {
            reports.push(self.reconcile(binding).await);
        }
        reports
    }

    pub async fn reconcile(&self, mut binding: VmResourceBinding) -> ReconcileReport {
        debug!(%binding, kind = %binding.kind(), "reconciling");
        let (progress, error) = match self.drive(&mut binding).await {
            Ok(progress) => (progress, None),
            Err(e) => (Progress::default(), Some(e.to_string())),
        };

        let outcome = if error.is_some() {
            ReconcileOutcome::Failed
        } else if progress.simulated {
            ReconcileOutcome::FullyConsistent
        } else {
            ReconcileOutcome::classify(
                progress.running,
                binding.live_verified,
                binding.config_verified,
            )
        };
        match outcome {
            ReconcileOutcome::FullyConsistent => info!(%binding, "{outcome}"),
            ReconcileOutcome::LiveOnly => warn!(%binding, "{outcome}"),
            ReconcileOutcome::Failed => error!(
                %binding,
                live = binding.live_verified,
                persistent = binding.config_verified,
                error = error.as_deref().unwrap_or(""),
                "reconciliation failed"
            ),
        }

        ReconcileReport {
            binding,
            outcome,
            changed: progress.changed,
            recovered: progress.recovered,
            simulated: progress.simulated,
            error,
        }
    }

    async fn drive(&self, binding: &mut VmResourceBinding) -> Result<Progress, ReconcileError> {
        let running = self.virt.run_state(&binding.vm_name).await?.is_running();
        let mut progress = Progress {
            running,
            ..Default::default()
        };

        let snapshot = self.verify(binding, running).await?;
        if binding.verified() {
            debug!(%binding, "already in place");
            return Ok(progress);
        }
        progress.changed = true;

        self.detach_conflicts(binding, &snapshot).await;
        self.attach_missing(binding, running).await;
        if self.virt.simulated() {
            info!(%binding, "[dry-run] changes simulated, verification skipped");
            progress.simulated = true;
            return Ok(progress);
        }
        self.verify_with_retry(binding, running).await?;
        if binding.verified() {
            return Ok(progress);
        }

        warn!(
            %binding,
            live = binding.live_verified,
            persistent = binding.config_verified,
            "not verified after attach, running recovery cycle"
        );
        progress.recovered = true;
        self.recover(binding, running).await;
        self.verify(binding, running).await?;
        Ok(progress)
    }

    /// Read both definitions and update the verification flags.
    async fn verify(
        &self,
        binding: &mut VmResourceBinding,
        running: bool,
    ) -> Result<Snapshot, ReconcileError> {
        let vm = binding.vm_name.clone();
        let persistent = self.virt.devices(&vm, Definition::Persistent).await?;
        binding.config_verified = binding.target.present_in(&persistent);

        let live = if running {
            let live = self.virt.devices(&vm, Definition::Live).await?;
            binding.live_verified = binding.target.present_in(&live);
            Some(live)
        } else {
            binding.live_verified = true;
            None
        };
        Ok(Snapshot { live, persistent })
    }

    async fn verify_with_retry(
        &self,
        binding: &mut VmResourceBinding,
        running: bool,
    ) -> Result<(), ReconcileError> {
        let mut budget = self.settings.verify_attempts.max(1);
        let mut extended = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.verify(binding, running).await?;
            if binding.verified() {
                debug!(%binding, attempt, "verified");
                return Ok(());
            }
            if !extended && binding.live_verified && !binding.config_verified {
                extended = true;
                budget += self.settings.extended_attempts;
                debug!(%binding, "live verified, waiting longer for persistent definition");
            }
            if attempt >= budget {
                return Ok(());
            }
            tokio::time::sleep(self.settings.verify_delay).await;
        }
    }

    async fn detach_conflicts(&self, binding: &VmResourceBinding, snapshot: &Snapshot) {
        let vm = binding.vm_name.as_str();
        let mut plan: Vec<(DeviceSpec, Scope)> = Vec::new();
        if let Some(live) = &snapshot.live {
            plan.extend(binding.conflicts_in(live).into_iter().map(|d| (d, Scope::Live)));
        }
        plan.extend(
            binding
                .conflicts_in(&snapshot.persistent)
                .into_iter()
                .map(|d| (d, Scope::Persistent)),
        );
        for (device, scope) in plan {
            info!(vm, %device, %scope, "detaching conflicting device");
            if let Err(e) = self.virt.detach(vm, &device, scope).await {
                warn!(vm, %device, %scope, "detach failed: {e}");
            }
        }
    }

    /// Attach wherever the target is not yet verified. Failures are logged;
    /// verification decides the outcome.
    async fn attach_missing(&self, binding: &VmResourceBinding, running: bool) {
        let need_live = running && !binding.live_verified;
        let Some(scope) = Scope::for_flags(need_live, !binding.config_verified) else {
            return;
        };
        let vm = binding.vm_name.as_str();
        let device = &binding.target;

        info!(vm, %device, %scope, "attaching");
        let err = match self.virt.attach(vm, device, scope).await {
            Ok(()) => return,
            Err(e) => e,
        };
        if scope != Scope::Both {
            warn!(vm, %device, %scope, "attach failed: {err}");
            return;
        }

        warn!(vm, %device, "combined attach failed ({err}), trying live and persistent separately");
        let live = self.virt.attach(vm, device, Scope::Live).await;
        let persistent = self.virt.attach(vm, device, Scope::Persistent).await;
        match (live, persistent) {
            (Ok(()), Ok(())) => {}
            (Ok(()), Err(e)) => {
                warn!(vm, %device, "live attach succeeded but persistent attach failed: {e}")
            }
            (Err(e), Ok(())) => {
                warn!(vm, %device, "persistent attach succeeded but live attach failed: {e}")
            }
            (Err(live), Err(persistent)) => {
                warn!(vm, %device, "live attach failed: {live}; persistent attach failed: {persistent}")
            }
        }
    }

    async fn recover(&self, binding: &mut VmResourceBinding, running: bool) {
        let vm_name = binding.vm_name.clone();
        let vm = vm_name.as_str();
        let present_live = running && binding.live_verified;
        if let Some(scope) = Scope::for_flags(present_live, binding.config_verified) {
            info!(vm, device = %binding.target, %scope, "recovery: detaching target");
            if let Err(e) = self.virt.detach(vm, &binding.target, scope).await {
                warn!(vm, device = %binding.target, "recovery detach failed: {e}");
            }
        }
        binding.live_verified = !running;
        binding.config_verified = false;
        self.attach_missing(binding, running).await;
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeDomain, FakeVirt};
    use super::*;

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            verify_attempts: 3,
            verify_delay: Duration::ZERO,
            extended_attempts: 2,
        }
    }

    fn disk_vm(running: bool, source: &str) -> FakeDomain {
        let mut domain = FakeDomain::new(running);
        let entry = DiskEntry {
            target: "vdb".into(),
            source: Some(source.into()),
        };
        domain.persistent.disks.push(entry.clone());
        if running {
            domain.live.disks.push(entry);
        }
        domain
    }

    #[test]
    fn test_classify() {
        use ReconcileOutcome::*;
        assert_eq!(ReconcileOutcome::classify(true, true, true), FullyConsistent);
        assert_eq!(ReconcileOutcome::classify(true, true, false), LiveOnly);
        assert_eq!(ReconcileOutcome::classify(true, false, true), Failed);
        assert_eq!(ReconcileOutcome::classify(true, false, false), Failed);
        assert_eq!(ReconcileOutcome::classify(false, true, true), FullyConsistent);
        assert_eq!(ReconcileOutcome::classify(false, true, false), Failed);
    }

    #[tokio::test]
    async fn test_already_attached_is_noop() {
        let virt = FakeVirt::new().with_domain("dl-master", disk_vm(true, "/dev/dlvg/dldata"));
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::disk("dl-master", "/dev/dlvg/dldata", "vdb"))
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::FullyConsistent);
        assert!(!report.changed);
        assert!(virt.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_running_vm_disk_swapped() {
        let virt = FakeVirt::new().with_domain("dl-master", disk_vm(true, "/dev/dlvg/old"));
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::disk("dl-master", "/dev/dlvg/new", "vdb"))
            .await;

        assert_eq!(report.outcome, ReconcileOutcome::FullyConsistent);
        assert!(report.changed);
        assert!(!report.recovered);
        assert_eq!(
            virt.mutations(),
            vec![
                "detach live disk /dev/dlvg/old as vdb",
                "detach persistent disk /dev/dlvg/old as vdb",
                "attach live+persistent disk /dev/dlvg/new as vdb",
            ]
        );
        let domain = virt.domain("dl-master");
        assert_eq!(domain.live.disks.len(), 1);
        assert_eq!(domain.persistent.disks[0].source.as_deref(), Some("/dev/dlvg/new"));
    }

    #[tokio::test]
    async fn test_persistent_writes_failing_leaves_live_only() {
        let virt = FakeVirt::new().with_domain("dl-master", disk_vm(true, "/dev/dlvg/old"));
        virt.fail_persistent_writes();
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::disk("dl-master", "/dev/dlvg/new", "vdb"))
            .await;

        assert_eq!(report.outcome, ReconcileOutcome::LiveOnly);
        assert!(report.recovered);
        assert!(report.binding.live_verified);
        assert!(!report.binding.config_verified);
        let mutations = virt.mutations();
        assert!(mutations.contains(&"attach live disk /dev/dlvg/new as vdb".to_string()));
        assert!(mutations.contains(&"attach persistent disk /dev/dlvg/new as vdb".to_string()));
        // extended window: 3 regular + 2 extended reads, plus the first and final check
        assert_eq!(virt.persistent_reads(), 7);
    }

    #[tokio::test]
    async fn test_shut_off_vm_only_touches_persistent_definition() {
        let virt = FakeVirt::new().with_domain("da-master", FakeDomain::new(false));
        let reconciler = Reconciler::new(&virt, settings());
        let addr: PciAddress = "0000:3b:02.1".parse().unwrap();
        let report = reconciler
            .reconcile(VmResourceBinding::hostdev("da-master", addr))
            .await;

        assert_eq!(report.outcome, ReconcileOutcome::FullyConsistent);
        assert_eq!(virt.mutations(), vec!["attach persistent hostdev 0000:3b:02.1"]);
    }

    #[tokio::test]
    async fn test_shut_off_vm_with_failing_persistent_writes_fails() {
        let virt = FakeVirt::new().with_domain("da-master", FakeDomain::new(false));
        virt.fail_persistent_writes();
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::vcpu_pin("da-master", 0, 3))
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::Failed);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_stale_persistent_reads_recover_within_extended_window() {
        let virt = FakeVirt::new().with_domain("dl-master", FakeDomain::new(true));
        // the first check and all three regular attempts read nothing
        virt.hide_persistent_reads(4);
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::vcpu_pin("dl-master", 1, 4))
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::FullyConsistent);
        assert!(!report.recovered);
    }

    #[tokio::test]
    async fn test_conflicting_vf_replaced() {
        let old: PciAddress = "0000:3b:02.0".parse().unwrap();
        let new: PciAddress = "0000:3b:02.1".parse().unwrap();
        let mut domain = FakeDomain::new(true);
        domain.live.hostdevs.push(old);
        domain.persistent.hostdevs.push(old);
        let virt = FakeVirt::new().with_domain("dl-master", domain);
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::hostdev("dl-master", new).replacing([old, new]))
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::FullyConsistent);
        assert_eq!(virt.domain("dl-master").persistent.hostdevs, vec![new]);
    }

    #[tokio::test]
    async fn test_missing_vm_fails_with_error() {
        let virt = FakeVirt::new();
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::vcpu_pin("ghost", 0, 2))
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::Failed);
        assert!(report.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_simulated_changes_skip_verification() {
        use crate::command::CommandOutput;
        use crate::command::recording::RecordingRunner;

        let runner = RecordingRunner::with_simulate(true);
        runner
            .respond("virsh domstate", CommandOutput::ok("running"))
            .respond(
                "virsh dumpxml",
                CommandOutput::ok("<domain><devices/></domain>"),
            );
        let virt = VirshControl::new(&runner);
        let reconciler = Reconciler::new(&virt, settings());
        let report = reconciler
            .reconcile(VmResourceBinding::vcpu_pin("dl-master", 0, 2))
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::FullyConsistent);
        assert!(report.simulated);
        assert_eq!(runner.runs(), vec!["virsh vcpupin dl-master 0 2 --live --config"]);
    }

    #[tokio::test]
    async fn test_overall_outcome() {
        let virt = FakeVirt::new()
            .with_domain("dl-master", disk_vm(true, "/dev/dlvg/dldata"))
            .with_domain("da-master", FakeDomain::new(true));
        let reconciler = Reconciler::new(&virt, settings());
        let reports = reconciler
            .reconcile_all(vec![
                VmResourceBinding::disk("dl-master", "/dev/dlvg/dldata", "vdb"),
                VmResourceBinding::vcpu_pin("da-master", 0, 3),
            ])
            .await;
        assert_eq!(overall_outcome(&reports), ReconcileOutcome::FullyConsistent);
        assert_eq!(overall_outcome(&[]), ReconcileOutcome::FullyConsistent);
    }
}
