use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::deploy::VmRole;
use super::storage::data_volume_path;
use super::{StepContext, StepHandler, StepOutcome};
use crate::errors::{InstallError, ReconcileError};
use crate::poll::PollOutcome;
use crate::reconcile::cpu::{host_cpu_count, partition_cores, vcpu_pins};
use crate::reconcile::vf::{VfAssignment, discover_vfs};
use crate::reconcile::{ReconcileOutcome, Reconciler, VmResourceBinding, overall_outcome};

pub const DATA_DISK_TARGET: &str = "vdb";

/// Shuts both VMs down, reconciles VF, vCPU pins and data disk, and starts
/// them again.
pub struct AttachResources;

impl AttachResources {
    async fn plan(ctx: &StepContext<'_>) -> anyhow::Result<Vec<VmResourceBinding>> {
        let config = ctx.config;
        let mut bindings = Vec::new();

        let discovered = match discover_vfs(ctx.runner).await {
            Ok(vfs) => vfs,
            Err(e) => {
                warn!("VF discovery failed, using persisted assignment only: {e:#}");
                Vec::new()
            }
        };
        let vfs = VfAssignment::resolve(config, &discovered);
        for (role, addr) in [
            (VmRole::DataLake, vfs.data_lake),
            (VmRole::DataAnalytics, vfs.data_analytics),
        ] {
            let vm = &role.vm(config).name;
            match addr {
                Some(addr) => bindings.push(
                    VmResourceBinding::hostdev(vm, addr).replacing(vfs.all.iter().copied()),
                ),
                None => warn!(vm = %vm, "no virtual function available"),
            }
        }

        if config.cpu_pinning.enabled {
            let cpus = host_cpu_count(ctx.runner).await?;
            let cores = partition_cores(cpus, &config.cpu_pinning);
            for (role, list) in [
                (VmRole::DataLake, &cores.data_lake),
                (VmRole::DataAnalytics, &cores.data_analytics),
            ] {
                let vm = role.vm(config);
                bindings.extend(
                    vcpu_pins(&vm.name, vm.vcpus, list)
                        .into_iter()
                        .map(|(vcpu, cpu)| VmResourceBinding::vcpu_pin(&vm.name, vcpu, cpu)),
                );
            }
        }

        if !config.data_disks.is_empty() {
            bindings.push(VmResourceBinding::disk(
                &config.dl.name,
                data_volume_path(config),
                DATA_DISK_TARGET,
            ));
        }
        Ok(bindings)
    }

    async fn shut_down(ctx: &StepContext<'_>, names: &[&str]) -> anyhow::Result<()> {
        let mut requested = Vec::new();
        for name in names {
            if ctx.virt.run_state(name).await?.is_running() {
                ctx.virt.shutdown(name).await?;
                requested.push(*name);
            }
        }
        let interval = Duration::from_secs(ctx.config.shutdown_poll_secs);
        let timeout = Duration::from_secs(ctx.config.shutdown_timeout_secs);
        for name in requested {
            match ctx.virt.wait_for_shut_off(name, interval, timeout).await {
                PollOutcome::Reached => info!(vm = name, "shut off"),
                PollOutcome::TimedOut => warn!(
                    vm = name,
                    "still running after {}s, applying changes live",
                    timeout.as_secs()
                ),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StepHandler for AttachResources {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let names: Vec<&str> = VmRole::BOTH
            .iter()
            .map(|role| role.vm(ctx.config).name.as_str())
            .collect();
        for name in &names {
            match ctx.virt.is_defined(name).await {
                Ok(true) => {}
                Ok(false) => {
                    return Ok(StepOutcome::PreconditionMissing(format!(
                        "VM {name} is not defined, deploy it first"
                    )));
                }
                Err(ReconcileError::Command(InstallError::CommandSpawn { command, .. })) => {
                    return Ok(StepOutcome::PreconditionMissing(format!(
                        "`{command}` is not available, install KVM first"
                    )));
                }
                Err(ReconcileError::Command(e)) => {
                    return Ok(StepOutcome::PreconditionMissing(format!(
                        "libvirt is not reachable: {e}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let bindings = Self::plan(ctx).await?;
        info!(count = bindings.len(), "resource bindings planned");

        Self::shut_down(ctx, &names).await?;
        let reconciler = Reconciler::new(ctx.virt, (&ctx.config.reconcile).into());
        let reports = reconciler.reconcile_all(bindings).await;

        for name in &names {
            if !ctx.virt.run_state(name).await?.is_running() {
                ctx.virt.start(name).await?;
            }
        }

        match overall_outcome(&reports) {
            ReconcileOutcome::FullyConsistent => Ok(StepOutcome::Completed),
            ReconcileOutcome::LiveOnly => {
                let pending = reports
                    .iter()
                    .filter(|r| r.outcome == ReconcileOutcome::LiveOnly)
                    .count();
                warn!(pending, "some changes are live only and will not survive a VM restart");
                Ok(StepOutcome::Completed)
            }
            ReconcileOutcome::Failed => {
                let failed: Vec<String> = reports
                    .iter()
                    .filter(|r| r.outcome.is_failed())
                    .map(|r| r.binding.to_string())
                    .collect();
                anyhow::bail!(
                    "{} of {} resource bindings failed: {}",
                    failed.len(),
                    reports.len(),
                    failed.join("; ")
                )
            }
        }
    }
}
