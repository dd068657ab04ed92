use async_trait::async_trait;
use tracing::{info, warn};

use super::{StepContext, StepHandler, StepOutcome, require};
use crate::command::SystemCommand;
use crate::reconcile::vf::{VfAssignment, discover_vfs};

pub struct SriovVfs;

impl SriovVfs {
    fn numvfs_path(iface: &str) -> String {
        format!("/sys/class/net/{iface}/device/sriov_numvfs")
    }
}

#[async_trait]
impl StepHandler for SriovVfs {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let iface = require!(
            ctx.config.sriov_interface.as_deref(),
            "no SR-IOV interface configured (config set sriov_interface <name>)"
        );
        let count = ctx.config.sriov_vf_count;
        let path = Self::numvfs_path(iface);

        // the kernel refuses to change a non-zero VF count directly
        ctx.runner
            .run_checked(&SystemCommand::shell(format!(
                "echo 0 > {path} && echo {count} > {path}"
            )))
            .await?;
        ctx.runner
            .run_checked(&SystemCommand::new("ip").args(["link", "set", "dev", iface, "up"]))
            .await?;

        let vfs = discover_vfs(ctx.runner).await?;
        if vfs.len() < 2 {
            warn!(
                found = vfs.len(),
                "fewer than two virtual functions visible, VF assignment deferred"
            );
            return Ok(StepOutcome::Completed);
        }

        let assignment = VfAssignment::positional(&vfs);
        let dl = assignment.data_lake.map(|a| a.to_string());
        let da = assignment.data_analytics.map(|a| a.to_string());
        let changed = ctx.config.dl.vf_pci != dl || ctx.config.da.vf_pci != da;
        if changed && ctx.runner.simulate() {
            info!(
                config = %ctx.store.path().display(),
                "[dry-run] would persist the VF assignment"
            );
        } else if changed {
            ctx.store.update(|config| {
                config.dl.vf_pci = dl.clone();
                config.da.vf_pci = da.clone();
                Ok(())
            })?;
        }
        info!(
            data_lake = dl.as_deref().unwrap_or("-"),
            data_analytics = da.as_deref().unwrap_or("-"),
            "virtual functions assigned"
        );
        Ok(StepOutcome::Completed)
    }
}
