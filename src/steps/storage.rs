//! LVM volume for the data lake and the libvirt default network.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{StepContext, StepHandler, StepOutcome, require};
use crate::command::{CommandRunner, SystemCommand};
use crate::config::InstallConfig;

/// Block device path of the data-lake logical volume.
pub fn data_volume_path(config: &InstallConfig) -> String {
    format!("/dev/{}/{}", config.volume_group, config.data_volume)
}

/// A probe that could not run counts as "absent".
async fn probe(runner: &dyn CommandRunner, cmd: SystemCommand) -> bool {
    match runner.query(&cmd).await {
        Ok(out) => out.success(),
        Err(e) => {
            debug!("probe `{cmd}` failed: {e}");
            false
        }
    }
}

pub struct Storage;

#[async_trait]
impl StepHandler for Storage {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let disks = require!(
            Some(&ctx.config.data_disks).filter(|d| !d.is_empty()),
            "no data disks selected (config set data_disks /dev/sdb,/dev/sdc)"
        );
        let vg = ctx.config.volume_group.as_str();
        let lv = ctx.config.data_volume.as_str();

        let vg_exists = probe(
            ctx.runner,
            SystemCommand::new("vgs").args(["--noheadings", "-o", "vg_name", vg]),
        )
        .await;
        if vg_exists {
            info!(vg, "volume group already present");
        } else {
            ctx.runner
                .run_checked(&SystemCommand::new("pvcreate").arg("-y").args(disks.iter().cloned()))
                .await?;
            ctx.runner
                .run_checked(&SystemCommand::new("vgcreate").arg(vg).args(disks.iter().cloned()))
                .await?;
        }

        let lv_exists = probe(
            ctx.runner,
            SystemCommand::new("lvs").arg(format!("{vg}/{lv}")),
        )
        .await;
        if lv_exists {
            info!(volume = %data_volume_path(ctx.config), "logical volume already present");
        } else {
            ctx.runner
                .run_checked(
                    &SystemCommand::new("lvcreate")
                        .args(["-y", "-n", lv, "-l", "100%FREE", vg]),
                )
                .await?;
        }
        Ok(StepOutcome::Completed)
    }
}

pub struct LibvirtNetwork;

#[async_trait]
impl StepHandler for LibvirtNetwork {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        ctx.runner
            .run_checked(&SystemCommand::new("virsh").args(["net-autostart", "default"]))
            .await?;
        let start = SystemCommand::new("virsh").args(["net-start", "default"]);
        let out = ctx.runner.run(&start).await?;
        if !out.success() && !out.stderr.contains("already active") {
            out.into_success(&start)?;
        }
        Ok(StepOutcome::Completed)
    }
}
