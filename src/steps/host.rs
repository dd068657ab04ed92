//! Host preparation: naming, virtualization packages, IOMMU.

use async_trait::async_trait;
use tracing::info;

use super::{StepContext, StepHandler, StepOutcome, require};
use crate::command::SystemCommand;

pub const KVM_PACKAGES: &[&str] = &[
    "qemu-kvm",
    "libvirt-daemon-system",
    "libvirt-clients",
    "virtinst",
    "bridge-utils",
    "pciutils",
    "lvm2",
    "curl",
];

const GRUB_DEFAULTS: &str = "/etc/default/grub";

pub struct HostNetwork;

#[async_trait]
impl StepHandler for HostNetwork {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let iface = require!(
            ctx.config.mgmt_interface.as_deref(),
            "no management interface configured (config set mgmt_interface <name>)"
        );

        if let Some(hostname) = ctx.config.hostname.as_deref() {
            ctx.runner
                .run_checked(&SystemCommand::new("hostnamectl").args(["set-hostname", hostname]))
                .await?;
        }
        ctx.runner
            .run_checked(&SystemCommand::new("ip").args(["link", "set", "dev", iface, "up"]))
            .await?;
        info!(interface = iface, "management interface up");
        Ok(StepOutcome::Completed)
    }
}

pub struct KvmInstall;

#[async_trait]
impl StepHandler for KvmInstall {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        fn apt(args: &[&str]) -> SystemCommand {
            SystemCommand::new("apt-get")
                .args(args.iter().copied())
                .env("DEBIAN_FRONTEND", "noninteractive")
        }
        ctx.runner.run_checked(&apt(&["update"])).await?;
        ctx.runner
            .run_checked(&apt(&["install", "-y"]).args(KVM_PACKAGES.iter().copied()))
            .await?;
        ctx.runner
            .run_checked(&SystemCommand::new("systemctl").args(["enable", "--now", "libvirtd"]))
            .await?;
        Ok(StepOutcome::Completed)
    }
}

pub struct KernelIommu;

impl KernelIommu {
    /// Kernel parameters for the CPU vendor reported in `/proc/cpuinfo`.
    fn parameters(cpu_flag: &str) -> &'static str {
        if cpu_flag.trim() == "svm" {
            "amd_iommu=on iommu=pt"
        } else {
            "intel_iommu=on iommu=pt"
        }
    }

    fn grub_edit(params: &str) -> String {
        let marker = params.split_whitespace().next().unwrap_or(params);
        format!(
            "grep -q '{marker}' {GRUB_DEFAULTS} || sed -i \
             's/^GRUB_CMDLINE_LINUX_DEFAULT=\"\\(.*\\)\"/GRUB_CMDLINE_LINUX_DEFAULT=\"\\1 {params}\"/' \
             {GRUB_DEFAULTS}"
        )
    }
}

#[async_trait]
impl StepHandler for KernelIommu {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let probe = SystemCommand::new("grep")
            .args(["-m1", "-o", "-w", "-E", "vmx|svm", "/proc/cpuinfo"]);
        let flag = match ctx.runner.query(&probe).await {
            Ok(out) => out.stdout,
            Err(e) => {
                tracing::warn!("could not read CPU flags, assuming Intel: {e}");
                String::new()
            }
        };
        let params = Self::parameters(&flag);
        ctx.runner
            .run_checked(&SystemCommand::shell(Self::grub_edit(params)))
            .await?;
        ctx.runner.run_checked(&SystemCommand::new("update-grub")).await?;
        info!(params, "IOMMU enabled on next boot");
        Ok(StepOutcome::Completed)
    }
}
