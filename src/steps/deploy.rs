//! Image download, VM definition and the operator CLI.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{StepContext, StepHandler, StepOutcome, require};
use crate::command::SystemCommand;
use crate::config::{InstallConfig, VmConfig};

const CLI_PATH: &str = "/usr/local/bin/lakectl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmRole {
    DataLake,
    DataAnalytics,
}

impl VmRole {
    pub const BOTH: [VmRole; 2] = [VmRole::DataLake, VmRole::DataAnalytics];

    pub fn vm<'c>(&self, config: &'c InstallConfig) -> &'c VmConfig {
        match self {
            VmRole::DataLake => &config.dl,
            VmRole::DataAnalytics => &config.da,
        }
    }

    fn image_stem(&self) -> &'static str {
        match self {
            VmRole::DataLake => "datalake",
            VmRole::DataAnalytics => "analytics",
        }
    }

    pub fn image_file(&self, version: &str) -> String {
        format!("{}-{version}.qcow2", self.image_stem())
    }

    pub fn image_path(&self, config: &InstallConfig, version: &str) -> PathBuf {
        config.image_dir.join(self.image_file(version))
    }
}

fn download_url(base: &str, version: &str, file: &str) -> String {
    format!("{}/{version}/{file}", base.trim_end_matches('/'))
}

/// `curl` into `<dest>.part`, then move into place.
fn fetch(
    url: &str,
    dest: &Path,
    credentials: Option<(&str, &str)>,
) -> (SystemCommand, SystemCommand) {
    let part = format!("{}.part", dest.display());
    let mut curl = SystemCommand::new("curl").args(["-fSL", "--retry", "3"]);
    if let Some((user, password)) = credentials {
        curl = curl.arg("-u").secret_arg(format!("{user}:{password}"), password);
    }
    let curl = curl.args(["-o", part.as_str(), url]);
    let dest = dest.display().to_string();
    let mv = SystemCommand::new("mv").args([part.as_str(), dest.as_str()]);
    (curl, mv)
}

pub struct DownloadImages;

#[async_trait]
impl StepHandler for DownloadImages {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let version = require!(
            ctx.config.version.as_deref(),
            "no software version configured (config set version <x.y.z>)"
        );
        let credentials = require!(
            ctx.config.credentials(),
            "download credentials missing (config set download_user / download_password)"
        );

        let dir = ctx.config.image_dir.display().to_string();
        ctx.runner
            .run_checked(&SystemCommand::new("mkdir").args(["-p", dir.as_str()]))
            .await?;

        for role in VmRole::BOTH {
            let dest = role.image_path(ctx.config, version);
            if dest.exists() {
                info!(image = %dest.display(), "image already downloaded");
                continue;
            }
            let url = download_url(&ctx.config.download_url, version, &role.image_file(version));
            let (curl, mv) = fetch(&url, &dest, Some(credentials));
            ctx.runner.run_checked(&curl).await?;
            ctx.runner.run_checked(&mv).await?;
            info!(image = %dest.display(), "image downloaded");
        }
        Ok(StepOutcome::Completed)
    }
}

pub struct DeployVm {
    role: VmRole,
}

impl DeployVm {
    pub fn data_lake() -> Self {
        Self {
            role: VmRole::DataLake,
        }
    }

    pub fn data_analytics() -> Self {
        Self {
            role: VmRole::DataAnalytics,
        }
    }

    fn virt_install(vm: &VmConfig, image: &Path) -> SystemCommand {
        SystemCommand::new("virt-install")
            .args(["--name", vm.name.as_str()])
            .arg("--memory")
            .arg((u64::from(vm.memory_gb) * 1024).to_string())
            .arg("--vcpus")
            .arg(vm.vcpus.to_string())
            .arg("--disk")
            .arg(format!("path={},format=qcow2,bus=virtio", image.display()))
            .args([
                "--import",
                "--os-variant",
                "generic",
                "--network",
                "network=default,model=virtio",
                "--graphics",
                "none",
                "--noautoconsole",
            ])
    }
}

#[async_trait]
impl StepHandler for DeployVm {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let version = require!(
            ctx.config.version.as_deref(),
            "no software version configured (config set version <x.y.z>)"
        );
        let vm = self.role.vm(ctx.config);
        let image = self.role.image_path(ctx.config, version);
        require!(
            image.exists().then_some(()),
            "image {} not found, run download_images first",
            image.display()
        );

        if ctx.virt.is_defined(&vm.name).await? {
            info!(vm = %vm.name, "VM already defined");
            return Ok(StepOutcome::Completed);
        }

        let image_arg = image.display().to_string();
        ctx.runner
            .run_checked(
                &SystemCommand::new("qemu-img")
                    .args(["resize", image_arg.as_str()])
                    .arg(format!("{}G", vm.disk_gb)),
            )
            .await?;
        ctx.runner.run_checked(&Self::virt_install(vm, &image)).await?;
        ctx.runner
            .run_checked(&SystemCommand::new("virsh").args(["autostart", vm.name.as_str()]))
            .await?;
        info!(vm = %vm.name, vcpus = vm.vcpus, memory_gb = vm.memory_gb, "VM deployed");
        Ok(StepOutcome::Completed)
    }
}

pub struct InstallCli;

#[async_trait]
impl StepHandler for InstallCli {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
        let channel = ctx.config.version.as_deref().unwrap_or("latest");
        let url = download_url(&ctx.config.download_url, channel, "lakectl");
        let staged = std::env::temp_dir().join("lakectl");
        let (curl, mv) = fetch(&url, &staged, ctx.config.credentials());
        ctx.runner.run_checked(&curl).await?;
        ctx.runner.run_checked(&mv).await?;

        let staged = staged.display().to_string();
        ctx.runner
            .run_checked(
                &SystemCommand::new("install").args(["-m", "0755", staged.as_str(), CLI_PATH]),
            )
            .await?;
        info!(path = CLI_PATH, "operator CLI installed");
        Ok(StepOutcome::Completed)
    }
}
