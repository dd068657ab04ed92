//! Hypervisor control seam.
//!
//! [`VirtControl`] is what the reconciler and the VM-facing steps talk to.
//! [`VirshControl`] implements it with `virsh` through the injected
//! [`CommandRunner`], so mutations are simulated in dry-run mode while
//! queries still observe the real host.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use super::binding::DeviceSpec;
use super::domain::{DomainDevices, parse_domain_xml};
use crate::command::{CommandOutput, CommandRunner, SystemCommand};
use crate::errors::ReconcileError;
use crate::poll::{PollOutcome, poll_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// A live instance exists (running, paused, shutting down).
    Running,
    ShutOff,
}

impl RunState {
    /// Map `virsh domstate` output.
    pub fn from_domstate(vm: &str, raw: &str) -> Result<Self, ReconcileError> {
        match raw.trim() {
            "running" | "paused" | "idle" | "blocked" | "in shutdown" | "pmsuspended" => {
                Ok(RunState::Running)
            }
            "shut off" | "crashed" => Ok(RunState::ShutOff),
            other => Err(ReconcileError::UnknownRunState {
                vm: vm.to_string(),
                state: other.to_string(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Running => "running",
            RunState::ShutOff => "shut off",
        })
    }
}

/// Which definition of a VM to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition {
    Live,
    Persistent,
}

/// Which definitions a mutation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Live,
    Persistent,
    Both,
}

impl Scope {
    pub fn for_flags(live: bool, persistent: bool) -> Option<Scope> {
        match (live, persistent) {
            (true, true) => Some(Scope::Both),
            (true, false) => Some(Scope::Live),
            (false, true) => Some(Scope::Persistent),
            (false, false) => None,
        }
    }

    fn virsh_flags(&self) -> &'static [&'static str] {
        match self {
            Scope::Live => &["--live"],
            Scope::Persistent => &["--config"],
            Scope::Both => &["--live", "--config"],
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Live => "live",
            Scope::Persistent => "persistent",
            Scope::Both => "live+persistent",
        })
    }
}

#[async_trait]
pub trait VirtControl: Send + Sync {
    async fn run_state(&self, vm: &str) -> Result<RunState, ReconcileError>;

    async fn devices(&self, vm: &str, which: Definition) -> Result<DomainDevices, ReconcileError>;

    async fn attach(&self, vm: &str, device: &DeviceSpec, scope: Scope)
    -> Result<(), ReconcileError>;

    async fn detach(&self, vm: &str, device: &DeviceSpec, scope: Scope)
    -> Result<(), ReconcileError>;

    /// Request a graceful shutdown. Returns once the request is accepted.
    async fn shutdown(&self, vm: &str) -> Result<(), ReconcileError>;

    async fn start(&self, vm: &str) -> Result<(), ReconcileError>;

    /// True when mutations are only recorded, so state never changes.
    fn simulated(&self) -> bool {
        false
    }

    /// Wait for the VM to reach "shut off". A simulated shutdown never does,
    /// so there is nothing to wait for.
    async fn wait_for_shut_off(
        &self,
        vm: &str,
        interval: Duration,
        timeout: Duration,
    ) -> PollOutcome {
        if self.simulated() {
            return PollOutcome::Reached;
        }
        poll_until(interval, timeout, move || async move {
            Ok(self.run_state(vm).await? == RunState::ShutOff)
        })
        .await
    }

    async fn is_defined(&self, vm: &str) -> Result<bool, ReconcileError> {
        match self.run_state(vm).await {
            Ok(_) => Ok(true),
            Err(ReconcileError::VmNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub struct VirshControl<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> VirshControl<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    fn virsh<I, S>(args: I) -> SystemCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SystemCommand::new("virsh").args(args)
    }

    async fn query(&self, vm: &str, cmd: SystemCommand) -> Result<CommandOutput, ReconcileError> {
        let out = self.runner.query(&cmd).await?;
        if !out.success() && is_missing_domain(&out.stderr) {
            return Err(ReconcileError::VmNotFound(vm.to_string()));
        }
        Ok(out.into_success(&cmd)?)
    }

    async fn mutate(&self, cmd: SystemCommand) -> Result<(), ReconcileError> {
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

#[async_trait]
impl VirtControl for VirshControl<'_> {
    fn simulated(&self) -> bool {
        self.runner.simulate()
    }

    async fn run_state(&self, vm: &str) -> Result<RunState, ReconcileError> {
        let out = self.query(vm, Self::virsh(["domstate", vm])).await?;
        RunState::from_domstate(vm, &out.stdout)
    }

    async fn devices(&self, vm: &str, which: Definition) -> Result<DomainDevices, ReconcileError> {
        let mut cmd = Self::virsh(["dumpxml", vm]);
        if which == Definition::Persistent {
            cmd = cmd.arg("--inactive");
        }
        let out = self.query(vm, cmd).await?;
        parse_domain_xml(vm, &out.stdout)
    }

    async fn attach(
        &self,
        vm: &str,
        device: &DeviceSpec,
        scope: Scope,
    ) -> Result<(), ReconcileError> {
        let cmd = match device {
            DeviceSpec::Hostdev(addr) => Self::virsh(["attach-device", vm, "/dev/stdin"])
                .args(scope.virsh_flags().iter().copied())
                .stdin(addr.hostdev_xml()),
            DeviceSpec::VcpuPin { vcpu, cpu } => Self::virsh(["vcpupin", vm])
                .arg(vcpu.to_string())
                .arg(cpu.to_string())
                .args(scope.virsh_flags().iter().copied()),
            DeviceSpec::Disk { source, target } => {
                Self::virsh(["attach-disk", vm, source.as_str(), target.as_str()])
                    .args(["--targetbus", "virtio", "--sourcetype", "block"])
                    .args(scope.virsh_flags().iter().copied())
            }
        };
        self.mutate(cmd).await
    }

    async fn detach(
        &self,
        vm: &str,
        device: &DeviceSpec,
        scope: Scope,
    ) -> Result<(), ReconcileError> {
        let cmd = match device {
            DeviceSpec::Hostdev(addr) => Self::virsh(["detach-device", vm, "/dev/stdin"])
                .args(scope.virsh_flags().iter().copied())
                .stdin(addr.hostdev_xml()),
            // a pin cannot be removed, only replaced
            DeviceSpec::VcpuPin { .. } => return Ok(()),
            DeviceSpec::Disk { target, .. } => {
                Self::virsh(["detach-disk", vm, target.as_str()])
                    .args(scope.virsh_flags().iter().copied())
            }
        };
        self.mutate(cmd).await
    }

    async fn shutdown(&self, vm: &str) -> Result<(), ReconcileError> {
        self.mutate(Self::virsh(["shutdown", vm])).await
    }

    async fn start(&self, vm: &str) -> Result<(), ReconcileError> {
        self.mutate(Self::virsh(["start", vm])).await
    }
}
