use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::command::{CommandRunner, SystemCommand};
use crate::steps::StepId;

/// Steps whose success must be followed by a host restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootPolicy {
    steps: BTreeSet<StepId>,
}

impl RebootPolicy {
    pub fn new(steps: impl IntoIterator<Item = StepId>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    /// New kernel parameters only take effect after a restart.
    pub fn standard() -> Self {
        Self::new([StepId::KernelIommu])
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.steps.contains(&id)
    }

    pub fn should_reboot(&self, id: StepId, simulate: bool) -> bool {
        !simulate && self.contains(id)
    }
}

/// The host-restart primitive.
#[async_trait]
pub trait Rebooter: Send + Sync {
    async fn reboot(&self) -> anyhow::Result<()>;
}

pub struct SystemRebooter<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> SystemRebooter<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Rebooter for SystemRebooter<'_> {
    async fn reboot(&self) -> anyhow::Result<()> {
        self.runner
            .run_checked(&SystemCommand::new("systemctl").arg("reboot"))
            .await?;
        Ok(())
    }
}

/// Applies the policy and fires the rebooter at most once per process.
pub struct RebootCoordinator<'a> {
    policy: RebootPolicy,
    rebooter: &'a dyn Rebooter,
    fired: AtomicBool,
}

impl<'a> RebootCoordinator<'a> {
    pub fn new(policy: RebootPolicy, rebooter: &'a dyn Rebooter) -> Self {
        Self {
            policy,
            rebooter,
            fired: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RebootPolicy {
        &self.policy
    }

    pub fn should_reboot(&self, id: StepId, simulate: bool) -> bool {
        self.policy.should_reboot(id, simulate)
    }

    /// Returns `false` without calling the rebooter if a reboot was already issued.
    pub async fn trigger(&self) -> anyhow::Result<bool> {
        if self.fired.swap(true, Ordering::SeqCst) {
            warn!("reboot already requested, ignoring");
            return Ok(false);
        }
        self.rebooter.reboot().await?;
        Ok(true)
    }
}
