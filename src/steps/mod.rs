//! Installation steps and their registry.
//!
//! Step ids are a closed enum with stable string names; the names are what
//! the state file stores, so they must never be reused for a different step.
//! Each id maps to its handler through an exhaustive `match`, so adding a
//! variant without a handler does not compile.

mod attach;
mod deploy;
mod host;
mod sriov;
mod storage;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::command::CommandRunner;
use crate::config::{ConfigStore, InstallConfig};
use crate::errors::InstallError;
use crate::reconcile::VirtControl;

/// Stable identifiers of the installation steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepId {
    HostNetwork,
    KvmInstall,
    KernelIommu,
    SriovVfs,
    Storage,
    LibvirtNetwork,
    DownloadImages,
    DeployDl,
    DeployDa,
    AttachResources,
    InstallCli,
}

impl StepId {
    pub const ALL: [StepId; 11] = [
        StepId::HostNetwork,
        StepId::KvmInstall,
        StepId::KernelIommu,
        StepId::SriovVfs,
        StepId::Storage,
        StepId::LibvirtNetwork,
        StepId::DownloadImages,
        StepId::DeployDl,
        StepId::DeployDa,
        StepId::AttachResources,
        StepId::InstallCli,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::HostNetwork => "host_network",
            StepId::KvmInstall => "kvm_install",
            StepId::KernelIommu => "kernel_iommu",
            StepId::SriovVfs => "sriov_vfs",
            StepId::Storage => "storage",
            StepId::LibvirtNetwork => "libvirt_network",
            StepId::DownloadImages => "download_images",
            StepId::DeployDl => "deploy_dl",
            StepId::DeployDa => "deploy_da",
            StepId::AttachResources => "attach_resources",
            StepId::InstallCli => "install_cli",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StepId::HostNetwork => "Configure host name and management interface",
            StepId::KvmInstall => "Install KVM and libvirt packages",
            StepId::KernelIommu => "Enable IOMMU kernel parameters",
            StepId::SriovVfs => "Create SR-IOV virtual functions",
            StepId::Storage => "Prepare LVM storage for the data lake",
            StepId::LibvirtNetwork => "Enable libvirt default network",
            StepId::DownloadImages => "Download VM images",
            StepId::DeployDl => "Deploy data-lake VM",
            StepId::DeployDa => "Deploy data-analytics VM",
            StepId::AttachResources => "Attach VFs, pin vCPUs and attach data disk",
            StepId::InstallCli => "Install operator CLI tool",
        }
    }

    fn handler(&self) -> Arc<dyn StepHandler> {
        match self {
            StepId::HostNetwork => Arc::new(host::HostNetwork),
            StepId::KvmInstall => Arc::new(host::KvmInstall),
            StepId::KernelIommu => Arc::new(host::KernelIommu),
            StepId::SriovVfs => Arc::new(sriov::SriovVfs),
            StepId::Storage => Arc::new(storage::Storage),
            StepId::LibvirtNetwork => Arc::new(storage::LibvirtNetwork),
            StepId::DownloadImages => Arc::new(deploy::DownloadImages),
            StepId::DeployDl => Arc::new(deploy::DeployVm::data_lake()),
            StepId::DeployDa => Arc::new(deploy::DeployVm::data_analytics()),
            StepId::AttachResources => Arc::new(attach::AttachResources),
            StepId::InstallCli => Arc::new(deploy::InstallCli),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepId::ALL
            .into_iter()
            .find(|id| id.as_str() == s.trim())
            .ok_or_else(|| InstallError::UnknownStep(s.to_string()))
    }
}

/// What a handler reports when it returns normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Required configuration is absent; the step made no changes.
    PreconditionMissing(String),
}

/// Everything a handler may touch. Handlers read the config snapshot and
/// perform every mutation through `runner` (or `virt`, which wraps it).
pub struct StepContext<'a> {
    pub config: &'a InstallConfig,
    pub store: &'a ConfigStore,
    pub runner: &'a dyn CommandRunner,
    pub virt: &'a dyn VirtControl,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome>;
}

/// A registered step.
#[derive(Clone)]
pub struct Step {
    pub id: StepId,
    /// 1-based position in the registry.
    pub ordinal: usize,
    pub display_name: String,
    handler: Arc<dyn StepHandler>,
}

impl Step {
    pub fn handler(&self) -> &dyn StepHandler {
        self.handler.as_ref()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("ordinal", &self.ordinal)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Ordered list of steps.
pub struct StepRegistry {
    steps: Vec<Step>,
}

impl StepRegistry {
    /// All installer steps bound to their real handlers.
    pub fn standard() -> Self {
        let steps = StepId::ALL
            .iter()
            .enumerate()
            .map(|(i, id)| Step {
                id: *id,
                ordinal: i + 1,
                display_name: id.display_name().to_string(),
                handler: id.handler(),
            })
            .collect();
        Self { steps }
    }

    /// Build a registry from explicit bindings, rejecting duplicate ids.
    pub fn from_handlers(
        entries: Vec<(StepId, Arc<dyn StepHandler>)>,
    ) -> Result<Self, InstallError> {
        let mut steps: Vec<Step> = Vec::with_capacity(entries.len());
        for (i, (id, handler)) in entries.into_iter().enumerate() {
            if steps.iter().any(|s| s.id == id) {
                return Err(InstallError::InvalidValue {
                    key: id.as_str().to_string(),
                    message: "step registered twice".to_string(),
                });
            }
            steps.push(Step {
                id,
                ordinal: i + 1,
                display_name: id.display_name().to_string(),
                handler,
            });
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn position(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Index of the step after `last_completed`, or `len()` when all are done.
    /// An empty, unparseable, or unregistered id restarts from the first step.
    pub fn next_index(&self, last_completed: Option<&str>) -> usize {
        let Some(raw) = last_completed else {
            return 0;
        };
        match raw.parse::<StepId>().ok().and_then(|id| self.position(id)) {
            Some(pos) => pos + 1,
            None => {
                tracing::warn!(step = raw, "unrecognized step in state file, restarting");
                0
            }
        }
    }
}

/// Early-return helper: `require!(opt, "message")` yields the value or
/// returns `StepOutcome::PreconditionMissing`.
macro_rules! require {
    ($value:expr, $($msg:tt)+) => {
        match $value {
            Some(v) => v,
            None => {
                return Ok($crate::steps::StepOutcome::PreconditionMissing(format!($($msg)+)));
            }
        }
    };
}
pub(crate) use require;
