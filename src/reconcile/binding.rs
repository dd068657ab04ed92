use std::collections::BTreeSet;
use std::fmt;

use super::device::{PciAddress, compare_device_paths};
use super::domain::DomainDevices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    PciHostdev,
    VcpuPin,
    BlockDisk,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BindingKind::PciHostdev => "pci-hostdev",
            BindingKind::VcpuPin => "vcpu-pin",
            BindingKind::BlockDisk => "block-disk",
        })
    }
}

/// A concrete device the VM should (or should not) have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    Hostdev(PciAddress),
    VcpuPin { vcpu: u32, cpu: u32 },
    Disk { source: String, target: String },
}

impl DeviceSpec {
    pub fn kind(&self) -> BindingKind {
        match self {
            DeviceSpec::Hostdev(_) => BindingKind::PciHostdev,
            DeviceSpec::VcpuPin { .. } => BindingKind::VcpuPin,
            DeviceSpec::Disk { .. } => BindingKind::BlockDisk,
        }
    }

    /// Whether `devices` already contains exactly this device.
    pub fn present_in(&self, devices: &DomainDevices) -> bool {
        match self {
            DeviceSpec::Hostdev(addr) => devices.hostdevs.contains(addr),
            DeviceSpec::VcpuPin { vcpu, cpu } => devices
                .vcpu_pins
                .get(vcpu)
                .is_some_and(|set| set.len() == 1 && set.contains(cpu)),
            DeviceSpec::Disk { source, target } => devices.disks.iter().any(|d| {
                d.target == *target
                    && d.source
                        .as_deref()
                        .is_some_and(|s| compare_device_paths(s, source))
            }),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Hostdev(addr) => write!(f, "hostdev {addr}"),
            DeviceSpec::VcpuPin { vcpu, cpu } => write!(f, "vcpu {vcpu} -> cpu {cpu}"),
            DeviceSpec::Disk { source, target } => write!(f, "disk {source} as {target}"),
        }
    }
}

/// One VM/device pairing being reconciled, with its verification flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmResourceBinding {
    pub vm_name: String,
    pub target: DeviceSpec,
    /// Hostdevs that occupy the same role and must make way for `target`.
    pub replaces: Vec<PciAddress>,
    pub live_verified: bool,
    pub config_verified: bool,
}

impl VmResourceBinding {
    pub fn new(vm_name: impl Into<String>, target: DeviceSpec) -> Self {
        Self {
            vm_name: vm_name.into(),
            target,
            replaces: Vec::new(),
            live_verified: false,
            config_verified: false,
        }
    }

    pub fn hostdev(vm_name: impl Into<String>, addr: PciAddress) -> Self {
        Self::new(vm_name, DeviceSpec::Hostdev(addr))
    }

    pub fn vcpu_pin(vm_name: impl Into<String>, vcpu: u32, cpu: u32) -> Self {
        Self::new(vm_name, DeviceSpec::VcpuPin { vcpu, cpu })
    }

    pub fn disk(
        vm_name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(
            vm_name,
            DeviceSpec::Disk {
                source: source.into(),
                target: target.into(),
            },
        )
    }

    /// Treat these hostdevs (other than the target) as conflicting.
    pub fn replacing(mut self, peers: impl IntoIterator<Item = PciAddress>) -> Self {
        let own = match &self.target {
            DeviceSpec::Hostdev(addr) => Some(*addr),
            _ => None,
        };
        let set: BTreeSet<PciAddress> = peers.into_iter().filter(|p| Some(*p) != own).collect();
        self.replaces = set.into_iter().collect();
        self
    }

    pub fn kind(&self) -> BindingKind {
        self.target.kind()
    }

    pub fn verified(&self) -> bool {
        self.live_verified && self.config_verified
    }

    /// Devices in `devices` sitting where the target should be.
    ///
    /// vCPU pins never conflict: re-pinning overwrites the previous cpuset.
    pub fn conflicts_in(&self, devices: &DomainDevices) -> Vec<DeviceSpec> {
        match &self.target {
            DeviceSpec::Hostdev(_) => devices
                .hostdevs
                .iter()
                .filter(|addr| self.replaces.contains(addr))
                .map(|addr| DeviceSpec::Hostdev(*addr))
                .collect(),
            DeviceSpec::VcpuPin { .. } => Vec::new(),
            DeviceSpec::Disk { source, target } => devices
                .disks
                .iter()
                .filter(|d| d.target == *target)
                .filter(|d| {
                    !d.source
                        .as_deref()
                        .is_some_and(|s| compare_device_paths(s, source))
                })
                .map(|d| DeviceSpec::Disk {
                    source: d.source.clone().unwrap_or_default(),
                    target: d.target.clone(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for VmResourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.vm_name, self.target)
    }
}
