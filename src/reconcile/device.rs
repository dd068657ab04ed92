//! Device identities: PCI addresses and block-device paths.

use regex::Regex;
use std::fmt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::errors::ReconcileError;

static PCI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{1,4}):)?([0-9a-fA-F]{1,2}):([0-9a-fA-F]{1,2})\.([0-7])$")
        .expect("static regex")
});

/// PCI address normalized to `domain:bus:slot.function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    /// Build from libvirt's hex attributes (`domain='0x0000' bus='0x3b' ...`).
    pub fn from_libvirt_attrs(
        domain: &str,
        bus: &str,
        slot: &str,
        function: &str,
    ) -> Result<Self, ReconcileError> {
        fn hex<T: TryFrom<u32>>(v: &str, whole: &str) -> Result<T, ReconcileError> {
            let digits = v.trim().trim_start_matches("0x").trim_start_matches("0X");
            u32::from_str_radix(digits, 16)
                .ok()
                .and_then(|n| T::try_from(n).ok())
                .ok_or_else(|| ReconcileError::InvalidPciAddress(whole.to_string()))
        }
        let whole = format!("{domain}:{bus}:{slot}.{function}");
        Ok(Self {
            domain: hex(domain, &whole)?,
            bus: hex(bus, &whole)?,
            slot: hex(slot, &whole)?,
            function: hex(function, &whole)?,
        })
    }

    /// The `<hostdev>` element libvirt expects for PCI passthrough.
    pub fn hostdev_xml(&self) -> String {
        format!(
            "<hostdev mode='subsystem' type='pci' managed='yes'>\n  <source>\n    \
             <address domain='0x{:04x}' bus='0x{:02x}' slot='0x{:02x}' function='0x{:x}'/>\n  \
             </source>\n</hostdev>\n",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = ReconcileError;

    /// Accepts `0000:3b:02.1`, `3b:02.1` and virsh nodedev names like
    /// `pci_0000_3b_02_1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let normalized = match trimmed.strip_prefix("pci_") {
            Some(rest) => {
                let parts: Vec<&str> = rest.split('_').collect();
                if parts.len() != 4 {
                    return Err(ReconcileError::InvalidPciAddress(s.to_string()));
                }
                format!("{}:{}:{}.{}", parts[0], parts[1], parts[2], parts[3])
            }
            None => trimmed.to_string(),
        };
        let caps = PCI_RE
            .captures(&normalized)
            .ok_or_else(|| ReconcileError::InvalidPciAddress(s.to_string()))?;
        let field = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("0");
        Self::from_libvirt_attrs(field(1), field(2), field(3), field(4))
            .map_err(|_| ReconcileError::InvalidPciAddress(s.to_string()))
    }
}

/// What we can learn about a device path from the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub literal: String,
    pub canonical: Option<PathBuf>,
    /// `(major, minor)` for block devices.
    pub numbers: Option<(u32, u32)>,
}

impl DeviceIdentity {
    pub fn probe(path: &str) -> Self {
        let canonical = Path::new(path).canonicalize().ok();
        let rdev = std::fs::metadata(path)
            .ok()
            .filter(|m| m.file_type().is_block_device())
            .map(|m| m.rdev());
        Self::from_stat(path, canonical, rdev)
    }

    /// `rdev` is the `st_rdev` of a block device, `None` for anything else.
    pub fn from_stat(literal: &str, canonical: Option<PathBuf>, rdev: Option<u64>) -> Self {
        // SAFETY: just parsing bits out of a dev_t.
        let numbers = rdev.map(|rdev| unsafe { (libc::major(rdev), libc::minor(rdev)) });
        Self {
            literal: literal.to_string(),
            canonical,
            numbers,
        }
    }

    /// Canonical path, then major:minor, then literal spelling.
    pub fn same_device(&self, other: &DeviceIdentity) -> bool {
        if let (Some(a), Some(b)) = (&self.canonical, &other.canonical)
            && a == b
        {
            return true;
        }
        if let (Some(a), Some(b)) = (self.numbers, other.numbers)
            && a == b
        {
            return true;
        }
        self.literal == other.literal
    }
}

/// Whether two spellings refer to the same block device, e.g.
/// `/dev/mapper/dlvg-dldata` and `/dev/dm-3`.
pub fn compare_device_paths(a: &str, b: &str) -> bool {
    compare_device_paths_with(a, b, DeviceIdentity::probe)
}

pub fn compare_device_paths_with(
    a: &str,
    b: &str,
    probe: impl Fn(&str) -> DeviceIdentity,
) -> bool {
    probe(a).same_device(&probe(b))
}
