//! SR-IOV virtual function discovery and assignment.

use crate::command::{CommandRunner, SystemCommand};
use crate::config::InstallConfig;

use super::device::PciAddress;

/// PCI addresses of Ethernet virtual functions in `lspci -Dnn` output, in
/// listing order.
pub fn parse_vf_listing(lspci: &str) -> Vec<PciAddress> {
    lspci
        .lines()
        .filter(|line| line.contains("Ethernet controller") && line.contains("Virtual Function"))
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|addr| match addr.parse::<PciAddress>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::debug!("skipping lspci line: {e}");
                None
            }
        })
        .collect()
}

pub async fn discover_vfs(runner: &dyn CommandRunner) -> anyhow::Result<Vec<PciAddress>> {
    let out = runner
        .query_checked(&SystemCommand::new("lspci").arg("-Dnn"))
        .await?;
    let mut vfs = parse_vf_listing(&out.stdout);
    vfs.sort();
    Ok(vfs)
}

/// Which VF each VM gets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfAssignment {
    pub data_lake: Option<PciAddress>,
    pub data_analytics: Option<PciAddress>,
    /// Every VF known at assignment time.
    pub all: Vec<PciAddress>,
}

impl VfAssignment {
    /// First VF to the data-lake VM, second to the data-analytics VM.
    pub fn positional(vfs: &[PciAddress]) -> Self {
        Self {
            data_lake: vfs.first().copied(),
            data_analytics: vfs.get(1).copied(),
            all: vfs.to_vec(),
        }
    }

    /// Persisted addresses win; positions fill in what is missing, from the
    /// VFs neither VM has claimed.
    pub fn resolve(config: &InstallConfig, discovered: &[PciAddress]) -> Self {
        let persisted = |raw: &Option<String>, which: &str| {
            raw.as_deref()
                .and_then(|s| match s.parse::<PciAddress>() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        tracing::warn!("ignoring persisted {which} VF: {e}");
                        None
                    }
                })
        };
        let dl_persisted = persisted(&config.dl.vf_pci, "data-lake");
        let mut da_persisted = persisted(&config.da.vf_pci, "data-analytics");
        if da_persisted.is_some() && da_persisted == dl_persisted {
            tracing::warn!("both VMs persist the same VF, reassigning the data-analytics VF");
            da_persisted = None;
        }

        let mut free = discovered
            .iter()
            .copied()
            .filter(|vf| Some(*vf) != dl_persisted && Some(*vf) != da_persisted);
        let data_lake = dl_persisted.or_else(|| free.next());
        let data_analytics = da_persisted.or_else(|| free.next());

        let mut all = discovered.to_vec();
        all.extend(data_lake.iter().chain(data_analytics.iter()).copied());
        all.sort();
        all.dedup();

        Self {
            data_lake,
            data_analytics,
            all,
        }
    }
}
