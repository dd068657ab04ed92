//! Physical core selection for vCPU pinning.

use anyhow::Context;

use crate::command::{CommandRunner, SystemCommand};
use crate::config::CpuPinningConfig;

/// Cores available to each VM. The two lists never share a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorePartition {
    pub data_lake: Vec<u32>,
    pub data_analytics: Vec<u32>,
}

/// Even cores from `dl_offset` go to the data-lake VM, odd cores from
/// `da_offset` to the data-analytics VM. Cores below the offsets stay with
/// the host.
pub fn partition_cores(host_cpus: u32, pinning: &CpuPinningConfig) -> CorePartition {
    CorePartition {
        data_lake: (pinning.dl_offset..host_cpus).filter(|c| c % 2 == 0).collect(),
        data_analytics: (pinning.da_offset..host_cpus).filter(|c| c % 2 == 1).collect(),
    }
}

/// `(vcpu, core)` pairs; vCPU `i` takes `cores[i]`. vCPUs beyond the list are
/// left unpinned.
pub fn vcpu_pins(vm: &str, vcpus: u32, cores: &[u32]) -> Vec<(u32, u32)> {
    let pins: Vec<(u32, u32)> = (0..vcpus).zip(cores.iter().copied()).collect();
    if (pins.len() as u32) < vcpus {
        tracing::warn!(
            vm,
            vcpus,
            available = cores.len(),
            "not enough dedicated cores, {} vCPU(s) left unpinned",
            vcpus - pins.len() as u32
        );
    }
    pins
}

/// Number of online-capable CPUs on the host, from `nproc --all`.
pub async fn host_cpu_count(runner: &dyn CommandRunner) -> anyhow::Result<u32> {
    let out = runner
        .query_checked(&SystemCommand::new("nproc").arg("--all"))
        .await?;
    out.stdout
        .trim()
        .parse::<u32>()
        .with_context(|| format!("unexpected nproc output '{}'", out.stdout.trim()))
}
