//! In-memory [`VirtControl`] with injectable failures.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::binding::DeviceSpec;
use super::domain::{DiskEntry, DomainDevices};
use super::virt::{Definition, RunState, Scope, VirtControl};
use crate::errors::{InstallError, ReconcileError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeDomain {
    pub running: bool,
    pub live: DomainDevices,
    pub persistent: DomainDevices,
}

impl FakeDomain {
    pub fn new(running: bool) -> Self {
        Self {
            running,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct FakeVirt {
    domains: Mutex<BTreeMap<String, FakeDomain>>,
    persistent_writes_fail: AtomicBool,
    ignore_shutdown: AtomicBool,
    hidden_persistent_reads: AtomicU32,
    persistent_reads: AtomicU32,
    mutations: Mutex<Vec<String>>,
}

fn refused(message: impl Into<String>) -> ReconcileError {
    ReconcileError::Command(InstallError::CommandFailed {
        command: "virsh".to_string(),
        code: 1,
        stderr: message.into(),
    })
}

fn add(devices: &mut DomainDevices, device: &DeviceSpec) -> Result<(), ReconcileError> {
    match device {
        DeviceSpec::Hostdev(addr) => {
            if devices.hostdevs.contains(addr) {
                return Err(refused(format!("device {addr} is already in use")));
            }
            devices.hostdevs.push(*addr);
        }
        DeviceSpec::VcpuPin { vcpu, cpu } => {
            devices.vcpu_pins.insert(*vcpu, [*cpu].into());
        }
        DeviceSpec::Disk { source, target } => {
            if devices.disks.iter().any(|d| d.target == *target) {
                return Err(refused(format!("target {target} already exists")));
            }
            devices.disks.push(DiskEntry {
                target: target.clone(),
                source: Some(source.clone()),
            });
        }
    }
    Ok(())
}

fn remove(devices: &mut DomainDevices, device: &DeviceSpec) {
    match device {
        DeviceSpec::Hostdev(addr) => devices.hostdevs.retain(|a| a != addr),
        DeviceSpec::VcpuPin { .. } => {}
        DeviceSpec::Disk { target, .. } => devices.disks.retain(|d| d.target != *target),
    }
}

impl FakeVirt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(self, name: &str, domain: FakeDomain) -> Self {
        self.domains
            .lock()
            .unwrap()
            .insert(name.to_string(), domain);
        self
    }

    /// Every persistent-scope attach or detach fails from now on.
    pub fn fail_persistent_writes(&self) {
        self.persistent_writes_fail.store(true, Ordering::SeqCst);
    }

    /// Shutdown requests are accepted but the VM keeps running.
    pub fn ignore_shutdown(&self) {
        self.ignore_shutdown.store(true, Ordering::SeqCst);
    }

    /// The next `n` persistent reads return an empty definition.
    pub fn hide_persistent_reads(&self, n: u32) {
        self.hidden_persistent_reads.store(n, Ordering::SeqCst);
    }

    pub fn persistent_reads(&self) -> u32 {
        self.persistent_reads.load(Ordering::SeqCst)
    }

    pub fn domain(&self, name: &str) -> FakeDomain {
        self.domains
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Attempted mutations in order, failed ones included.
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.mutations.lock().unwrap().push(entry);
    }

    fn with_vm<T>(
        &self,
        vm: &str,
        f: impl FnOnce(&mut FakeDomain) -> Result<T, ReconcileError>,
    ) -> Result<T, ReconcileError> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(vm)
            .ok_or_else(|| ReconcileError::VmNotFound(vm.to_string()))?;
        f(domain)
    }

    fn check_scope(&self, domain: &FakeDomain, scope: Scope) -> Result<(), ReconcileError> {
        if scope != Scope::Persistent && !domain.running {
            return Err(refused("domain is not running"));
        }
        if scope != Scope::Live && self.persistent_writes_fail.load(Ordering::SeqCst) {
            return Err(refused("failed to save persistent definition"));
        }
        Ok(())
    }
}

#[async_trait]
impl VirtControl for FakeVirt {
    async fn run_state(&self, vm: &str) -> Result<RunState, ReconcileError> {
        self.with_vm(vm, |d| {
            Ok(if d.running {
                RunState::Running
            } else {
                RunState::ShutOff
            })
        })
    }

    async fn devices(&self, vm: &str, which: Definition) -> Result<DomainDevices, ReconcileError> {
        let devices = self.with_vm(vm, |d| {
            Ok(match which {
                Definition::Live if d.running => d.live.clone(),
                Definition::Live | Definition::Persistent => d.persistent.clone(),
            })
        })?;
        if which == Definition::Persistent {
            self.persistent_reads.fetch_add(1, Ordering::SeqCst);
            let hidden = self
                .hidden_persistent_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if hidden {
                return Ok(DomainDevices::default());
            }
        }
        Ok(devices)
    }

    async fn attach(
        &self,
        vm: &str,
        device: &DeviceSpec,
        scope: Scope,
    ) -> Result<(), ReconcileError> {
        self.record(format!("attach {scope} {device}"));
        self.with_vm(vm, |d| {
            self.check_scope(d, scope)?;
            let mut live = d.live.clone();
            let mut persistent = d.persistent.clone();
            if scope != Scope::Persistent {
                add(&mut live, device)?;
            }
            if scope != Scope::Live {
                add(&mut persistent, device)?;
            }
            d.live = live;
            d.persistent = persistent;
            Ok(())
        })
    }

    async fn detach(
        &self,
        vm: &str,
        device: &DeviceSpec,
        scope: Scope,
    ) -> Result<(), ReconcileError> {
        self.record(format!("detach {scope} {device}"));
        self.with_vm(vm, |d| {
            self.check_scope(d, scope)?;
            if scope != Scope::Persistent {
                remove(&mut d.live, device);
            }
            if scope != Scope::Live {
                remove(&mut d.persistent, device);
            }
            Ok(())
        })
    }

    async fn shutdown(&self, vm: &str) -> Result<(), ReconcileError> {
        self.record(format!("shutdown {vm}"));
        let ignore = self.ignore_shutdown.load(Ordering::SeqCst);
        self.with_vm(vm, |d| {
            if !ignore {
                d.running = false;
                d.live = d.persistent.clone();
            }
            Ok(())
        })
    }

    async fn start(&self, vm: &str) -> Result<(), ReconcileError> {
        self.record(format!("start {vm}"));
        self.with_vm(vm, |d| {
            if d.running {
                return Err(refused("domain is already active"));
            }
            d.running = true;
            d.live = d.persistent.clone();
            Ok(())
        })
    }
}
