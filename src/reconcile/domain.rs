//! The slice of libvirt domain XML the reconciler reasons about.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::device::PciAddress;
use crate::errors::ReconcileError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskEntry {
    /// Guest device name, e.g. `vdb`.
    pub target: String,
    /// Host path from `<source dev=...>` or `<source file=...>`.
    pub source: Option<String>,
}

/// Devices and pins found in one domain definition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainDevices {
    pub hostdevs: Vec<PciAddress>,
    pub disks: Vec<DiskEntry>,
    pub vcpu_pins: BTreeMap<u32, BTreeSet<u32>>,
}

fn attributes(vm: &str, e: &BytesStart<'_>) -> Result<HashMap<String, String>, ReconcileError> {
    let bad = |message: String| ReconcileError::DomainXml {
        vm: vm.to_string(),
        message,
    };
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| bad(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| bad(e.to_string()))?;
        out.insert(key, value.to_string());
    }
    Ok(out)
}

/// Parse `virsh dumpxml` output.
///
/// Only the host-side `<address>` inside a hostdev's `<source>` is read; the
/// guest-side `<address>` sibling is ignored.
pub fn parse_domain_xml(vm: &str, xml: &str) -> Result<DomainDevices, ReconcileError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut devices = DomainDevices::default();
    let mut stack: Vec<String> = Vec::new();
    let mut disk: Option<DiskEntry> = None;
    let mut in_pci_hostdev = false;

    loop {
        let event = reader.read_event().map_err(|e| ReconcileError::DomainXml {
            vm: vm.to_string(),
            message: format!("at byte {}: {e}", reader.buffer_position()),
        })?;
        let (start, empty) = match &event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            Event::End(_) => {
                if let Some(name) = stack.pop() {
                    close(&name, &mut devices, &mut disk, &mut in_pci_hostdev);
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };
        let Some(e) = start else { continue };
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let parent = stack.last().map(String::as_str);
        let grandparent = stack.len().checked_sub(2).map(|i| stack[i].as_str());

        match (name.as_str(), parent) {
            ("disk", Some("devices")) => disk = Some(DiskEntry::default()),
            ("source", Some("disk")) => {
                let attrs = attributes(vm, e)?;
                if let Some(entry) = disk.as_mut() {
                    entry.source = ["dev", "file", "volume", "name"]
                        .iter()
                        .find_map(|k| attrs.get(*k).cloned());
                }
            }
            ("target", Some("disk")) => {
                let attrs = attributes(vm, e)?;
                if let (Some(entry), Some(dev)) = (disk.as_mut(), attrs.get("dev")) {
                    entry.target = dev.clone();
                }
            }
            ("hostdev", Some("devices")) => {
                let attrs = attributes(vm, e)?;
                in_pci_hostdev = attrs.get("type").map(String::as_str) == Some("pci");
            }
            ("address", Some("source")) if in_pci_hostdev && grandparent == Some("hostdev") => {
                let attrs = attributes(vm, e)?;
                let get = |k: &str| attrs.get(k).map(String::as_str).unwrap_or("0x0");
                let addr = PciAddress::from_libvirt_attrs(
                    get("domain"),
                    get("bus"),
                    get("slot"),
                    get("function"),
                )?;
                devices.hostdevs.push(addr);
            }
            ("vcpupin", Some("cputune")) => {
                let attrs = attributes(vm, e)?;
                let vcpu = attrs.get("vcpu").and_then(|v| v.parse::<u32>().ok());
                let cpuset = attrs.get("cpuset").map(|s| parse_cpuset(s));
                if let (Some(vcpu), Some(cpuset)) = (vcpu, cpuset) {
                    devices.vcpu_pins.insert(vcpu, cpuset);
                }
            }
            _ => {}
        }

        if empty {
            close(&name, &mut devices, &mut disk, &mut in_pci_hostdev);
        } else {
            stack.push(name);
        }
    }

    Ok(devices)
}

fn close(
    name: &str,
    devices: &mut DomainDevices,
    disk: &mut Option<DiskEntry>,
    in_pci_hostdev: &mut bool,
) {
    match name {
        "disk" => {
            if let Some(entry) = disk.take()
                && !entry.target.is_empty()
            {
                devices.disks.push(entry);
            }
        }
        "hostdev" => *in_pci_hostdev = false,
        _ => {}
    }
}

/// Parse a libvirt cpuset such as `2`, `4-7` or `0-3,^2,8`.
pub fn parse_cpuset(spec: &str) -> BTreeSet<u32> {
    let mut cpus = BTreeSet::new();
    let mut excluded = BTreeSet::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (target, part) = match part.strip_prefix('^') {
            Some(rest) => (&mut excluded, rest),
            None => (&mut cpus, part),
        };
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                    target.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<u32>() {
                    target.insert(cpu);
                }
            }
        }
    }
    cpus.difference(&excluded).copied().collect()
}
