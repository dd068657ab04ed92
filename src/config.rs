//! Installation parameters and their backing store.
//!
//! `InstallConfig` is a plain value: it is loaded once at the start of every
//! step and handed to the step handler, never mutated in place behind its
//! back. Changes go through [`ConfigStore::update`], which rewrites the whole
//! file atomically (temp file + rename).
//!
//! # File format
//!
//! ```toml
//! dry_run = false
//! version = "6.2.0"
//! download_user = "admin"
//! download_password = "p\"w"
//! mgmt_interface = "eno1"
//! sriov_interface = "ens1f0"
//! data_disks = ["/dev/sdb", "/dev/sdc"]
//!
//! [dl]
//! name = "dl-master"
//! vcpus = 24
//! memory_gb = 128
//!
//! [cpu_pinning]
//! dl_offset = 2
//! da_offset = 3
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::InstallError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lakehost/lakehost.toml";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/lakehost";

/// Sizing and passthrough assignment for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmConfig {
    pub name: String,
    pub vcpus: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    /// PCI address of the VF assigned to this VM, recorded when VFs are created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vf_pci: Option<String>,
}

impl VmConfig {
    fn data_lake() -> Self {
        Self {
            name: "dl-master".to_string(),
            vcpus: 24,
            memory_gb: 128,
            disk_gb: 500,
            vf_pci: None,
        }
    }

    fn data_analytics() -> Self {
        Self {
            name: "da-master".to_string(),
            vcpus: 16,
            memory_gb: 64,
            disk_gb: 300,
            vf_pci: None,
        }
    }
}

/// Keys present in a `[dl]` / `[da]` table, merged onto that VM's defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VmOverrides {
    name: Option<String>,
    vcpus: Option<u32>,
    memory_gb: Option<u32>,
    disk_gb: Option<u32>,
    vf_pci: Option<String>,
}

impl VmOverrides {
    fn apply(self, base: VmConfig) -> VmConfig {
        VmConfig {
            name: self.name.unwrap_or(base.name),
            vcpus: self.vcpus.unwrap_or(base.vcpus),
            memory_gb: self.memory_gb.unwrap_or(base.memory_gb),
            disk_gb: self.disk_gb.unwrap_or(base.disk_gb),
            vf_pci: self.vf_pci.or(base.vf_pci),
        }
    }
}

fn de_dl_vm<'de, D: serde::Deserializer<'de>>(d: D) -> Result<VmConfig, D::Error> {
    Ok(VmOverrides::deserialize(d)?.apply(VmConfig::data_lake()))
}

fn de_da_vm<'de, D: serde::Deserializer<'de>>(d: D) -> Result<VmConfig, D::Error> {
    Ok(VmOverrides::deserialize(d)?.apply(VmConfig::data_analytics()))
}

/// Host core partitioning between the two VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuPinningConfig {
    pub enabled: bool,
    /// First even core handed to the data-lake VM; lower even cores stay with the host.
    pub dl_offset: u32,
    /// First odd core handed to the data-analytics VM; lower odd cores stay with the host.
    pub da_offset: u32,
}

impl Default for CpuPinningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dl_offset: 2,
            da_offset: 3,
        }
    }
}

/// Retry tuning for the resource reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub verify_attempts: u32,
    pub verify_delay_ms: u64,
    /// Extra attempts granted when only the persistent definition lags.
    pub extended_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            verify_attempts: 5,
            verify_delay_ms: 1000,
            extended_attempts: 5,
        }
    }
}

/// Typed installation parameters. Every field has a default, so a missing
/// or partial file still loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mgmt_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sriov_interface: Option<String>,
    pub sriov_vf_count: u32,
    pub data_disks: Vec<String>,
    pub volume_group: String,
    pub data_volume: String,
    pub image_dir: PathBuf,
    pub shutdown_timeout_secs: u64,
    pub shutdown_poll_secs: u64,
    #[serde(deserialize_with = "de_dl_vm")]
    pub dl: VmConfig,
    #[serde(deserialize_with = "de_da_vm")]
    pub da: VmConfig,
    pub cpu_pinning: CpuPinningConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            version: None,
            download_url: "https://downloads.lakehost.io/images".to_string(),
            download_user: None,
            download_password: None,
            hostname: None,
            mgmt_interface: None,
            sriov_interface: None,
            sriov_vf_count: 2,
            data_disks: Vec::new(),
            volume_group: "dlvg".to_string(),
            data_volume: "dldata".to_string(),
            image_dir: PathBuf::from("/var/lib/libvirt/images"),
            shutdown_timeout_secs: 180,
            shutdown_poll_secs: 5,
            dl: VmConfig::data_lake(),
            da: VmConfig::data_analytics(),
            cpu_pinning: CpuPinningConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Keys accepted by [`InstallConfig::set`], in display order.
pub const SETTABLE_KEYS: &[&str] = &[
    "dry_run",
    "version",
    "download_url",
    "download_user",
    "download_password",
    "hostname",
    "mgmt_interface",
    "sriov_interface",
    "sriov_vf_count",
    "data_disks",
    "volume_group",
    "data_volume",
    "image_dir",
    "shutdown_timeout_secs",
    "shutdown_poll_secs",
    "dl.name",
    "dl.vcpus",
    "dl.memory_gb",
    "dl.disk_gb",
    "dl.vf_pci",
    "da.name",
    "da.vcpus",
    "da.memory_gb",
    "da.disk_gb",
    "da.vf_pci",
    "cpu_pinning.enabled",
    "cpu_pinning.dl_offset",
    "cpu_pinning.da_offset",
    "reconcile.verify_attempts",
    "reconcile.verify_delay_ms",
    "reconcile.extended_attempts",
];

fn invalid(key: &str, message: impl Into<String>) -> InstallError {
    InstallError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, InstallError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("'{}' is not a number", value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, InstallError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(invalid(key, format!("'{}' is not a boolean", value))),
    }
}

fn optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn non_empty(key: &str, value: &str) -> Result<String, InstallError> {
    optional(value).ok_or_else(|| invalid(key, "must not be empty"))
}

impl InstallConfig {
    /// Apply a single `key = value` change. Keys are the dotted names in
    /// [`SETTABLE_KEYS`]; an empty value clears optional settings.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), InstallError> {
        match key {
            "dry_run" => self.dry_run = parse_bool(key, value)?,
            "version" => self.version = optional(value),
            "download_url" => self.download_url = non_empty(key, value)?,
            "download_user" => self.download_user = optional(value),
            // passwords keep surrounding whitespace
            "download_password" => {
                self.download_password = (!value.is_empty()).then(|| value.to_string())
            }
            "hostname" => self.hostname = optional(value),
            "mgmt_interface" => self.mgmt_interface = optional(value),
            "sriov_interface" => self.sriov_interface = optional(value),
            "sriov_vf_count" => self.sriov_vf_count = parse_num(key, value)?,
            "data_disks" => {
                self.data_disks = value
                    .split(',')
                    .filter_map(optional)
                    .collect();
            }
            "volume_group" => self.volume_group = non_empty(key, value)?,
            "data_volume" => self.data_volume = non_empty(key, value)?,
            "image_dir" => self.image_dir = PathBuf::from(non_empty(key, value)?),
            "shutdown_timeout_secs" => self.shutdown_timeout_secs = parse_num(key, value)?,
            "shutdown_poll_secs" => {
                let secs: u64 = parse_num(key, value)?;
                if secs == 0 {
                    return Err(invalid(key, "must be at least 1"));
                }
                self.shutdown_poll_secs = secs;
            }
            "cpu_pinning.enabled" => self.cpu_pinning.enabled = parse_bool(key, value)?,
            "cpu_pinning.dl_offset" => self.cpu_pinning.dl_offset = parse_num(key, value)?,
            "cpu_pinning.da_offset" => self.cpu_pinning.da_offset = parse_num(key, value)?,
            "reconcile.verify_attempts" => {
                self.reconcile.verify_attempts = parse_num(key, value)?
            }
            "reconcile.verify_delay_ms" => {
                self.reconcile.verify_delay_ms = parse_num(key, value)?
            }
            "reconcile.extended_attempts" => {
                self.reconcile.extended_attempts = parse_num(key, value)?
            }
            _ => {
                let (section, field) = key
                    .split_once('.')
                    .ok_or_else(|| invalid(key, "unknown setting"))?;
                let vm = match section {
                    "dl" => &mut self.dl,
                    "da" => &mut self.da,
                    _ => return Err(invalid(key, "unknown setting")),
                };
                match field {
                    "name" => vm.name = non_empty(key, value)?,
                    "vcpus" => vm.vcpus = parse_num(key, value)?,
                    "memory_gb" => vm.memory_gb = parse_num(key, value)?,
                    "disk_gb" => vm.disk_gb = parse_num(key, value)?,
                    "vf_pci" => vm.vf_pci = optional(value),
                    _ => return Err(invalid(key, "unknown setting")),
                }
            }
        }
        Ok(())
    }

    /// Whether a key holds a credential that must not be echoed.
    pub fn is_secret(key: &str) -> bool {
        key.contains("password")
    }

    /// Render as TOML with credentials masked, for `config show`.
    pub fn to_display_toml(&self) -> Result<String, InstallError> {
        let mut shown = self.clone();
        if shown.download_password.is_some() {
            shown.download_password = Some("****".to_string());
        }
        toml::to_string_pretty(&shown).map_err(|e| InstallError::Other(e.into()))
    }

    /// Both download credentials, if configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.download_user, &self.download_password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

/// File-backed store for [`InstallConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the config, falling back to defaults for a missing file or keys.
    pub fn load(&self) -> Result<InstallConfig, InstallError> {
        if !self.path.exists() {
            return Ok(InstallConfig::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|source| InstallError::ConfigRead {
            path: self.path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| InstallError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Serialize the whole struct and atomically replace the file.
    pub fn save(&self, config: &InstallConfig) -> Result<(), InstallError> {
        let content = toml::to_string_pretty(config).map_err(|e| InstallError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&self.path, content.as_bytes()).map_err(|source| {
            InstallError::ConfigWrite {
                path: self.path.clone(),
                source,
            }
        })?;
        tracing::debug!(path = %self.path.display(), "config saved");
        Ok(())
    }

    /// Load, apply `change` to a copy, save, and return the new value.
    pub fn update<F>(&self, change: F) -> Result<InstallConfig, InstallError>
    where
        F: FnOnce(&mut InstallConfig) -> Result<(), InstallError>,
    {
        let mut config = self.load()?;
        change(&mut config)?;
        self.save(&config)?;
        Ok(config)
    }

    /// Set one key and persist.
    pub fn set(&self, key: &str, value: &str) -> Result<InstallConfig, InstallError> {
        self.update(|c| c.set(key, value))
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
