//! Typed error hierarchy for the installer.
//!
//! Two top-level enums cover the two subsystems:
//! - `InstallError` — command execution, config/state persistence, step lookup
//! - `ReconcileError` — VM domain queries and device (de)attachment

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the installation core (runner, stores, registry).
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Command `{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Failed to spawn `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read config file at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file at {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to read state file at {path}: {source}")]
    StateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    StateWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Another installer holds the lock at {0}")]
    Locked(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the virtualization layer used by the reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("VM '{0}' is not defined")]
    VmNotFound(String),

    #[error("VM '{vm}' reported unexpected run state '{state}'")]
    UnknownRunState { vm: String, state: String },

    #[error("Failed to parse domain XML for '{vm}': {message}")]
    DomainXml { vm: String, message: String },

    #[error("Invalid PCI address '{0}'")]
    InvalidPciAddress(String),

    #[error(transparent)]
    Command(#[from] InstallError),
}

impl InstallError {
    /// Exit code of a failed command, if this error came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            InstallError::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}
