use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::config::write_atomic;
use crate::errors::InstallError;
use crate::steps::StepId;

/// The single resumability fact: which step last completed, and when.
///
/// The step id is kept as the raw string from disk so that an id written by
/// a newer release still loads; the orchestrator decides what to do with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl InstallState {
    pub fn is_empty(&self) -> bool {
        self.last_completed_step.is_none()
    }

    /// The recorded step, if it is one this build knows about.
    pub fn known_step(&self) -> Option<StepId> {
        self.last_completed_step.as_deref()?.parse().ok()
    }
}

pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.state_file
    }

    /// Read the state; a missing file is the empty state.
    pub fn load(&self) -> Result<InstallState, InstallError> {
        if !self.state_file.exists() {
            return Ok(InstallState::default());
        }
        let content =
            fs::read_to_string(&self.state_file).map_err(|source| InstallError::StateRead {
                path: self.state_file.clone(),
                source,
            })?;
        toml::from_str(&content).map_err(|e| InstallError::Parse {
            path: self.state_file.clone(),
            message: e.to_string(),
        })
    }

    /// Record `step` as the last completed step, stamped now.
    pub fn record(&self, step: StepId) -> Result<InstallState, InstallError> {
        let state = InstallState {
            last_completed_step: Some(step.as_str().to_string()),
            last_run_at: Some(Utc::now()),
        };
        self.save(&state)?;
        Ok(state)
    }

    pub fn save(&self, state: &InstallState) -> Result<(), InstallError> {
        let content = toml::to_string(state).map_err(|e| InstallError::Parse {
            path: self.state_file.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&self.state_file, content.as_bytes()).map_err(|source| {
            InstallError::StateWrite {
                path: self.state_file.clone(),
                source,
            }
        })
    }

    pub fn reset(&self) -> Result<(), InstallError> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).map_err(|source| InstallError::StateWrite {
                path: self.state_file.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
