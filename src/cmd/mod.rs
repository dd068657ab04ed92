//! CLI command implementations.
//!
//! | Module   | Commands handled              |
//! |----------|-------------------------------|
//! | `run`    | `Run`, `Step`                 |
//! | `state`  | `List`, `Status`, `Reset`     |
//! | `config` | `Config`                      |

pub mod config;
pub mod run;
pub mod state;

pub use config::cmd_config;
pub use run::{cmd_run, cmd_step};
pub use state::{cmd_list, cmd_reset, cmd_status};

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use super::Cli;
use lakehost::config::{ConfigStore, InstallConfig};
use lakehost::orchestrator::StateManager;

pub fn config_store(cli: &Cli) -> ConfigStore {
    ConfigStore::new(cli.config.clone())
}

/// Dry runs keep their own progress so that a rehearsal never marks real
/// steps as done.
pub fn state_file(cli: &Cli, simulate: bool) -> PathBuf {
    let name = if simulate {
        "state.dry-run.toml"
    } else {
        "state.toml"
    };
    cli.state_dir.join(name)
}

/// Simulate when either `--dry-run` or the config file asks for it.
pub fn simulate(cli: &Cli, config: &InstallConfig) -> bool {
    cli.dry_run || config.dry_run
}

pub fn state_manager(cli: &Cli, simulate: bool) -> StateManager {
    StateManager::new(state_file(cli, simulate))
}

/// Load the config and pick the matching state file.
pub fn load_context(cli: &Cli) -> Result<(InstallConfig, StateManager)> {
    let config = config_store(cli)
        .load()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let state = state_manager(cli, simulate(cli, &config));
    Ok((config, state))
}

/// Exclusive lock on `<state-dir>/lakehost.lock`, held until the returned
/// file is dropped.
pub fn acquire_lock(cli: &Cli) -> Result<File> {
    use fs2::FileExt;
    use lakehost::errors::InstallError;

    std::fs::create_dir_all(&cli.state_dir).with_context(|| {
        format!(
            "Failed to create state directory {}",
            cli.state_dir.display()
        )
    })?;
    let path = cli.state_dir.join("lakehost.lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .map_err(|_| InstallError::Locked(path))?;
    Ok(file)
}
