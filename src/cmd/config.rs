//! Installation parameters: `lakehost config`.

use anyhow::{Context, Result};
use console::style;

use super::super::{Cli, ConfigCommands};
use lakehost::config::{InstallConfig, SETTABLE_KEYS};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let store = super::config_store(cli);

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = store.load()?;
            println!();
            if store.exists() {
                println!("Config file: {}", store.path().display());
            } else {
                println!(
                    "No config file at {}, showing defaults.",
                    store.path().display()
                );
            }
            println!();
            print!("{}", config.to_display_toml()?);
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if store.exists() && !force {
                println!("Config already exists at {}", store.path().display());
                println!("Use --force to overwrite it with defaults.");
                return Ok(());
            }
            store.save(&InstallConfig::default())?;
            println!("Created {}", store.path().display());
            println!();
            println!("Set at least:");
            println!("  - version, download_user, download_password");
            println!("  - mgmt_interface, sriov_interface, data_disks");
        }
        Some(ConfigCommands::Set { key, value }) => {
            if !SETTABLE_KEYS.contains(&key.as_str()) {
                anyhow::bail!(
                    "Unknown setting '{}'. Run `lakehost config keys` for the list.",
                    key
                );
            }
            let value = match value {
                Some(value) => {
                    store.set(&key, &value).with_context(|| {
                        format!("Failed to update {}", store.path().display())
                    })?;
                    value
                }
                None => {
                    use lakehost::gates::{TerminalPrompter, prompt_setting};

                    match prompt_setting(&TerminalPrompter::new(), &store, &key)? {
                        Some(value) => value,
                        None => {
                            println!("Cancelled, {} unchanged", key);
                            return Ok(());
                        }
                    }
                }
            };
            tracing::info!(key = %key, "config updated");
            let shown = if InstallConfig::is_secret(&key) {
                "****"
            } else {
                value.as_str()
            };
            println!("{} {} = {}", style("Set").green(), key, shown);
        }
        Some(ConfigCommands::Keys) => {
            for key in SETTABLE_KEYS {
                println!("{}", key);
            }
        }
    }
    Ok(())
}
