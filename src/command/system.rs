use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CommandOutput, CommandRunner, SystemCommand};
use crate::errors::InstallError;

/// Runs commands on the host through `tokio::process`.
pub struct SystemRunner {
    simulate: bool,
    simulated: Mutex<Vec<String>>,
}

impl SystemRunner {
    pub fn new(simulate: bool) -> Self {
        Self {
            simulate,
            simulated: Mutex::new(Vec::new()),
        }
    }

    /// Commands recorded instead of executed, in order.
    pub fn simulated_commands(&self) -> Vec<String> {
        self.simulated
            .lock()
            .map(|cmds| cmds.clone())
            .unwrap_or_default()
    }

    async fn execute(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError> {
        let shown = command.to_string();
        let mut child = Command::new(command.program())
            .args(command.get_args())
            .envs(command.get_env().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if command.get_stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| InstallError::CommandSpawn {
                command: shown.clone(),
                source,
            })?;

        if let (Some(input), Some(mut stdin)) = (command.get_stdin(), child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| InstallError::CommandSpawn {
                    command: shown.clone(),
                    source,
                })?;
            // stdin dropped here, closing the pipe
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| InstallError::CommandSpawn {
                command: shown.clone(),
                source,
            })?;

        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            simulated: false,
        };

        tracing::debug!(command = %shown, code = result.code, "command finished");
        if !result.success() {
            tracing::warn!(
                command = %shown,
                code = result.code,
                stderr = %result.stderr.trim(),
                "command failed"
            );
        }
        Ok(result)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    fn simulate(&self) -> bool {
        self.simulate
    }

    async fn run(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError> {
        if self.simulate {
            let shown = command.to_string();
            tracing::info!(command = %shown, "[dry-run] would run");
            if let Ok(mut cmds) = self.simulated.lock() {
                cmds.push(shown);
            }
            return Ok(CommandOutput::simulated());
        }
        tracing::info!(command = %command, "running");
        self.execute(command).await
    }

    async fn query(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError> {
        tracing::debug!(command = %command, "querying");
        self.execute(command).await
    }
}
