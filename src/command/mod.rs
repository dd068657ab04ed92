//! External command execution.
//!
//! Every mutating action in the installer goes through [`CommandRunner::run`],
//! so a single simulate switch makes the whole run side-effect free.
//! Read-only probes (`virsh domstate`, `lspci`, ...) go through
//! [`CommandRunner::query`] and are executed in both modes.

mod system;

#[cfg(test)]
pub mod recording;

pub use system::SystemRunner;

use async_trait::async_trait;
use std::fmt;

use crate::errors::InstallError;

const MASK: &str = "****";

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    secrets: Vec<String>,
}

impl SystemCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// `sh -c <script>` for the few steps that need redirection.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an argument containing a credential. The secret is masked in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret, MASK))
    }
}

impl fmt::Display for SystemCommand {
    /// Shell-like rendering with secrets masked. Not meant to be re-parsed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            let arg = self.mask(arg);
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Exit status and captured output of a command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when the command was only recorded, not executed.
    pub simulated: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn simulated() -> Self {
        Self {
            simulated: true,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Convert a non-zero exit into [`InstallError::CommandFailed`].
    pub fn into_success(self, command: &SystemCommand) -> Result<Self, InstallError> {
        if self.success() {
            Ok(self)
        } else {
            Err(InstallError::CommandFailed {
                command: command.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Executes external commands, or records them in simulation mode.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Whether mutating commands are only recorded.
    fn simulate(&self) -> bool;

    /// Run a mutating command. Returns the outcome even on non-zero exit.
    async fn run(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError>;

    /// Run a read-only probe. Never simulated.
    async fn query(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError>;

    /// Like [`CommandRunner::run`] but a non-zero exit is an error.
    async fn run_checked(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError> {
        self.run(command).await?.into_success(command)
    }

    /// Like [`CommandRunner::query`] but a non-zero exit is an error.
    async fn query_checked(
        &self,
        command: &SystemCommand,
    ) -> Result<CommandOutput, InstallError> {
        self.query(command).await?.into_success(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_args_with_spaces() {
        let cmd = SystemCommand::shell("echo 4 > /sys/class/net/ens1f0/device/sriov_numvfs");
        assert_eq!(
            cmd.to_string(),
            "sh -c 'echo 4 > /sys/class/net/ens1f0/device/sriov_numvfs'"
        );
    }

    #[test]
    fn display_masks_secrets() {
        let cmd = SystemCommand::new("curl")
            .arg("-u")
            .secret_arg("admin:hunter2", "hunter2")
            .arg("https://repo.example/images");
        let shown = cmd.to_string();
        assert!(shown.contains("admin:****"));
        assert!(!shown.contains("hunter2"));
        // the real argument is untouched
        assert_eq!(cmd.get_args()[1], "admin:hunter2");
    }

    #[test]
    fn into_success_maps_non_zero_exit() {
        let cmd = SystemCommand::new("virsh").args(["start", "dl-master"]);
        let err = CommandOutput::failed(1, "error: domain not found\n")
            .into_success(&cmd)
            .unwrap_err();
        match err {
            InstallError::CommandFailed {
                command,
                code,
                stderr,
            } => {
                assert_eq!(command, "virsh start dl-master");
                assert_eq!(code, 1);
                assert_eq!(stderr, "error: domain not found");
            }
            other => panic!("Expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn simulated_output_is_success() {
        let out = CommandOutput::simulated();
        assert!(out.success());
        assert!(out.simulated);
    }
}
