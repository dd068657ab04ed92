//! Operator confirmation before each step, and free-text input.

use anyhow::Result;
use dialoguer::{Confirm, Input, Password, Select, theme::ColorfulTheme};

use crate::config::{ConfigStore, InstallConfig};
use crate::steps::Step;

/// Interactive boundary. `None` means the operator cancelled (Esc / empty
/// input), which callers treat as an explicit decline.
pub trait Prompter: Send + Sync {
    fn select(&self, prompt: &str, items: &[&str], default: usize) -> Result<Option<usize>>;

    fn confirm(&self, prompt: &str, default: bool) -> Result<Option<bool>>;

    /// Free-text input; `secret` hides what is typed.
    fn input(&self, prompt: &str, secret: bool) -> Result<Option<String>>;
}

/// dialoguer-backed prompter for a real terminal.
pub struct TerminalPrompter {
    theme: ColorfulTheme,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TerminalPrompter {
    fn select(&self, prompt: &str, items: &[&str], default: usize) -> Result<Option<usize>> {
        Ok(Select::with_theme(&self.theme)
            .with_prompt(prompt)
            .items(items)
            .default(default)
            .interact_opt()?)
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<Option<bool>> {
        Ok(Confirm::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(default)
            .interact_opt()?)
    }

    fn input(&self, prompt: &str, secret: bool) -> Result<Option<String>> {
        let value = if secret {
            Password::with_theme(&self.theme)
                .with_prompt(prompt)
                .allow_empty_password(true)
                .interact()?
        } else {
            Input::<String>::with_theme(&self.theme)
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()?
        };
        Ok((!value.is_empty()).then_some(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Approved,
    ApprovedAll, // operator chose "yes to all"
    Declined,
    Aborted,
}

/// Asks before each step unless `--yes` (or "yes to all") is in effect.
pub struct ApprovalGate<'a> {
    prompter: &'a dyn Prompter,
    pub skip_all: bool,
}

impl<'a> ApprovalGate<'a> {
    pub fn new(prompter: &'a dyn Prompter, skip_all: bool) -> Self {
        Self {
            prompter,
            skip_all,
        }
    }

    pub fn check_step(&mut self, step: &Step) -> Result<GateDecision> {
        if self.skip_all {
            println!("  {} (--yes flag)", console::style("Auto-approved").dim());
            return Ok(GateDecision::Approved);
        }

        let options = &[
            "Yes, run this step",
            "Yes, and run remaining steps without asking",
            "Skip this step",
            "Stop the installer",
        ];
        let prompt = format!("Run step {} ({})?", step.ordinal, step.id);
        match self.prompter.select(&prompt, options, 0)? {
            Some(0) => Ok(GateDecision::Approved),
            Some(1) => {
                self.skip_all = true;
                Ok(GateDecision::ApprovedAll)
            }
            Some(3) => Ok(GateDecision::Aborted),
            // cancel counts as an explicit decline
            Some(_) | None => Ok(GateDecision::Declined),
        }
    }

    /// Yes/no question for destructive commands; `--yes` answers yes.
    pub fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.skip_all {
            return Ok(true);
        }
        Ok(self.prompter.confirm(prompt, false)?.unwrap_or(false))
    }
}

/// `config set <key>` without a value: ask for it (hidden for secrets) and
/// store it. `None` when the operator cancels; the config file is untouched.
pub fn prompt_setting(
    prompter: &dyn Prompter,
    store: &ConfigStore,
    key: &str,
) -> Result<Option<String>> {
    let Some(value) = prompter.input(key, InstallConfig::is_secret(key))? else {
        return Ok(None);
    };
    store.set(key, &value)?;
    Ok(Some(value))
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedPrompter;
    use super::*;
    use crate::steps::{StepId, StepRegistry};

    fn first_step() -> Step {
        StepRegistry::standard().steps()[0].clone()
    }

    #[test]
    fn test_skip_all_never_prompts() {
        let prompter = ScriptedPrompter::new();
        let mut gate = ApprovalGate::new(&prompter, true);
        assert_eq!(gate.check_step(&first_step()).unwrap(), GateDecision::Approved);
        assert!(gate.confirm("Delete?").unwrap());
        assert!(prompter.prompts().is_empty());
    }

    #[test]
    fn test_yes_to_all_sticks() {
        let prompter = ScriptedPrompter::new().select_answers([Some(1)]);
        let mut gate = ApprovalGate::new(&prompter, false);
        let step = first_step();
        assert_eq!(gate.check_step(&step).unwrap(), GateDecision::ApprovedAll);
        assert_eq!(gate.check_step(&step).unwrap(), GateDecision::Approved);
        assert_eq!(prompter.prompts().len(), 1);
        assert!(prompter.prompts()[0].contains(StepId::HostNetwork.as_str()));
    }

    #[test]
    fn test_cancel_is_decline() {
        let prompter = ScriptedPrompter::new().select_answers([None, Some(2), Some(3)]);
        let mut gate = ApprovalGate::new(&prompter, false);
        let step = first_step();
        assert_eq!(gate.check_step(&step).unwrap(), GateDecision::Declined);
        assert_eq!(gate.check_step(&step).unwrap(), GateDecision::Declined);
        assert_eq!(gate.check_step(&step).unwrap(), GateDecision::Aborted);
    }

    #[test]
    fn test_confirm_cancel_is_no() {
        let prompter = ScriptedPrompter::new().confirm_answers([None]);
        let gate = ApprovalGate::new(&prompter, false);
        assert!(!gate.confirm("Delete?").unwrap());
    }

    #[test]
    fn test_prompted_setting_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("lakehost.toml"));
        let prompter = ScriptedPrompter::new().input_answers([
            Some("s3cret pass".to_string()),
            Some("eno1".to_string()),
        ]);

        let value = prompt_setting(&prompter, &store, "download_password").unwrap();
        assert_eq!(value.as_deref(), Some("s3cret pass"));
        prompt_setting(&prompter, &store, "mgmt_interface").unwrap();

        let saved = store.load().unwrap();
        assert_eq!(saved.download_password.as_deref(), Some("s3cret pass"));
        assert_eq!(saved.mgmt_interface.as_deref(), Some("eno1"));
        assert_eq!(prompter.prompts(), vec!["download_password", "mgmt_interface"]);
        assert_eq!(prompter.hidden_inputs(), vec![true, false]);
    }

    #[test]
    fn test_cancelled_prompt_leaves_config_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("lakehost.toml"));
        store.set("version", "6.2.0").unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let prompter = ScriptedPrompter::new().input_answers([None]);
        assert_eq!(prompt_setting(&prompter, &store, "version").unwrap(), None);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_invalid_prompted_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("lakehost.toml"));
        let prompter = ScriptedPrompter::new().input_answers([Some("lots".to_string())]);
        assert!(prompt_setting(&prompter, &store, "dl.vcpus").is_err());
        assert!(!store.exists());
    }
}
