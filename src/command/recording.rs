//! Scripted [`CommandRunner`] test double.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{CommandOutput, CommandRunner, SystemCommand};
use crate::errors::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Run,
    Query,
}

/// Records every command and answers from a script of
/// `(command prefix, outputs)` rules. Unmatched commands succeed with empty
/// output; the last output of a rule repeats once the queue is drained.
pub struct RecordingRunner {
    simulate: bool,
    rules: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
    calls: Mutex<Vec<(CallKind, String)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::with_simulate(false)
    }

    pub fn with_simulate(simulate: bool) -> Self {
        Self {
            simulate,
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.respond_seq(prefix, vec![output])
    }

    pub fn respond_seq(&self, prefix: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.rules
            .lock()
            .unwrap()
            .push((prefix.to_string(), outputs.into()));
        self
    }

    pub fn calls(&self) -> Vec<(CallKind, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, c)| c).collect()
    }

    pub fn runs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(k, _)| *k == CallKind::Run)
            .map(|(_, c)| c)
            .collect()
    }

    fn answer(&self, kind: CallKind, command: &SystemCommand) -> CommandOutput {
        let shown = command.to_string();
        self.calls.lock().unwrap().push((kind, shown.clone()));
        if kind == CallKind::Run && self.simulate {
            return CommandOutput::simulated();
        }
        let mut rules = self.rules.lock().unwrap();
        for (prefix, outputs) in rules.iter_mut() {
            if shown.starts_with(prefix.as_str()) {
                return if outputs.len() > 1 {
                    outputs.pop_front().unwrap_or_default()
                } else {
                    outputs.front().cloned().unwrap_or_default()
                };
            }
        }
        CommandOutput::ok("")
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    fn simulate(&self) -> bool {
        self.simulate
    }

    async fn run(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError> {
        Ok(self.answer(CallKind::Run, command))
    }

    async fn query(&self, command: &SystemCommand) -> Result<CommandOutput, InstallError> {
        Ok(self.answer(CallKind::Query, command))
    }
}
