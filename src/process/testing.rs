//! Recording command runner for tests.
//!
//! Records every command it is asked to run and answers from a list of
//! scripted rules. Commands without a matching rule succeed with empty output.

use std::cell::RefCell;
use std::time::Duration;

use super::{Cmd, CmdOutput, CommandRunner};
use crate::error::{ProvisionError, Result};

enum Reply {
    Output(CmdOutput),
    Timeout,
}

struct Rule {
    tool: String,
    needle: Option<String>,
    reply: Reply,
}

#[derive(Default)]
pub(crate) struct RecordingRunner {
    calls: RefCell<Vec<Vec<String>>>,
    rules: RefCell<Vec<Rule>>,
}

impl RecordingRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&self, tool: &str, needle: Option<&str>, reply: Reply) -> &Self {
        self.rules.borrow_mut().push(Rule {
            tool: tool.to_string(),
            needle: needle.map(str::to_string),
            reply,
        });
        self
    }

    /// `tool` succeeds and prints `stdout`.
    pub(crate) fn respond(&self, tool: &str, stdout: &str) -> &Self {
        self.push(
            tool,
            None,
            Reply::Output(CmdOutput {
                status: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        )
    }

    /// `tool` exits with status 1 and prints `stderr`.
    pub(crate) fn fail(&self, tool: &str, stderr: &str) -> &Self {
        self.fail_when(tool, None, stderr)
    }

    /// Like [`fail`](Self::fail), restricted to invocations whose argv
    /// contains an argument including `needle`.
    pub(crate) fn fail_when(&self, tool: &str, needle: Option<&str>, stderr: &str) -> &Self {
        self.push(
            tool,
            needle,
            Reply::Output(CmdOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        )
    }

    pub(crate) fn time_out(&self, tool: &str) -> &Self {
        self.push(tool, None, Reply::Timeout)
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    /// The tool of every recorded call, in order, with `sudo` stripped.
    pub(crate) fn tools(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|argv| match argv.as_slice() {
                [sudo, tool, ..] if sudo == "sudo" => tool.clone(),
                [program, ..] => program.clone(),
                [] => String::new(),
            })
            .collect()
    }

    pub(crate) fn count(&self, tool: &str) -> usize {
        self.tools().iter().filter(|t| t.as_str() == tool).count()
    }

    pub(crate) fn calls_to(&self, tool: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .zip(self.tools())
            .filter(|(_, t)| t == tool)
            .map(|(argv, _)| argv)
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let argv = cmd.argv();
        self.calls.borrow_mut().push(argv.clone());

        let rules = self.rules.borrow();
        let rule = rules.iter().find(|rule| {
            rule.tool == cmd.tool()
                && rule
                    .needle
                    .as_ref()
                    .map_or(true, |needle| argv.iter().any(|arg| arg.contains(needle.as_str())))
        });

        match rule.map(|r| &r.reply) {
            Some(Reply::Output(output)) => Ok(output.clone()),
            Some(Reply::Timeout) => Err(ProvisionError::ToolTimedOut {
                command: cmd.command_line(),
                timeout: cmd.get_timeout().max(Duration::from_secs(1)),
                partial: String::new(),
            }),
            None => Ok(CmdOutput {
                status: Some(0),
                ..CmdOutput::default()
            }),
        }
    }
}
