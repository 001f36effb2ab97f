//! Scripted command runner for tests
//!
//! Matches each command line against registered substrings (most recent rule
//! first). Unmatched commands succeed with empty output.

use crate::domain::ports::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
enum Response {
    Output(CommandOutput),
    Timeout,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    once: VecDeque<Response>,
    always: Option<Response>,
}

#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every matching command returns `output`
    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            once: VecDeque::new(),
            always: Some(Response::Output(output)),
        });
        self
    }

    /// The next matching command returns `output`
    pub fn on_once(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            once: VecDeque::from([Response::Output(output)]),
            always: None,
        });
        self
    }

    /// Every matching command fails with exit 1
    pub fn fail(&self, pattern: &str) -> &Self {
        self.on(pattern, CommandOutput::failed(1, format!("{} failed", pattern)))
    }

    /// Every matching command times out
    pub fn time_out(&self, pattern: &str) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            once: VecDeque::new(),
            always: Some(Response::Timeout),
        });
        self
    }

    /// Command lines in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.command_line()).collect()
    }

    /// Full specs in call order
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Number of calls containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Index of the first call containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(pattern))
    }

    fn respond(&self, line: &str) -> Option<Response> {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut().rev() {
            if !line.contains(&rule.pattern) {
                continue;
            }
            if let Some(response) = rule.once.pop_front() {
                return Some(response);
            }
            if let Some(response) = &rule.always {
                return Some(response.clone());
            }
        }
        None
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().push(spec.clone());
        match self.respond(&spec.command_line()) {
            Some(Response::Output(output)) => Ok(output),
            Some(Response::Timeout) => Err(Error::CommandTimeout {
                program: spec.program_name().to_string(),
                timeout: spec.timeout,
            }),
            None => Ok(CommandOutput::ok("")),
        }
    }
}
