//! Scripted collaborators for unit and integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::io::model::{Model, ResponseFormat};
use crate::io::operator::{Confirmation, Operator};
use crate::io::prompt::PLANNER_SYSTEM_PROMPT;
use crate::io::shell::{Shell, ShellOutput};
use crate::io::web_search::{SearchReport, WebSearch};

/// One request received by [`ScriptedModel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCall {
    pub system: String,
    pub user: String,
    pub format: ResponseFormat,
}

/// Model double with separate reply queues for planner requests, JSON agent
/// turns and free-text requests (summaries, analysis). An empty queue
/// answers `None`.
#[derive(Default)]
pub struct ScriptedModel {
    plans: RefCell<VecDeque<String>>,
    replies: RefCell<VecDeque<Option<String>>>,
    texts: RefCell<VecDeque<String>>,
    calls: RefCell<Vec<ModelCall>>,
}

impl ScriptedModel {
    pub fn with_plan(self, reply: &str) -> Self {
        self.plans.borrow_mut().push_back(reply.to_string());
        self
    }

    pub fn with_reply(self, reply: &str) -> Self {
        self.replies.borrow_mut().push_back(Some(reply.to_string()));
        self
    }

    /// Queues a turn where the model gives no reply at all.
    pub fn with_silence(self) -> Self {
        self.replies.borrow_mut().push_back(None);
        self
    }

    pub fn with_text(self, reply: &str) -> Self {
        self.texts.borrow_mut().push_back(reply.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.borrow().clone()
    }

    /// Agent turns requested so far (excludes planner and text requests).
    pub fn agent_calls(&self) -> Vec<ModelCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.system != PLANNER_SYSTEM_PROMPT && c.format == ResponseFormat::Json)
            .cloned()
            .collect()
    }
}

impl Model for ScriptedModel {
    fn send(&self, system_prompt: &str, user_prompt: &str, format: ResponseFormat) -> Option<String> {
        self.calls.borrow_mut().push(ModelCall {
            system: system_prompt.to_string(),
            user: user_prompt.to_string(),
            format,
        });
        if system_prompt == PLANNER_SYSTEM_PROMPT {
            return self.plans.borrow_mut().pop_front();
        }
        match format {
            ResponseFormat::Text => self.texts.borrow_mut().pop_front(),
            ResponseFormat::Json => self.replies.borrow_mut().pop_front().flatten(),
        }
    }
}

/// Shell double returning queued outputs (default: empty output, exit 0).
#[derive(Default)]
pub struct ScriptedShell {
    remote: bool,
    outputs: RefCell<VecDeque<Result<ShellOutput, String>>>,
    commands: RefCell<Vec<(String, Duration)>>,
}

impl ScriptedShell {
    pub fn remote() -> Self {
        Self {
            remote: true,
            ..Self::default()
        }
    }

    pub fn with_output(self, output: &str, exit_code: i32) -> Self {
        self.outputs.borrow_mut().push_back(Ok(ShellOutput {
            output: output.to_string(),
            exit_code,
            timed_out: false,
        }));
        self
    }

    /// Queues a failure to run the command at all.
    pub fn with_error(self, message: &str) -> Self {
        self.outputs.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.commands.borrow().iter().map(|(_, t)| *t).collect()
    }
}

impl Shell for ScriptedShell {
    fn exec(&self, command: &str, timeout: Duration) -> Result<ShellOutput> {
        self.commands
            .borrow_mut()
            .push((command.to_string(), timeout));
        match self.outputs.borrow_mut().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(ShellOutput {
                output: String::new(),
                exit_code: 0,
                timed_out: false,
            }),
        }
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn describe(&self) -> String {
        if self.remote {
            "scripted@remote".to_string()
        } else {
            "local".to_string()
        }
    }
}

/// Operator double. Confirmations default to approved, answers to an empty
/// string and follow-up instructions to none.
#[derive(Default)]
pub struct ScriptedOperator {
    confirmations: RefCell<VecDeque<Confirmation>>,
    answers: RefCell<VecDeque<String>>,
    instructions: RefCell<VecDeque<String>>,
    statuses: RefCell<Vec<String>>,
    prompts: RefCell<Vec<String>>,
    questions: RefCell<Vec<String>>,
}

impl ScriptedOperator {
    pub fn with_confirmation(self, confirmation: Confirmation) -> Self {
        self.confirmations.borrow_mut().push_back(confirmation);
        self
    }

    pub fn with_answer(self, answer: &str) -> Self {
        self.answers.borrow_mut().push_back(answer.to_string());
        self
    }

    pub fn with_instruction(self, instruction: &str) -> Self {
        self.instructions
            .borrow_mut()
            .push_back(instruction.to_string());
        self
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.borrow().clone()
    }

    /// Confirmation prompts shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.borrow().clone()
    }
}

impl Operator for ScriptedOperator {
    fn status(&self, message: &str) {
        self.statuses.borrow_mut().push(message.to_string());
    }

    fn confirm(&self, prompt: &str) -> Result<Confirmation> {
        self.prompts.borrow_mut().push(prompt.to_string());
        Ok(self
            .confirmations
            .borrow_mut()
            .pop_front()
            .unwrap_or(Confirmation::Approved))
    }

    fn ask(&self, question: &str) -> Result<String> {
        self.questions.borrow_mut().push(question.to_string());
        Ok(self.answers.borrow_mut().pop_front().unwrap_or_default())
    }

    fn next_instruction(&self) -> Result<Option<String>> {
        Ok(self.instructions.borrow_mut().pop_front())
    }
}

/// Search double answering every query with the same report, or failing.
pub struct ScriptedSearch {
    report: Option<SearchReport>,
    queries: RefCell<Vec<(String, usize)>>,
}

impl ScriptedSearch {
    pub fn answering(report: SearchReport) -> Self {
        Self {
            report: Some(report),
            queries: RefCell::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            report: None,
            queries: RefCell::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<(String, usize)> {
        self.queries.borrow().clone()
    }
}

impl WebSearch for ScriptedSearch {
    fn search(&self, query: &str, max_sources: usize) -> Result<SearchReport> {
        self.queries
            .borrow_mut()
            .push((query.to_string(), max_sources));
        self.report
            .clone()
            .ok_or_else(|| anyhow!("search provider unavailable"))
    }
}
