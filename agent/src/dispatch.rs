//! Per-tool handling of decoded actions.
//!
//! Every handler turns its outcome into a feedback turn for the model.
//! Rejected, declined or failed actions are data, not errors; only
//! infrastructure failures (spawning a shell, talking to the operator,
//! saving the plan) propagate.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::action::{
    Action, AskUserAction, BashAction, Decoded, EditFileAction, FinishAction, TOOL_NAMES,
    UpdatePlanStepAction, WebSearchAction, action_batch, decode_action,
};
use crate::core::types::{Role, StopReason};
use crate::core::validator::validate_command;
use crate::io::files::FileOps;
use crate::io::model::Model;
use crate::io::operator::{Confirmation, Operator};
use crate::io::prompt::ExecutedStep;
use crate::io::shell::{Shell, is_connection_failure};
use crate::io::web_search::DEFAULT_MAX_SOURCES;
use crate::session::Agent;

/// What the control loop does after an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Go on with the next action of the batch.
    Continue,
    /// Skip the rest of the batch and ask the model for its next turn.
    EndTurn,
    Finished {
        summary: String,
        goal_success: Option<bool>,
    },
    Stop(StopReason),
}

const FAILURE_MENU: &str = "The command failed. Decide how to proceed:
1. RETRY the same command if the failure looks transient.
2. FIX the cause with a different command, then continue.
3. SKIP the current plan step with update_plan_step (status \"skipped\") if it is not needed.
4. FAIL the current plan step with update_plan_step (status \"failed\") if the goal cannot be reached this way.";

impl<M: Model, S: Shell, O: Operator> Agent<'_, M, S, O> {
    /// Dispatches every action of one parsed reply, in order.
    pub(crate) fn run_batch(&mut self, reply: &Value) -> Result<Flow> {
        let items = action_batch(reply);
        if items.is_empty() {
            self.feedback("Your reply contained no actions. Reply with a JSON action object or an array of them.");
            return Ok(Flow::EndTurn);
        }
        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            let position = index + 1;
            let more_pending = position < total;
            let flow = match decode_action(item) {
                Decoded::Action(action) => self.dispatch(action, more_pending)?,
                Decoded::UnknownTool(tool) => {
                    self.feedback(format!(
                        "Unknown tool '{tool}' in action {position}. Valid tools: {}.",
                        self.available_tools().join(", ")
                    ));
                    if more_pending { Flow::Continue } else { Flow::EndTurn }
                }
                Decoded::MissingTool => {
                    self.feedback(format!(
                        "Action {position} has no 'tool' field. Every action must name one of: {}.",
                        self.available_tools().join(", ")
                    ));
                    Flow::Continue
                }
                Decoded::NotAnObject => {
                    self.feedback(format!(
                        "Action {position} is not a JSON object and was ignored."
                    ));
                    Flow::Continue
                }
                Decoded::Malformed { tool, reason } => {
                    self.feedback(format!("Invalid '{tool}' action: {reason}"));
                    Flow::Continue
                }
            };
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
        Ok(Flow::EndTurn)
    }

    fn dispatch(&mut self, action: Action, more_pending: bool) -> Result<Flow> {
        if let Some(explain) = action.explain() {
            self.operator
                .status(&format!("[{}] {explain}", action.tool_name()));
        }
        match action {
            Action::Bash(bash) => self.run_bash(bash, more_pending),
            Action::WriteFile(write) => {
                let prompt = format!("Write {} bytes to {}?", write.content.len(), write.path);
                self.file_action("write_file", &write.path, &prompt, true, |files| {
                    files.write(&write.path, &write.content)
                })
            }
            Action::EditFile(edit) => self.edit_file(edit),
            Action::ReadFile(read) => {
                let prompt = format!("Read {}?", read.path);
                self.file_action("read_file", &read.path, &prompt, false, |files| {
                    files.read(&read.path, read.start_line, read.end_line)
                })
            }
            Action::ListDirectory(list) => {
                let prompt = format!(
                    "List {}{}?",
                    list.path,
                    if list.recursive { " recursively" } else { "" }
                );
                self.file_action("list_directory", &list.path, &prompt, false, |files| {
                    files.list(&list.path, list.recursive, list.pattern.as_deref())
                })
            }
            Action::CopyFile(copy) => {
                let prompt = format!("Copy {} to {}?", copy.source, copy.destination);
                let target = format!("{} -> {}", copy.source, copy.destination);
                self.file_action("copy_file", &target, &prompt, false, |files| {
                    files.copy(&copy.source, &copy.destination, copy.overwrite)
                })
            }
            Action::DeleteFile(delete) => {
                let prompt = format!(
                    "Delete {}{}?",
                    delete.path,
                    if delete.backup { " (keeping a backup)" } else { "" }
                );
                self.file_action("delete_file", &delete.path, &prompt, false, |files| {
                    files.delete(&delete.path, delete.backup)
                })
            }
            Action::AskUser(ask) => self.ask_user(ask),
            Action::UpdatePlanStep(update) => self.update_plan_step(update),
            Action::WebSearch(search) => Ok(self.web_search(search)),
            Action::Finish(finish) => Ok(self.finish(finish)),
        }
    }

    #[instrument(skip_all, fields(command = %action.command))]
    fn run_bash(&mut self, action: BashAction, more_pending: bool) -> Result<Flow> {
        let command = action.command.trim();
        if command.is_empty() {
            self.feedback("The 'bash' action needs a non-empty 'command'.");
            return Ok(Flow::Continue);
        }
        let timeout = match action.timeout {
            None => self.config.command_timeout(),
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
            Some(secs) => {
                self.feedback(format!(
                    "Invalid timeout {secs} for command '{command}': it must be a positive number of seconds."
                ));
                return Ok(Flow::Continue);
            }
        };

        if self.config.block_dangerous
            && let Err(reason) = validate_command(command)
        {
            warn!(%reason, "command rejected");
            self.operator
                .status(&format!("Blocked command '{command}': {reason}"));
            self.feedback(format!(
                "Command '{command}' was rejected by the safety validator and was not run: {reason}. Use a safer alternative."
            ));
            return Ok(Flow::EndTurn);
        }
        if let Some(flow) = self.confirm("bash", &format!("Run '{command}'?"))? {
            return Ok(flow);
        }

        self.operator.status(&format!("$ {command}"));
        let output = match self.shell.exec(command, timeout) {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "command could not be run");
                self.log_step("bash", command, "not run".to_string());
                self.plan
                    .note_failure(format!("'{command}' could not be run"));
                self.feedback(format!(
                    "Command '{command}' could not be run: {err:#}\n\n{FAILURE_MENU}"
                ));
                return Ok(Flow::EndTurn);
            }
        };
        info!(exit_code = output.exit_code, timed_out = output.timed_out, "command finished");
        self.log_step("bash", command, format!("exit code {}", output.exit_code));

        if self.shell.is_remote()
            && output.exit_code == 255
            && is_connection_failure(&output.output)
        {
            let detail = output
                .output
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("ssh exited with code 255")
                .to_string();
            return Ok(Flow::Stop(StopReason::ConnectionLost { detail }));
        }

        let mut text = format!("Command '{command}' executed with exit code {}", output.exit_code);
        if output.timed_out {
            text.push_str(&format!(
                " (killed after the {}s timeout)",
                timeout.as_secs_f64()
            ));
        }
        let shown = truncate_middle(&output.output, self.config.feedback_output_chars);
        if shown.trim().is_empty() {
            text.push_str(" and produced no output.");
        } else {
            text.push_str(":\n");
            text.push_str(&shown);
        }

        if output.success() {
            if let Some(number) = self.plan.advance(Some(command), "exit code 0") {
                text.push_str(&format!("\nPlan step {number} marked completed."));
            }
        } else {
            self.plan
                .note_failure(format!("'{command}' exited with code {}", output.exit_code));
            text.push_str("\n\n");
            text.push_str(FAILURE_MENU);
        }
        if more_pending {
            text.push_str("\nMoving on to the next action of this reply.");
        }
        self.persist_plan()?;
        self.feedback(text);
        Ok(Flow::Continue)
    }

    fn edit_file(&mut self, edit: EditFileAction) -> Result<Flow> {
        if let Err(reason) = edit.validate() {
            self.feedback(format!("Invalid 'edit_file' action: {reason}"));
            return Ok(Flow::Continue);
        }
        let prompt = format!("Edit {} ({})?", edit.path, edit.action.as_str());
        self.file_action("edit_file", &edit.path, &prompt, true, |files| {
            files.edit(&edit)
        })
    }

    /// Confirms and runs one file operation, feeding back its result as
    /// JSON. `advances_plan` file changes also move the plan forward.
    fn file_action<T, F>(
        &mut self,
        tool: &str,
        target: &str,
        prompt: &str,
        advances_plan: bool,
        op: F,
    ) -> Result<Flow>
    where
        T: Serialize,
        F: FnOnce(&FileOps<'_, S>) -> Result<T>,
    {
        if let Some(flow) = self.confirm(tool, prompt)? {
            return Ok(flow);
        }
        let files = FileOps::new(self.shell, self.config.command_timeout());
        match op(&files) {
            Ok(outcome) => {
                let body = serde_json::to_string_pretty(&outcome)
                    .with_context(|| format!("serialize {tool} result"))?;
                self.log_step(tool, target, "ok".to_string());
                let mut text = format!("{tool} succeeded:\n{body}");
                if advances_plan
                    && let Some(number) = self.plan.advance(None, format!("{tool} {target}"))
                {
                    text.push_str(&format!("\nPlan step {number} marked completed."));
                    self.persist_plan()?;
                }
                self.feedback(text);
            }
            Err(err) => {
                debug!(tool, err = %format!("{err:#}"), "file operation failed");
                self.log_step(tool, target, format!("failed: {err:#}"));
                if advances_plan {
                    self.plan.note_failure(format!("{tool} {target} failed"));
                    self.persist_plan()?;
                }
                self.feedback(format!("{tool} failed: {err:#}"));
            }
        }
        Ok(Flow::Continue)
    }

    fn ask_user(&mut self, ask: AskUserAction) -> Result<Flow> {
        if self.config.auto_accept {
            self.feedback(
                "ask_user is disabled in autonomous mode. Decide on your own with the information you have.",
            );
            return Ok(Flow::Continue);
        }
        let question = ask.question.trim();
        if question.is_empty() {
            self.feedback("The 'ask_user' action needs a non-empty 'question'.");
            return Ok(Flow::Continue);
        }
        let answer = self.operator.ask(question)?;
        let answer = answer.trim();
        let answer = if answer.is_empty() { "(no answer)" } else { answer };
        self.feedback(format!("User answer to '{question}':\n{answer}"));
        Ok(Flow::Continue)
    }

    fn update_plan_step(&mut self, update: UpdatePlanStepAction) -> Result<Flow> {
        let UpdatePlanStepAction {
            step,
            status,
            result,
        } = update;
        match self.plan.transition(step, status, result) {
            Ok(()) => {
                self.persist_plan()?;
                self.operator
                    .status(&format!("Plan step {step} -> {status}"));
                self.feedback(format!("Plan step {step} marked {status}."));
            }
            Err(err) => self.feedback(format!("Could not update the plan: {err}.")),
        }
        Ok(Flow::Continue)
    }

    fn web_search(&mut self, search: WebSearchAction) -> Flow {
        let Some(provider) = self.web_search else {
            self.feedback("web_search is not available in this session.");
            return Flow::Continue;
        };
        let query = search.query.trim();
        if query.is_empty() {
            self.feedback("The 'web_search' action needs a non-empty 'query'.");
            return Flow::Continue;
        }
        let max_sources = search.max_sources.unwrap_or(DEFAULT_MAX_SOURCES).max(1);
        self.operator.status(&format!("Searching the web: {query}"));
        match provider.search(query, max_sources) {
            Ok(report) => {
                self.log_step("web_search", query, format!("{} sources", report.sources.len()));
                self.feedback(report.render(query));
            }
            Err(err) => self.feedback(format!("web_search failed: {err:#}")),
        }
        Flow::Continue
    }

    /// Accepts `finish` only once no plan step is pending or in progress.
    fn finish(&mut self, finish: FinishAction) -> Flow {
        let open: Vec<String> = self
            .plan
            .open_steps()
            .map(|step| format!("step {} ({})", step.number, step.status))
            .collect();
        if !open.is_empty() {
            info!(open = open.len(), "finish refused: plan incomplete");
            self.feedback(format!(
                "Cannot finish yet: {} plan step(s) still pending or in progress: {}. Complete them, or mark each one failed or skipped with update_plan_step and a reason, then call finish again.",
                open.len(),
                open.join(", ")
            ));
            return Flow::EndTurn;
        }
        Flow::Finished {
            summary: finish.summary.trim().to_string(),
            goal_success: finish.goal_success,
        }
    }

    /// Asks the operator unless auto-accept is on. `Some` carries the flow to
    /// follow when the action must not run.
    fn confirm(&mut self, tool: &str, prompt: &str) -> Result<Option<Flow>> {
        if self.config.auto_accept {
            return Ok(None);
        }
        match self.operator.confirm(prompt)? {
            Confirmation::Approved => Ok(None),
            Confirmation::Declined {
                justification: Some(justification),
            } if !justification.trim().is_empty() => {
                self.feedback(format!(
                    "The user declined the {tool} action ({prompt}). Their reason: {}. Propose a different approach.",
                    justification.trim()
                ));
                Ok(Some(Flow::EndTurn))
            }
            Confirmation::Declined { .. } => Ok(Some(Flow::Stop(StopReason::UserCancelled))),
        }
    }

    fn available_tools(&self) -> Vec<&'static str> {
        TOOL_NAMES
            .iter()
            .copied()
            .filter(|tool| match *tool {
                "ask_user" => !self.config.auto_accept,
                "web_search" => self.web_search.is_some(),
                _ => true,
            })
            .collect()
    }

    fn log_step(&mut self, tool: &str, target: &str, outcome: String) {
        self.steps_log.push(ExecutedStep {
            tool: tool.to_string(),
            target: target.to_string(),
            outcome,
        });
    }

    fn feedback(&mut self, text: impl Into<String>) {
        self.context.append(Role::User, text);
    }
}

/// Keeps the head and tail of `text` when it exceeds `limit` characters.
fn truncate_middle(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let head = limit / 2;
    let tail = limit - head;
    let start: String = text.chars().take(head).collect();
    let end: String = text.chars().skip(total - tail).collect();
    format!(
        "{start}\n... [{} characters omitted] ...\n{end}",
        total - limit
    )
}
