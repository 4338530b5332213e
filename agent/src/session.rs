//! The agent control loop.
//!
//! A session seeds the context with the system prompt and the goal, builds a
//! plan, then asks the model for one turn at a time until it finishes, a
//! hard stop condition hits or the step limit runs out. Replies that cannot
//! be parsed go through a bounded correction exchange that never reaches the
//! stored transcript.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::analysis::{AnalysisInputs, deep_analysis};
use crate::core::context::ContextStore;
use crate::core::parser::{ParseError, Parsed, parse_response};
use crate::core::plan::Plan;
use crate::core::types::{Role, SessionState, StopReason, Turn};
use crate::dispatch::Flow;
use crate::io::config::AgentConfig;
use crate::io::model::{Model, ResponseFormat};
use crate::io::operator::Operator;
use crate::io::plan_store::save_plan;
use crate::io::prompt::{
    ExecutedStep, HostFacts, PromptEngine, SystemPromptInputs, render_window,
};
use crate::io::shell::Shell;
use crate::io::web_search::WebSearch;
use crate::planning::{PlanSource, create_plan_with_ai, load_saved_plan};
use crate::summarize::ModelSummarizer;

/// Unparseable turns in a row (each after its correction exchange) before
/// the session gives up.
pub const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub stop: StopReason,
    /// Final human-readable summary: the model's own on `finish`, the stop
    /// explanation otherwise.
    pub summary: String,
    pub goal_success: Option<bool>,
    /// Model turns requested across all instructions.
    pub steps_taken: u32,
    /// Report of the last deep analysis pass, when one ran.
    pub analysis: Option<String>,
}

enum Ended {
    Finished {
        summary: String,
        goal_success: Option<bool>,
    },
    Stopped(StopReason),
}

pub struct Agent<'a, M: Model, S: Shell, O: Operator> {
    pub(crate) config: &'a AgentConfig,
    pub(crate) model: &'a M,
    pub(crate) summary_model: Option<&'a dyn Model>,
    pub(crate) shell: &'a S,
    pub(crate) operator: &'a O,
    pub(crate) web_search: Option<&'a dyn WebSearch>,
    pub(crate) host: HostFacts,
    pub(crate) prompts: PromptEngine,
    pub(crate) context: ContextStore,
    pub(crate) plan: Plan,
    pub(crate) steps_log: Vec<ExecutedStep>,
    pub(crate) state: SessionState,
    steps_taken: u32,
    system_prompt: String,
}

impl<'a, M: Model, S: Shell, O: Operator> Agent<'a, M, S, O> {
    pub fn new(config: &'a AgentConfig, model: &'a M, shell: &'a S, operator: &'a O) -> Self {
        Self {
            config,
            model,
            summary_model: None,
            shell,
            operator,
            web_search: None,
            host: HostFacts::default(),
            prompts: PromptEngine::new(),
            context: ContextStore::new(config.context_limits()),
            plan: Plan::default(),
            steps_log: Vec::new(),
            state: SessionState::Planning,
            steps_taken: 0,
            system_prompt: String::new(),
        }
    }

    pub fn with_web_search(mut self, search: &'a dyn WebSearch) -> Self {
        self.web_search = Some(search);
        self
    }

    /// Uses a separate model (usually with a smaller retry budget) for
    /// rolling summaries.
    pub fn with_summary_model(mut self, model: &'a dyn Model) -> Self {
        self.summary_model = Some(model);
        self
    }

    pub fn with_host_facts(mut self, host: HostFacts) -> Self {
        self.host = host;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn steps_log(&self) -> &[ExecutedStep] {
        &self.steps_log
    }

    /// Runs `goal` and any follow-up instructions to completion. Never fails:
    /// infrastructure errors end the session with [`StopReason::Internal`].
    #[instrument(skip_all, fields(target = %self.shell.describe()))]
    pub fn run(&mut self, goal: &str) -> SessionOutcome {
        let mut analysis = None;
        match self.run_inner(goal, &mut analysis) {
            Ok(Ended::Finished {
                summary,
                goal_success,
            }) => {
                self.state = SessionState::Finished;
                SessionOutcome {
                    stop: StopReason::Finished,
                    summary,
                    goal_success,
                    steps_taken: self.steps_taken,
                    analysis,
                }
            }
            Ok(Ended::Stopped(stop)) => self.stopped(stop, analysis),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "session aborted");
                self.stopped(
                    StopReason::Internal {
                        detail: format!("{err:#}"),
                    },
                    analysis,
                )
            }
        }
    }

    fn stopped(&mut self, stop: StopReason, analysis: Option<String>) -> SessionOutcome {
        self.state = SessionState::Stopped;
        let summary = stop.describe();
        self.operator.status(&summary);
        info!(stop = ?stop, steps = self.steps_taken, "session stopped");
        SessionOutcome {
            stop,
            summary,
            goal_success: None,
            steps_taken: self.steps_taken,
            analysis,
        }
    }

    fn run_inner(&mut self, goal: &str, analysis: &mut Option<String>) -> Result<Ended> {
        self.system_prompt = self.prompts.system_prompt(&SystemPromptInputs {
            target: &self.shell.describe(),
            remote: self.shell.is_remote(),
            environment: &self.host,
            auto_accept: self.config.auto_accept,
            web_search: self.web_search.is_some(),
        })?;
        self.context.append(Role::System, self.system_prompt.clone());
        self.context.append(Role::User, format!("Goal: {goal}"));

        let mut instruction = goal.to_string();
        loop {
            self.build_plan(&instruction)?;
            let (summary, goal_success) = match self.drive()? {
                Ended::Finished {
                    summary,
                    goal_success,
                } => (summary, goal_success),
                stopped @ Ended::Stopped(_) => return Ok(stopped),
            };

            self.state = SessionState::Finished;
            self.operator.status(&format!("Task finished: {summary}"));
            if self.config.deep_analysis {
                self.operator.status("Running the end-of-task analysis...");
                let report = deep_analysis(
                    self.model,
                    &self.prompts,
                    &AnalysisInputs {
                        goal: &instruction,
                        summary: &summary,
                        goal_success,
                        plan: &self.plan,
                        steps: &self.steps_log,
                        transcript: self.context.transcript(),
                    },
                );
                self.operator.status(&report);
                *analysis = Some(report);
            }

            match self.operator.next_instruction()? {
                Some(next) => {
                    info!("continuing with a new instruction");
                    self.context
                        .append(Role::User, format!("New instruction: {next}"));
                    instruction = next;
                }
                None => {
                    return Ok(Ended::Finished {
                        summary,
                        goal_success,
                    });
                }
            }
        }
    }

    fn build_plan(&mut self, instruction: &str) -> Result<()> {
        self.state = SessionState::Planning;
        let saved = self
            .config
            .plan_path
            .as_deref()
            .and_then(|path| load_saved_plan(path, instruction));
        if let Some(saved) = saved {
            self.resume_plan(saved);
            return self.persist_plan();
        }

        let environment = self.environment_line();
        let (steps, source) = create_plan_with_ai(
            &mut self.plan,
            instruction,
            Some(&environment),
            self.model,
            &self.prompts,
        );
        let count = steps.len();
        if source == PlanSource::Default {
            self.operator
                .status("The planner gave no usable plan; using the default plan.");
        }
        info!(steps = count, source = ?source, "plan ready");
        self.operator.status(&self.plan.context_for_ai());
        self.persist_plan()
    }

    fn resume_plan(&mut self, saved: Plan) {
        self.plan = saved;
        let current = self.plan.resume();
        let progress = self.plan.progress();
        info!(step = ?current, completed = progress.completed, "resuming the saved plan");
        let next = current.map_or_else(String::new, |step| format!(" Continue with step {step}."));
        let note = format!(
            "Resuming the saved plan: {} of {} step(s) already completed.{next}",
            progress.completed, progress.total
        );
        self.operator.status(&note);
        self.operator.status(&self.plan.context_for_ai());
        self.context.append(Role::User, note);
    }

    fn environment_line(&self) -> String {
        let mut parts = vec![format!("target: {}", self.shell.describe())];
        if let Some(distro) = &self.host.distro {
            parts.push(format!("distribution: {distro}"));
        }
        if let Some(user) = &self.host.user {
            parts.push(format!("user: {user}"));
        }
        parts.join(", ")
    }

    /// Step loop for one instruction.
    fn drive(&mut self) -> Result<Ended> {
        self.state = SessionState::Running;
        let limit = self.config.max_steps;
        let mut parse_failures = 0;

        for step in 1..=limit {
            self.steps_taken += 1;
            let rendered = self.next_prompt(step, limit);

            self.operator.status(&format!("Step {step}/{limit}: waiting for the model..."));
            let Some(reply) = self
                .model
                .send(&self.system_prompt, &rendered, ResponseFormat::Json)
            else {
                return Ok(Ended::Stopped(StopReason::NoResponse));
            };

            let parsed = match parse_response(&reply) {
                Ok(parsed) => Some(parsed),
                Err(err) => self.correct(&rendered, reply, err)?,
            };
            self.state = SessionState::Running;
            let Some(parsed) = parsed else {
                parse_failures += 1;
                if parse_failures >= MAX_CONSECUTIVE_PARSE_FAILURES {
                    return Ok(Ended::Stopped(StopReason::ParseFailure));
                }
                continue;
            };
            parse_failures = 0;

            debug!(step, strategy = parsed.strategy.as_str(), "model turn parsed");
            self.context.append(Role::Assistant, parsed.canonical.clone());
            self.context.record_request(step, parsed.canonical.clone());

            match self.run_batch(&parsed.value)? {
                Flow::Finished {
                    summary,
                    goal_success,
                } => {
                    return Ok(Ended::Finished {
                        summary,
                        goal_success,
                    });
                }
                Flow::Stop(reason) => return Ok(Ended::Stopped(reason)),
                Flow::Continue | Flow::EndTurn => {}
            }
        }
        Ok(Ended::Stopped(StopReason::MaxSteps { limit }))
    }

    fn next_prompt(&mut self, step: u32, limit: u32) -> String {
        let state = Value::String(format!(
            "Step {step} of {limit}\n{}",
            self.plan.context_for_ai()
        ));
        let window = match self.summary_model {
            Some(model) => bounded_window(&mut self.context, model, &self.prompts, &state),
            None => bounded_window(&mut self.context, self.model, &self.prompts, &state),
        };
        render_window(&window)
    }

    /// Asks the model to restate an unparseable reply as JSON. The exchange
    /// is appended to the rendered window only; on success just the corrected
    /// JSON is stored, on failure a diagnostic turn is.
    fn correct(&mut self, rendered: &str, reply: String, err: ParseError) -> Result<Option<Parsed>> {
        self.state = SessionState::AwaitingCorrection;
        let attempts = self.config.json_correction_attempts;
        let mut error = err.to_string();
        let mut scratch = vec![Turn::assistant(reply)];

        for attempt in 1..=attempts {
            warn!(attempt, attempts, "model reply is not JSON; requesting a correction");
            self.operator.status(&format!(
                "The model reply was not valid JSON; asking for a correction ({attempt}/{attempts})."
            ));
            scratch.push(Turn::user(self.prompts.correction_prompt(&error)?));
            let prompt = format!("{rendered}\n\n{}", render_window(&scratch));
            let Some(reply) = self
                .model
                .send(&self.system_prompt, &prompt, ResponseFormat::Json)
            else {
                error = "the model gave no reply".to_string();
                break;
            };
            match parse_response(&reply) {
                Ok(parsed) => return Ok(Some(parsed)),
                Err(err) => {
                    error = err.to_string();
                    scratch.push(Turn::assistant(reply));
                }
            }
        }

        self.context.append(
            Role::User,
            format!(
                "Your last reply could not be used: it was not valid JSON even after {attempts} correction request(s).\n{error}\nReply with one JSON action object, or an array of them, and nothing else."
            ),
        );
        Ok(None)
    }

    pub(crate) fn persist_plan(&self) -> Result<()> {
        match &self.config.plan_path {
            Some(path) => save_plan(path, &self.plan),
            None => Ok(()),
        }
    }
}

fn bounded_window<Sm: Model + ?Sized>(
    context: &mut ContextStore,
    model: &Sm,
    prompts: &PromptEngine,
    state: &Value,
) -> Vec<Turn> {
    let summarizer = ModelSummarizer::new(model, prompts);
    context.window(&summarizer, Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepStatus;
    use crate::test_support::{ScriptedModel, ScriptedOperator, ScriptedShell};

    const ONE_STEP_PLAN: &str = r#"{"steps": [{"description": "list files", "command": "ls /tmp"}]}"#;

    fn config() -> AgentConfig {
        AgentConfig {
            auto_accept: true,
            deep_analysis: false,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn seeds_the_context_with_system_prompt_and_goal() {
        let cfg = config();
        let model = ScriptedModel::default()
            .with_plan(ONE_STEP_PLAN)
            .with_reply(r#"{"tool": "bash", "command": "ls /tmp"}"#)
            .with_reply(r#"{"tool": "finish", "summary": "listed", "goal_success": true}"#);
        let shell = ScriptedShell::default().with_output("a\nb", 0);
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);

        let outcome = agent.run("list /tmp");
        assert_eq!(outcome.stop, StopReason::Finished);
        assert_eq!(outcome.summary, "listed");
        assert_eq!(outcome.goal_success, Some(true));
        assert_eq!(outcome.steps_taken, 2);
        assert_eq!(agent.state(), SessionState::Finished);

        let transcript = agent.context().transcript();
        assert_eq!(transcript[0].role, Role::System);
        assert_eq!(transcript[1].content, "Goal: list /tmp");
        assert_eq!(agent.plan().steps[0].status, StepStatus::Completed);
        assert_eq!(agent.context().request_history().count(), 2);
    }

    #[test]
    fn every_agent_prompt_carries_the_plan_state() {
        let cfg = config();
        let model = ScriptedModel::default()
            .with_plan(ONE_STEP_PLAN)
            .with_reply(r#"{"tool": "finish", "summary": "nothing to do"}"#)
            .with_reply(r#"{"tool": "update_plan_step", "step": 1, "status": "skipped"}"#)
            .with_reply(r#"{"tool": "finish", "summary": "nothing to do"}"#);
        let shell = ScriptedShell::default();
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);

        let outcome = agent.run("nothing");
        assert_eq!(outcome.stop, StopReason::Finished);
        let calls = model.agent_calls();
        assert_eq!(calls.len(), 3);
        for call in &calls {
            assert!(call.user.contains("[Persistent agent state]"));
            assert!(call.user.contains("Current action plan:"));
        }
    }

    #[test]
    fn silence_stops_with_no_response() {
        let cfg = config();
        let model = ScriptedModel::default().with_plan(ONE_STEP_PLAN).with_silence();
        let shell = ScriptedShell::default();
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);

        let outcome = agent.run("anything");
        assert_eq!(outcome.stop, StopReason::NoResponse);
        assert_eq!(agent.state(), SessionState::Stopped);
        assert!(operator.statuses().contains(&outcome.summary));
    }

    #[test]
    fn step_limit_stops_the_session() {
        let cfg = AgentConfig {
            max_steps: 2,
            ..config()
        };
        let model = ScriptedModel::default()
            .with_plan(ONE_STEP_PLAN)
            .with_reply(r#"{"tool": "bash", "command": "false"}"#)
            .with_reply(r#"{"tool": "bash", "command": "false"}"#);
        let shell = ScriptedShell::default()
            .with_output("", 1)
            .with_output("", 1);
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);

        let outcome = agent.run("loop forever");
        assert_eq!(outcome.stop, StopReason::MaxSteps { limit: 2 });
        assert_eq!(shell.commands().len(), 2);
    }

    #[test]
    fn follow_up_instruction_replans_in_the_same_context() {
        let cfg = config();
        let model = ScriptedModel::default()
            .with_plan(ONE_STEP_PLAN)
            .with_reply(r#"{"tool": "bash", "command": "ls /tmp"}"#)
            .with_reply(r#"{"tool": "finish", "summary": "first"}"#)
            .with_plan(r#"{"steps": [{"description": "show date", "command": "date"}]}"#)
            .with_reply(r#"{"tool": "bash", "command": "date"}"#)
            .with_reply(r#"{"tool": "finish", "summary": "second"}"#);
        let shell = ScriptedShell::default();
        let operator = ScriptedOperator::default().with_instruction("print the date");
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);

        let outcome = agent.run("list /tmp");
        assert_eq!(outcome.summary, "second");
        assert_eq!(outcome.steps_taken, 4);
        assert_eq!(shell.commands(), vec!["ls /tmp", "date"]);
        assert_eq!(agent.plan().goal, "print the date");
        assert!(
            agent
                .context()
                .transcript()
                .iter()
                .any(|t| t.content == "New instruction: print the date")
        );
    }

    #[test]
    fn deep_analysis_runs_after_finish_when_enabled() {
        let cfg = AgentConfig {
            deep_analysis: true,
            ..config()
        };
        let model = ScriptedModel::default()
            .with_plan(ONE_STEP_PLAN)
            .with_reply(r#"{"tool": "bash", "command": "ls /tmp"}"#)
            .with_reply(r#"{"tool": "finish", "summary": "listed"}"#)
            .with_text("## FINAL VERDICT\nfine");
        let shell = ScriptedShell::default();
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);

        let outcome = agent.run("list /tmp");
        assert_eq!(outcome.analysis.as_deref(), Some("## FINAL VERDICT\nfine"));
        assert!(operator.statuses().iter().any(|s| s.contains("FINAL VERDICT")));
    }

    #[test]
    fn saves_the_plan_after_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.json");
        let cfg = AgentConfig {
            plan_path: Some(path.clone()),
            ..config()
        };
        let model = ScriptedModel::default()
            .with_plan(ONE_STEP_PLAN)
            .with_reply(r#"{"tool": "bash", "command": "ls /tmp"}"#);
        let shell = ScriptedShell::default();
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);
        agent.run("list /tmp");

        let saved = crate::io::plan_store::load_plan(&path).expect("load plan");
        assert_eq!(saved.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn resumes_a_saved_plan_for_the_same_goal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.json");
        let mut saved = Plan::default();
        saved.create(
            "set up nginx",
            vec![
                crate::core::plan::StepSpec::new("install nginx"),
                crate::core::plan::StepSpec {
                    description: "start nginx".to_string(),
                    command: Some("systemctl start nginx".to_string()),
                },
            ],
        );
        saved.mark_step_completed(1, Some("installed".to_string()));
        save_plan(&path, &saved).expect("save");

        let cfg = AgentConfig {
            plan_path: Some(path.clone()),
            ..config()
        };
        let model = ScriptedModel::default()
            .with_reply(r#"{"tool": "bash", "command": "systemctl start nginx"}"#)
            .with_reply(r#"{"tool": "finish", "summary": "nginx running"}"#);
        let shell = ScriptedShell::default();
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);

        let outcome = agent.run("set up nginx");
        assert_eq!(outcome.stop, StopReason::Finished);
        // no planner request was made
        assert_eq!(model.calls().len(), model.agent_calls().len());
        assert_eq!(shell.commands(), vec!["systemctl start nginx"]);
        assert_eq!(agent.plan().steps[0].result.as_deref(), Some("installed"));
        assert!(
            agent
                .context()
                .transcript()
                .iter()
                .any(|t| t.content.starts_with("Resuming the saved plan: 1 of 2 step(s) already completed."))
        );
        let reloaded = crate::io::plan_store::load_plan(&path).expect("load plan");
        assert!(reloaded.is_complete());
    }

    #[test]
    fn a_saved_plan_for_another_goal_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.json");
        let mut saved = Plan::default();
        saved.create("something else", vec![crate::core::plan::StepSpec::new("old step")]);
        save_plan(&path, &saved).expect("save");

        let cfg = AgentConfig {
            plan_path: Some(path.clone()),
            ..config()
        };
        let model = ScriptedModel::default().with_plan(ONE_STEP_PLAN).with_silence();
        let shell = ScriptedShell::default();
        let operator = ScriptedOperator::default();
        let mut agent = Agent::new(&cfg, &model, &shell, &operator);
        agent.run("list /tmp");

        let reloaded = crate::io::plan_store::load_plan(&path).expect("load plan");
        assert_eq!(reloaded.goal, "list /tmp");
        assert_eq!(reloaded.steps[0].description, "list files");
    }
}
