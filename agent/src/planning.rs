//! Initial plan creation.
//!
//! The planner model is asked for a step list; when it does not answer or
//! answers with something unusable the generic default plan is used, so a
//! session always starts with a plan.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::parser::parse_response;
use crate::core::plan::{Plan, PlanStep, StepSpec};
use crate::io::model::{Model, ResponseFormat};
use crate::io::plan_store::{PLANNER_RESPONSE_SCHEMA, load_plan, validate_schema};
use crate::io::prompt::{PLANNER_SYSTEM_PROMPT, PromptEngine};

const MAX_PLAN_STEPS: usize = 20;

#[derive(Debug, Deserialize)]
struct PlannerReply {
    steps: Vec<StepSpec>,
}

/// Where the active plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Model,
    Default,
}

/// Replaces `plan` with a model-generated plan for `goal`, or the default
/// plan when the model cannot provide one.
#[instrument(skip_all)]
pub fn create_plan_with_ai<'p, M: Model + ?Sized>(
    plan: &'p mut Plan,
    goal: &str,
    environment: Option<&str>,
    model: &M,
    prompts: &PromptEngine,
) -> (&'p [PlanStep], PlanSource) {
    match request_steps(goal, environment, model, prompts) {
        Ok(steps) => {
            info!(steps = steps.len(), "plan created by model");
            (plan.create(goal, steps), PlanSource::Model)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "falling back to the default plan");
            (plan.create(goal, Plan::default_steps(goal)), PlanSource::Default)
        }
    }
}

/// The plan saved at `path` when it belongs to `goal` and still has open
/// steps. Anything else (missing, unreadable, another goal, finished) means a
/// new plan is needed.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_saved_plan(path: &Path, goal: &str) -> Option<Plan> {
    if !path.exists() {
        return None;
    }
    match load_plan(path) {
        Ok(plan) if plan.goal.trim() != goal.trim() => {
            debug!(saved_goal = %plan.goal, "saved plan belongs to another goal");
            None
        }
        Ok(plan) if plan.is_empty() || plan.is_complete() => {
            debug!("saved plan has no open steps");
            None
        }
        Ok(plan) => Some(plan),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "ignoring unreadable saved plan");
            None
        }
    }
}

fn request_steps<M: Model + ?Sized>(
    goal: &str,
    environment: Option<&str>,
    model: &M,
    prompts: &PromptEngine,
) -> Result<Vec<StepSpec>> {
    let request = prompts.planner_request(goal, environment)?;
    let reply = model
        .send(PLANNER_SYSTEM_PROMPT, &request, ResponseFormat::Json)
        .context("planner model did not respond")?;
    let parsed = parse_response(&reply).context("planner reply is not JSON")?;
    // a bare array of steps is accepted as well
    let value = if parsed.value.is_array() {
        serde_json::json!({ "steps": parsed.value })
    } else {
        parsed.value
    };
    validate_schema(&value, PLANNER_RESPONSE_SCHEMA).context("planner reply has the wrong shape")?;
    let reply: PlannerReply = serde_json::from_value(value).context("decode planner reply")?;
    let mut steps: Vec<StepSpec> = reply
        .steps
        .into_iter()
        .filter(|step| !step.description.trim().is_empty())
        .collect();
    steps.truncate(MAX_PLAN_STEPS);
    anyhow::ensure!(!steps.is_empty(), "planner returned no usable steps");
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;

    #[test]
    fn uses_the_model_plan_when_valid() {
        let model = ScriptedModel::default().with_plan(
            r#"{"steps": [{"description": "inspect", "command": "uname -a"}, {"description": "install"}]}"#,
        );
        let mut plan = Plan::default();
        let (steps, source) =
            create_plan_with_ai(&mut plan, "install nginx", None, &model, &PromptEngine::new());
        assert_eq!(source, PlanSource::Model);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].command.as_deref(), Some("uname -a"));
        assert_eq!(plan.goal, "install nginx");
    }

    #[test]
    fn accepts_a_bare_step_array() {
        let model = ScriptedModel::default().with_plan(r#"[{"description": "only step"}]"#);
        let mut plan = Plan::default();
        let (steps, source) = create_plan_with_ai(&mut plan, "g", None, &model, &PromptEngine::new());
        assert_eq!(source, PlanSource::Model);
        assert_eq!(steps[0].description, "only step");
    }

    #[test]
    fn falls_back_to_the_default_plan() {
        for reply in [None, Some("no idea"), Some(r#"{"steps": []}"#)] {
            let model = match reply {
                Some(reply) => ScriptedModel::default().with_plan(reply),
                None => ScriptedModel::default(),
            };
            let mut plan = Plan::default();
            let (steps, source) =
                create_plan_with_ai(&mut plan, "deploy app", None, &model, &PromptEngine::new());
            assert_eq!(source, PlanSource::Default, "{reply:?}");
            let descriptions: Vec<&str> = steps.iter().map(|s| s.description.as_str()).collect();
            assert_eq!(
                descriptions,
                vec![
                    "Analyze the current system state relevant to: deploy app",
                    "Execute the commands needed to achieve the goal",
                    "Verify that the goal has been achieved",
                    "Summarize the results",
                ]
            );
        }
    }

    #[test]
    fn saved_plans_are_reused_only_for_the_same_open_goal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.json");
        assert!(load_saved_plan(&path, "deploy app").is_none());

        let mut plan = Plan::default();
        plan.create("deploy app", vec![StepSpec::new("build"), StepSpec::new("ship")]);
        plan.mark_step_completed(1, None);
        crate::io::plan_store::save_plan(&path, &plan).expect("save");

        let loaded = load_saved_plan(&path, " deploy app ").expect("same goal");
        assert_eq!(loaded, plan);
        assert!(load_saved_plan(&path, "rotate logs").is_none());

        plan.mark_step_completed(2, None);
        crate::io::plan_store::save_plan(&path, &plan).expect("save");
        assert!(load_saved_plan(&path, "deploy app").is_none());

        std::fs::write(&path, "{not json").expect("write");
        assert!(load_saved_plan(&path, "deploy app").is_none());
    }
}
