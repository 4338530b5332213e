//! Plan persistence with schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use crate::core::plan::Plan;

pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
pub const PLANNER_RESPONSE_SCHEMA: &str = include_str!("../../schemas/planner_response.schema.json");

/// Loads and validates a plan document.
pub fn load_plan(path: &Path) -> Result<Plan> {
    debug!(path = %path.display(), "loading plan");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", path.display()))?;
    validate_schema(&value, PLAN_SCHEMA).with_context(|| format!("validate plan {}", path.display()))?;
    let plan: Plan = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", path.display()))?;
    for (idx, step) in plan.steps.iter().enumerate() {
        if step.number as usize != idx + 1 {
            bail!(
                "plan {} has step number {} at position {}; steps must be numbered 1..n",
                path.display(),
                step.number,
                idx + 1
            );
        }
    }
    Ok(plan)
}

/// Atomically writes the plan to disk (temp file + rename).
pub fn save_plan(path: &Path, plan: &Plan) -> Result<()> {
    debug!(path = %path.display(), steps = plan.steps.len(), "writing plan");
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

/// Validates a JSON instance against a JSON Schema (Draft 2020-12).
pub fn validate_schema(instance: &Value, schema: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema).context("parse json schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
