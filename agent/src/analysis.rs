//! Post-run deep analysis.
//!
//! After a successful `finish`, an analyst prompt reviews the goal, the plan,
//! every executed action and the conversation, and produces a Markdown
//! report. When the model is unavailable a short fallback report built from
//! the agent's own summary is returned instead.

use tracing::{info, instrument, warn};

use crate::core::plan::Plan;
use crate::core::types::Turn;
use crate::io::model::{Model, ResponseFormat};
use crate::io::prompt::{ANALYST_SYSTEM_PROMPT, AnalysisRequest, ExecutedStep, PromptEngine};

/// Max characters of conversation passed to the analyst.
const TRANSCRIPT_CHARS: usize = 12_000;

pub struct AnalysisInputs<'a> {
    pub goal: &'a str,
    pub summary: &'a str,
    pub goal_success: Option<bool>,
    pub plan: &'a Plan,
    pub steps: &'a [ExecutedStep],
    pub transcript: &'a [Turn],
}

#[instrument(skip_all, fields(steps = inputs.steps.len()))]
pub fn deep_analysis<M: Model + ?Sized>(
    model: &M,
    prompts: &PromptEngine,
    inputs: &AnalysisInputs<'_>,
) -> String {
    let request = AnalysisRequest {
        goal: inputs.goal,
        summary: inputs.summary,
        goal_success: inputs.goal_success,
        plan: inputs.plan.context_for_ai(),
        steps: inputs.steps,
        transcript: transcript_tail(inputs.transcript, TRANSCRIPT_CHARS),
    };
    let report = prompts
        .analysis_request(&request)
        .map_err(|err| warn!(%err, "failed to render analysis request"))
        .ok()
        .and_then(|prompt| model.send(ANALYST_SYSTEM_PROMPT, &prompt, ResponseFormat::Text))
        .map(|report| report.trim().to_string())
        .filter(|report| !report.is_empty());

    match report {
        Some(report) => {
            info!(chars = report.len(), "deep analysis complete");
            report
        }
        None => fallback_report(inputs.summary),
    }
}

fn fallback_report(summary: &str) -> String {
    format!(
        "## Analysis Unavailable\n\nThe detailed analysis could not be generated.\n\n**Agent Summary:**\n{}",
        summary.trim()
    )
}

/// Newest turns that fit in `limit` characters, oldest first. The system
/// prompt is left out.
fn transcript_tail(turns: &[Turn], limit: usize) -> String {
    let mut parts = Vec::new();
    let mut used = 0;
    for turn in turns.iter().skip(1).rev() {
        let line = format!("{}: {}", turn.role.as_str(), turn.content);
        let len = line.chars().count();
        if used + len > limit {
            break;
        }
        used += len;
        parts.push(line);
    }
    parts.reverse();
    parts.join("\n\n")
}
