//! Ordered action plan with per-step status.
//!
//! Step numbers are 1-based and contiguous. At most one step is
//! `in_progress` at a time; [`Plan::transition`] reports a conflict instead
//! of silently starting a second one. Timestamps are RFC 3339 strings so the
//! whole plan serializes as a stable JSON document.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::StepStatus;

/// Max characters of a step result echoed into the model prompt.
const RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub number: u32,
    pub description: String,
    #[serde(default)]
    pub command: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub timestamp_start: Option<String>,
    #[serde(default)]
    pub timestamp_end: Option<String>,
    /// Free-form operator notes; carried through load and save untouched.
    #[serde(default)]
    pub notes: Option<String>,
}

/// Description of a step before it is numbered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub description: String,
    #[serde(default)]
    pub command: Option<String>,
}

impl StepSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanProgress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Completed steps as an integer percentage of all steps.
    pub percentage: u32,
}

impl PlanProgress {
    pub fn open(&self) -> usize {
        self.pending + self.in_progress
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    UnknownStep(u32),
    AnotherInProgress { requested: u32, active: u32 },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::UnknownStep(number) => write!(f, "plan step {number} does not exist"),
            PlanError::AnotherInProgress { requested, active } => write!(
                f,
                "cannot start step {requested}: step {active} is already in progress; complete, fail or skip it first"
            ),
        }
    }
}

impl std::error::Error for PlanError {}

/// The plan document. Serializes to the persisted plan format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Generic analyze, execute, verify, summarize plan used when no better
    /// plan is available.
    pub fn default_steps(goal: &str) -> Vec<StepSpec> {
        vec![
            StepSpec::new(format!("Analyze the current system state relevant to: {goal}")),
            StepSpec::new("Execute the commands needed to achieve the goal"),
            StepSpec::new("Verify that the goal has been achieved"),
            StepSpec::new("Summarize the results"),
        ]
    }

    /// Replaces the plan with `steps`, all pending and numbered from 1.
    pub fn create(&mut self, goal: &str, steps: Vec<StepSpec>) -> &[PlanStep] {
        let now = timestamp();
        self.goal = goal.to_string();
        self.created_at = Some(now.clone());
        self.updated_at = Some(now);
        self.steps = steps
            .into_iter()
            .enumerate()
            .map(|(idx, spec)| PlanStep {
                number: idx as u32 + 1,
                description: spec.description,
                command: spec.command.filter(|c| !c.trim().is_empty()),
                status: StepStatus::Pending,
                result: None,
                timestamp_start: None,
                timestamp_end: None,
                notes: None,
            })
            .collect();
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, number: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.number == number)
    }

    /// Moves step `number` to `status`, stamping start/finish times. A
    /// `result`, when given, replaces the stored one.
    pub fn transition(
        &mut self,
        number: u32,
        status: StepStatus,
        result: Option<String>,
    ) -> Result<(), PlanError> {
        if status == StepStatus::InProgress {
            if let Some(active) = self.current_step().filter(|s| s.number != number) {
                return Err(PlanError::AnotherInProgress {
                    requested: number,
                    active: active.number,
                });
            }
        }
        let now = timestamp();
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.number == number)
            .ok_or(PlanError::UnknownStep(number))?;

        step.status = status;
        match status {
            StepStatus::InProgress => {
                step.timestamp_start.get_or_insert_with(|| now.clone());
                step.timestamp_end = None;
            }
            StepStatus::Pending => {
                step.timestamp_start = None;
                step.timestamp_end = None;
            }
            _ => step.timestamp_end = Some(now.clone()),
        }
        if let Some(result) = result {
            step.result = Some(result);
        }
        self.updated_at = Some(now);
        Ok(())
    }

    /// Lenient variant of [`Plan::transition`]: returns `false` instead of an
    /// error for unknown steps or a conflicting `in_progress`.
    pub fn mark_step_status(&mut self, number: u32, status: StepStatus, result: Option<String>) -> bool {
        self.transition(number, status, result).is_ok()
    }

    pub fn mark_step_in_progress(&mut self, number: u32) -> bool {
        self.mark_step_status(number, StepStatus::InProgress, None)
    }

    pub fn mark_step_completed(&mut self, number: u32, result: Option<String>) -> bool {
        self.mark_step_status(number, StepStatus::Completed, result)
    }

    pub fn mark_step_failed(&mut self, number: u32, result: Option<String>) -> bool {
        self.mark_step_status(number, StepStatus::Failed, result)
    }

    pub fn mark_step_skipped(&mut self, number: u32, result: Option<String>) -> bool {
        self.mark_step_status(number, StepStatus::Skipped, result)
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
    }

    pub fn next_pending_step(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Pending)
    }

    /// Steps that still block `finish`.
    pub fn open_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| !s.status.is_terminal())
    }

    pub fn is_complete(&self) -> bool {
        self.open_steps().next().is_none()
    }

    pub fn progress(&self) -> PlanProgress {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        let total = self.steps.len();
        let completed = count(StepStatus::Completed);
        let percentage = if total == 0 {
            0
        } else {
            (completed * 100 / total) as u32
        };
        PlanProgress {
            total,
            pending: count(StepStatus::Pending),
            in_progress: count(StepStatus::InProgress),
            completed,
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
            percentage,
        }
    }

    /// Records a successful action. The step whose planned command matches
    /// `command` is completed if there is one, otherwise the step in progress,
    /// otherwise the first pending step. The next pending step is then
    /// started. Returns the completed step number.
    pub fn advance(&mut self, command: Option<&str>, result: impl Into<String>) -> Option<u32> {
        let matched = command.and_then(|command| {
            self.steps
                .iter()
                .find(|s| {
                    !s.status.is_terminal()
                        && s.command.as_deref().map(str::trim) == Some(command.trim())
                })
                .map(|s| s.number)
        });
        let target = matched
            .or_else(|| self.current_step().map(|s| s.number))
            .or_else(|| self.next_pending_step().map(|s| s.number))?;

        self.transition(target, StepStatus::Completed, Some(result.into()))
            .ok()?;
        self.start_next();
        Some(target)
    }

    /// Notes a failed action on the step in progress (starting the next
    /// pending step if none is) without closing it. The model decides how
    /// to proceed.
    pub fn note_failure(&mut self, result: impl Into<String>) -> Option<u32> {
        self.start_next();
        let number = self.current_step()?.number;
        self.transition(number, StepStatus::InProgress, Some(result.into()))
            .ok()?;
        Some(number)
    }

    /// Picks a loaded plan back up: starts the first pending step unless a
    /// step is already in progress. Returns the step in progress.
    pub fn resume(&mut self) -> Option<u32> {
        self.start_next();
        self.current_step().map(|s| s.number)
    }

    fn start_next(&mut self) {
        if self.current_step().is_some() {
            return;
        }
        if let Some(number) = self.next_pending_step().map(|s| s.number) {
            self.mark_step_in_progress(number);
        }
    }

    /// Inserts a step after `after` (or appends it) and renumbers.
    pub fn add_step(&mut self, spec: StepSpec, after: Option<u32>) -> u32 {
        let index = after
            .and_then(|after| self.steps.iter().position(|s| s.number == after))
            .map_or(self.steps.len(), |idx| idx + 1);
        self.steps.insert(
            index,
            PlanStep {
                number: 0,
                description: spec.description,
                command: spec.command,
                status: StepStatus::Pending,
                result: None,
                timestamp_start: None,
                timestamp_end: None,
                notes: None,
            },
        );
        self.renumber();
        index as u32 + 1
    }

    pub fn remove_step(&mut self, number: u32) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| s.number != number);
        let removed = self.steps.len() != before;
        if removed {
            self.renumber();
        }
        removed
    }

    fn renumber(&mut self) {
        for (idx, step) in self.steps.iter_mut().enumerate() {
            step.number = idx as u32 + 1;
        }
        self.updated_at = Some(timestamp());
    }

    pub fn clear(&mut self) {
        *self = Plan::default();
    }

    /// Plain-text rendering embedded in the model prompt.
    pub fn context_for_ai(&self) -> String {
        if self.steps.is_empty() {
            return "No action plan has been created.".to_string();
        }
        let mut out = String::from("Current action plan:\n");
        if !self.goal.is_empty() {
            out.push_str(&format!("Goal: {}\n", self.goal));
        }
        for step in &self.steps {
            out.push_str(&format!(
                "{} Step {}: {} [{}]\n",
                step.status.marker(),
                step.number,
                step.description,
                step.status.as_str().to_uppercase()
            ));
            if let Some(command) = &step.command {
                out.push_str(&format!("    command: {command}\n"));
            }
            if let Some(result) = &step.result {
                let preview: String = result.chars().take(RESULT_PREVIEW_CHARS).collect();
                let ellipsis = if result.chars().count() > RESULT_PREVIEW_CHARS {
                    "..."
                } else {
                    ""
                };
                out.push_str(&format!("    result: {preview}{ellipsis}\n"));
            }
        }
        let progress = self.progress();
        out.push_str(&format!(
            "Progress: {}/{} completed ({}%), {} failed, {} skipped, {} open",
            progress.completed,
            progress.total,
            progress.percentage,
            progress.failed,
            progress.skipped,
            progress.open()
        ));
        out
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
