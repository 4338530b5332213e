//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between the context store, the plan
//! tracker and the control loop. They carry no I/O and serialize to stable
//! lowercase/snake_case forms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in the conversation. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub const ALL: [StepStatus; 5] = [
        StepStatus::Pending,
        StepStatus::InProgress,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Plain-text checkbox marker used when rendering the plan for the model.
    pub fn marker(self) -> &'static str {
        match self {
            StepStatus::Pending => "[ ]",
            StepStatus::InProgress => "[~]",
            StepStatus::Completed => "[x]",
            StepStatus::Failed => "[!]",
            StepStatus::Skipped => "[-]",
        }
    }

    /// Terminal statuses close a step; `finish` is accepted only when every
    /// step is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                format!(
                    "unknown step status '{s}' (expected one of: pending, in_progress, completed, failed, skipped)"
                )
            })
    }
}

/// Diagnostic record of one accepted model turn. Kept in a bounded ring buffer
/// for tracing only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub request_id: u64,
    pub step: u32,
    pub assistant_json: String,
}

/// Lifecycle state of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Planning,
    Running,
    AwaitingCorrection,
    Finished,
    Stopped,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model called `finish` and the plan was complete.
    Finished,
    /// The model produced nothing after the transport's retry budget.
    NoResponse,
    /// Several consecutive turns could not be parsed, even after correction.
    ParseFailure,
    /// The step limit was reached.
    MaxSteps { limit: u32 },
    /// The human declined an action and offered no way forward.
    UserCancelled,
    /// The remote host became unreachable.
    ConnectionLost { detail: String },
    /// An infrastructure error the loop cannot recover from.
    Internal { detail: String },
}

impl StopReason {
    /// Human-readable explanation printed when the run ends.
    pub fn describe(&self) -> String {
        match self {
            StopReason::Finished => "Agent finished the task.".to_string(),
            StopReason::NoResponse => {
                "Agent stopped: the model did not respond after retries.".to_string()
            }
            StopReason::ParseFailure => {
                "Agent stopped: the model failed to provide valid JSON even after correction requests."
                    .to_string()
            }
            StopReason::MaxSteps { limit } => {
                format!("Agent stopped: reached the step limit ({limit}).")
            }
            StopReason::UserCancelled => {
                "Agent stopped: action cancelled by the user.".to_string()
            }
            StopReason::ConnectionLost { detail } => {
                format!("Agent stopped: SSH connection failed (host offline or unreachable): {detail}")
            }
            StopReason::Internal { detail } => format!("Agent stopped: internal error: {detail}"),
        }
    }
}
