//! Typed actions decoded from parsed model replies.
//!
//! A reply is either a single action object or an array of them. Each object
//! is decoded independently into [`Decoded`], which keeps "no tool",
//! "unknown tool" and "known tool with bad fields" apart so the control loop
//! can give the model precise feedback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::StepStatus;

/// Tool names the control loop understands, in the order they are listed to
/// the model.
pub const TOOL_NAMES: &[&str] = &[
    "bash",
    "write_file",
    "edit_file",
    "read_file",
    "list_directory",
    "copy_file",
    "delete_file",
    "ask_user",
    "update_plan_step",
    "web_search",
    "finish",
];

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum Action {
    Bash(BashAction),
    WriteFile(WriteFileAction),
    EditFile(EditFileAction),
    ReadFile(ReadFileAction),
    ListDirectory(ListDirectoryAction),
    CopyFile(CopyFileAction),
    DeleteFile(DeleteFileAction),
    AskUser(AskUserAction),
    UpdatePlanStep(UpdatePlanStepAction),
    WebSearch(WebSearchAction),
    Finish(FinishAction),
}

impl Action {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Action::Bash(_) => "bash",
            Action::WriteFile(_) => "write_file",
            Action::EditFile(_) => "edit_file",
            Action::ReadFile(_) => "read_file",
            Action::ListDirectory(_) => "list_directory",
            Action::CopyFile(_) => "copy_file",
            Action::DeleteFile(_) => "delete_file",
            Action::AskUser(_) => "ask_user",
            Action::UpdatePlanStep(_) => "update_plan_step",
            Action::WebSearch(_) => "web_search",
            Action::Finish(_) => "finish",
        }
    }

    /// Optional free-text explanation the model attached to the action.
    pub fn explain(&self) -> Option<&str> {
        let explain = match self {
            Action::Bash(a) => &a.explain,
            Action::WriteFile(a) => &a.explain,
            Action::EditFile(a) => &a.explain,
            Action::ReadFile(a) => &a.explain,
            Action::ListDirectory(a) => &a.explain,
            Action::CopyFile(a) => &a.explain,
            Action::DeleteFile(a) => &a.explain,
            _ => return None,
        };
        explain.as_deref().filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BashAction {
    pub command: String,
    /// Per-command timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub explain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WriteFileAction {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub explain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Replace,
    InsertAfter,
    InsertBefore,
    DeleteLine,
}

impl EditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EditKind::Replace => "replace",
            EditKind::InsertAfter => "insert_after",
            EditKind::InsertBefore => "insert_before",
            EditKind::DeleteLine => "delete_line",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EditFileAction {
    pub path: String,
    pub action: EditKind,
    pub search: String,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub line: Option<String>,
    #[serde(default)]
    pub explain: Option<String>,
}

impl EditFileAction {
    /// Checks the field combinations serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.search.is_empty() {
            return Err("'search' must not be empty".to_string());
        }
        match self.action {
            EditKind::Replace if self.replace.is_none() => {
                Err("action 'replace' requires the 'replace' field".to_string())
            }
            EditKind::InsertAfter | EditKind::InsertBefore if self.line.is_none() => Err(format!(
                "action '{}' requires the 'line' field",
                self.action.as_str()
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReadFileAction {
    pub path: String,
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub end_line: Option<usize>,
    #[serde(default)]
    pub explain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListDirectoryAction {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub explain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CopyFileAction {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub explain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeleteFileAction {
    pub path: String,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub explain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AskUserAction {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpdatePlanStepAction {
    pub step: u32,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebSearchAction {
    pub query: String,
    #[serde(default)]
    pub max_sources: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FinishAction {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub goal_success: Option<bool>,
}

/// Outcome of decoding one action object.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Action(Action),
    /// The element is not a JSON object.
    NotAnObject,
    /// The object has no string `tool` field.
    MissingTool,
    UnknownTool(String),
    /// The tool is known but its fields do not fit.
    Malformed { tool: String, reason: String },
}

/// Decodes one action object.
pub fn decode_action(value: &Value) -> Decoded {
    let Some(object) = value.as_object() else {
        return Decoded::NotAnObject;
    };
    let Some(tool) = object.get("tool").and_then(Value::as_str) else {
        return Decoded::MissingTool;
    };
    let tool = tool.trim();
    if tool.is_empty() {
        return Decoded::MissingTool;
    }
    if !TOOL_NAMES.contains(&tool) {
        return Decoded::UnknownTool(tool.to_string());
    }
    match Action::deserialize(value) {
        Ok(action) => Decoded::Action(action),
        Err(err) => Decoded::Malformed {
            tool: tool.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Normalizes a parsed reply into the list of action elements to dispatch.
/// An object becomes a one-element batch; any other value yields nothing.
pub fn action_batch(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    }
}
