//! Prompt rendering for the agent, planner, summarizer, analyst and ask mode.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::action::TOOL_NAMES;
use crate::core::types::{Role, Turn};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const PLANNER_REQUEST_TEMPLATE: &str = include_str!("prompts/planner_request.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");
const SUMMARY_REQUEST_TEMPLATE: &str = include_str!("prompts/summary_request.md");
const ANALYSIS_REQUEST_TEMPLATE: &str = include_str!("prompts/analysis_request.md");

pub const PLANNER_SYSTEM_PROMPT: &str = include_str!("prompts/planner.md");
pub const SUMMARIZER_SYSTEM_PROMPT: &str = include_str!("prompts/summarizer.md");
pub const ANALYST_SYSTEM_PROMPT: &str = include_str!("prompts/analyst.md");
pub const ASK_SYSTEM_PROMPT: &str = include_str!("prompts/ask.md");

/// Facts about the target host injected into the system prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFacts {
    pub distro: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ToolDoc {
    name: &'static str,
    description: &'static str,
    example: &'static str,
}

fn tool_doc(name: &'static str, web_search: bool) -> Option<ToolDoc> {
    let (description, example) = match name {
        "bash" => (
            "run a shell command; `timeout` in seconds is optional",
            r#"{"tool": "bash", "command": "systemctl status nginx", "timeout": 60, "explain": "check the service"}"#,
        ),
        "write_file" => (
            "create or overwrite a file",
            r#"{"tool": "write_file", "path": "/etc/motd", "content": "hello\n"}"#,
        ),
        "edit_file" => (
            "edit a file: `replace` substitutes text; `insert_after`, `insert_before` and `delete_line` act on lines containing `search`",
            r#"{"tool": "edit_file", "path": "/etc/nginx/nginx.conf", "action": "replace", "search": "worker_processes 1;", "replace": "worker_processes auto;"}"#,
        ),
        "read_file" => (
            "read a file, optionally a 1-based inclusive line range",
            r#"{"tool": "read_file", "path": "/var/log/syslog", "start_line": 1, "end_line": 50}"#,
        ),
        "list_directory" => (
            "list a directory, optionally recursive and filtered by a glob pattern",
            r#"{"tool": "list_directory", "path": "/etc/nginx", "recursive": true, "pattern": "*.conf"}"#,
        ),
        "copy_file" => (
            "copy a file or directory",
            r#"{"tool": "copy_file", "source": "/etc/hosts", "destination": "/tmp/hosts.bak", "overwrite": false}"#,
        ),
        "delete_file" => (
            "delete a file or directory, optionally keeping a timestamped backup",
            r#"{"tool": "delete_file", "path": "/tmp/build", "backup": true}"#,
        ),
        "ask_user" => (
            "ask the user a question and wait for the answer",
            r#"{"tool": "ask_user", "question": "Which domain should nginx serve?"}"#,
        ),
        "update_plan_step" => (
            "set a plan step to pending, in_progress, completed, failed or skipped",
            r#"{"tool": "update_plan_step", "step": 2, "status": "skipped", "result": "already installed"}"#,
        ),
        "web_search" if web_search => (
            "search the web and get a summary with sources",
            r#"{"tool": "web_search", "query": "nginx reload without downtime", "max_sources": 3}"#,
        ),
        "finish" => (
            "end the task once every plan step is closed",
            r#"{"tool": "finish", "summary": "nginx installed and serving on port 80", "goal_success": true}"#,
        ),
        _ => return None,
    };
    Some(ToolDoc {
        name,
        description,
        example,
    })
}

/// Inputs for the agent's system prompt.
#[derive(Debug, Clone)]
pub struct SystemPromptInputs<'a> {
    pub target: &'a str,
    pub remote: bool,
    pub environment: &'a HostFacts,
    pub auto_accept: bool,
    pub web_search: bool,
}

/// Inputs for the post-run analysis request.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest<'a> {
    pub goal: &'a str,
    pub summary: &'a str,
    pub goal_success: Option<bool>,
    pub plan: String,
    pub steps: &'a [ExecutedStep],
    pub transcript: String,
}

/// One executed action, as recorded for the analyst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedStep {
    pub tool: String,
    pub target: String,
    pub outcome: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("planner_request", PLANNER_REQUEST_TEMPLATE)
            .expect("planner request template should be valid");
        env.add_template("correction", CORRECTION_TEMPLATE)
            .expect("correction template should be valid");
        env.add_template("summary_request", SUMMARY_REQUEST_TEMPLATE)
            .expect("summary request template should be valid");
        env.add_template("analysis_request", ANALYSIS_REQUEST_TEMPLATE)
            .expect("analysis request template should be valid");
        Self { env }
    }

    pub fn system_prompt(&self, input: &SystemPromptInputs<'_>) -> Result<String> {
        let tools: Vec<ToolDoc> = TOOL_NAMES
            .iter()
            .copied()
            .filter(|name| !(input.auto_accept && *name == "ask_user"))
            .filter_map(|name| tool_doc(name, input.web_search))
            .collect();
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            target => input.target,
            remote => input.remote,
            distro => input.environment.distro.as_deref(),
            user => input.environment.user.as_deref(),
            auto_accept => input.auto_accept,
            tools => tools,
        })?;
        Ok(rendered)
    }

    pub fn planner_request(&self, goal: &str, environment: Option<&str>) -> Result<String> {
        let template = self.env.get_template("planner_request")?;
        let rendered = template.render(context! {
            goal => goal.trim(),
            environment => environment.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn correction_prompt(&self, error: &str) -> Result<String> {
        let template = self.env.get_template("correction")?;
        Ok(template.render(context! { error => error.trim() })?)
    }

    pub fn summary_request(&self, previous: Option<&str>, turns: &[Turn]) -> Result<String> {
        let template = self.env.get_template("summary_request")?;
        let rendered = template.render(context! {
            previous => previous.map(str::trim).filter(|s| !s.is_empty()),
            turns => turns,
        })?;
        Ok(rendered)
    }

    pub fn analysis_request(&self, request: &AnalysisRequest<'_>) -> Result<String> {
        let template = self.env.get_template("analysis_request")?;
        Ok(template.render(context! {
            goal => request.goal,
            summary => request.summary,
            goal_success => request.goal_success,
            plan => request.plan,
            steps => request.steps,
            transcript => request.transcript,
        })?)
    }
}

/// Flattens a prompt window into the user prompt. The leading system prompt
/// is sent separately, so it is skipped here.
pub fn render_window(turns: &[Turn]) -> String {
    let body = match turns.first() {
        Some(first) if first.role == Role::System => &turns[1..],
        _ => turns,
    };
    body.iter()
        .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(env: &'a HostFacts, auto_accept: bool, web_search: bool) -> SystemPromptInputs<'a> {
        SystemPromptInputs {
            target: "root@web1",
            remote: true,
            environment: env,
            auto_accept,
            web_search,
        }
    }

    #[test]
    fn system_prompt_lists_available_tools() {
        let engine = PromptEngine::new();
        let env = HostFacts {
            distro: Some("Ubuntu 24.04 LTS".to_string()),
            user: Some("root".to_string()),
        };
        let prompt = engine.system_prompt(&inputs(&env, false, false)).expect("render");
        assert!(prompt.contains("root@web1 (remote host over SSH)"));
        assert!(prompt.contains("Ubuntu 24.04 LTS"));
        assert!(prompt.contains("no sudo needed"));
        assert!(prompt.contains("`ask_user`"));
        assert!(prompt.contains("`finish`"));
        assert!(!prompt.contains("`web_search`"));
    }

    #[test]
    fn autonomous_mode_hides_ask_user() {
        let engine = PromptEngine::new();
        let prompt = engine
            .system_prompt(&inputs(&HostFacts::default(), true, true))
            .expect("render");
        assert!(!prompt.contains("`ask_user`"));
        assert!(prompt.contains("`web_search`"));
        assert!(prompt.contains("autonomous"));
    }

    #[test]
    fn summary_request_includes_previous_summary_and_turns() {
        let engine = PromptEngine::new();
        let turns = vec![Turn::assistant("{\"tool\":\"bash\"}"), Turn::user("exit code 0")];
        let text = engine
            .summary_request(Some("- nginx installed"), &turns)
            .expect("render");
        assert!(text.contains("Current summary:\n- nginx installed"));
        assert!(text.contains("[assistant] {\"tool\":\"bash\"}"));
        assert!(text.contains("[user] exit code 0"));

        let first = engine.summary_request(None, &turns).expect("render");
        assert!(first.starts_with("Summarize these turns:"));
    }

    #[test]
    fn analysis_request_lists_steps() {
        let engine = PromptEngine::new();
        let steps = vec![ExecutedStep {
            tool: "bash".to_string(),
            target: "apt-get install -y nginx".to_string(),
            outcome: "exit code 0".to_string(),
        }];
        let text = engine
            .analysis_request(&AnalysisRequest {
                goal: "install nginx",
                summary: "done",
                goal_success: Some(true),
                plan: "Current action plan:".to_string(),
                steps: &steps,
                transcript: "user: hi".to_string(),
            })
            .expect("render");
        assert!(text.contains("1. [bash] apt-get install -y nginx -> exit code 0"));
        assert!(text.contains("goal_success = true"));
    }

    #[test]
    fn window_rendering_skips_the_system_prompt() {
        let turns = vec![
            Turn::system("system prompt"),
            Turn::user("goal"),
            Turn::system("[Conversation memory]\nx"),
        ];
        assert_eq!(
            render_window(&turns),
            "user: goal\n\nsystem: [Conversation memory]\nx"
        );
    }
}
