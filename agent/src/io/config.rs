//! Agent configuration stored as TOML.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! A handful of `AGENT_*` environment variables override the file for quick
//! one-off runs.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::context::ContextLimits;

pub const ENV_AUTO_ACCEPT: &str = "AGENT_AUTO_ACCEPT";
pub const ENV_BLOCK_DANGEROUS: &str = "AGENT_BLOCK_DANGEROUS";
pub const ENV_MAX_STEPS: &str = "AGENT_MAX_STEPS";
pub const ENV_MODEL_COMMAND: &str = "AGENT_MODEL_COMMAND";

/// Agent configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Run every action without asking for confirmation. Also disables
    /// `ask_user`.
    pub auto_accept: bool,

    /// Run commands through the safety validator before execution.
    pub block_dangerous: bool,

    /// Upper bound on model turns per instruction.
    pub max_steps: u32,

    /// Trailing turns kept verbatim in each prompt.
    pub window_size: usize,

    /// Aged-out turns required before the rolling summary is refreshed.
    pub min_messages_before_summary: usize,

    pub summary_char_limit: usize,

    pub max_request_history: usize,

    /// Default per-command timeout for `bash` actions.
    pub command_timeout_secs: u64,

    /// Truncate captured command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Max characters of command output echoed back to the model.
    pub feedback_output_chars: usize,

    /// Correction requests sent before a malformed reply is given up on.
    pub json_correction_attempts: u32,

    /// Run the deep analysis pass after `finish`.
    pub deep_analysis: bool,

    /// Persist the plan here after every change.
    pub plan_path: Option<PathBuf>,

    pub model: ModelConfig,

    pub web_search: WebSearchConfig,
}

/// External web search provider. An empty command disables `web_search`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebSearchConfig {
    /// Command that reads a query on stdin and prints a JSON report.
    pub command: Vec<String>,

    pub timeout_secs: u64,

    pub output_limit_bytes: usize,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
            output_limit_bytes: 200_000,
        }
    }
}

impl WebSearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.command.first().is_some_and(|program| !program.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command that reads a prompt on stdin and prints the reply on stdout
    /// (e.g. `["llm", "-m", "gpt-4o"]`).
    pub command: Vec<String>,

    pub timeout_secs: u64,

    /// Attempts per request, including the first.
    pub max_attempts: u32,

    /// Backoff before retry `n` is `base_delay_secs * n`.
    pub base_delay_secs: u64,

    /// Attempts per summarization request.
    pub summary_max_attempts: u32,

    pub output_limit_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            timeout_secs: 5 * 60,
            max_attempts: 5,
            base_delay_secs: 10,
            summary_max_attempts: 2,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        let limits = ContextLimits::default();
        Self {
            auto_accept: false,
            block_dangerous: true,
            max_steps: 100,
            window_size: limits.window_size,
            min_messages_before_summary: limits.min_messages_before_summary,
            summary_char_limit: limits.summary_char_limit,
            max_request_history: limits.max_request_history,
            command_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            feedback_output_chars: 8_000,
            json_correction_attempts: 3,
            deep_analysis: true,
            plan_path: None,
            model: ModelConfig::default(),
            web_search: WebSearchConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.window_size == 0 {
            return Err(anyhow!("window_size must be > 0"));
        }
        if self.summary_char_limit == 0 {
            return Err(anyhow!("summary_char_limit must be > 0"));
        }
        if self.max_request_history == 0 {
            return Err(anyhow!("max_request_history must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.feedback_output_chars == 0 {
            return Err(anyhow!("feedback_output_chars must be > 0"));
        }
        if self.json_correction_attempts == 0 {
            return Err(anyhow!("json_correction_attempts must be > 0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.max_attempts == 0 || self.model.summary_max_attempts == 0 {
            return Err(anyhow!(
                "model.max_attempts and model.summary_max_attempts must be > 0"
            ));
        }
        if self.model.output_limit_bytes == 0 {
            return Err(anyhow!("model.output_limit_bytes must be > 0"));
        }
        if !self.web_search.command.is_empty() && !self.web_search.is_enabled() {
            return Err(anyhow!("web_search.command must start with a program name"));
        }
        if self.web_search.timeout_secs == 0 {
            return Err(anyhow!("web_search.timeout_secs must be > 0"));
        }
        if self.web_search.output_limit_bytes == 0 {
            return Err(anyhow!("web_search.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn context_limits(&self) -> ContextLimits {
        ContextLimits {
            window_size: self.window_size,
            min_messages_before_summary: self.min_messages_before_summary,
            summary_char_limit: self.summary_char_limit,
            max_request_history: self.max_request_history,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Applies `AGENT_*` overrides from `lookup` (usually the process
    /// environment).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_AUTO_ACCEPT) {
            self.auto_accept = parse_bool(ENV_AUTO_ACCEPT, &value)?;
        }
        if let Some(value) = lookup(ENV_BLOCK_DANGEROUS) {
            self.block_dangerous = parse_bool(ENV_BLOCK_DANGEROUS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_STEPS) {
            self.max_steps = value
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_STEPS} must be a positive integer"))?;
        }
        if let Some(value) = lookup(ENV_MODEL_COMMAND) {
            self.model.command = value.split_whitespace().map(str::to_string).collect();
        }
        debug!(?self, "configuration after environment overrides");
        self.validate()
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{name} must be a boolean, got '{other}'")),
    }
}

/// Loads config from a TOML file, then applies environment overrides.
///
/// If the file is missing, starts from `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let mut cfg = read_config_file(path)?;
    cfg.apply_env_overrides(|name| env::var(name).ok())?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically writes config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
