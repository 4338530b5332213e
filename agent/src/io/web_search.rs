//! Web research capability.
//!
//! Search providers are pluggable; a session without one reports
//! `web_search` as unavailable to the model. [`CommandSearch`] delegates to
//! an external program, the same way the model transport does.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::parser::parse_response;
use crate::io::process::run_command_with_timeout;

/// Default number of sources requested when the action does not say.
pub const DEFAULT_MAX_SOURCES: usize = 5;

/// Env var telling the search command how many sources to return.
pub const MAX_SOURCES_ENV: &str = "AGENT_SEARCH_MAX_SOURCES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSource {
    pub title: String,
    pub url: String,
}

/// Summarized result of a web search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchReport {
    pub summary: String,
    pub sources: Vec<SearchSource>,
}

impl SearchReport {
    /// Plain-text rendering fed back to the model.
    pub fn render(&self, query: &str) -> String {
        let mut out = format!("Web search results for '{query}':\n{}", self.summary.trim());
        if !self.sources.is_empty() {
            out.push_str("\n\nSources:");
            for (idx, source) in self.sources.iter().enumerate() {
                out.push_str(&format!("\n{}. {} - {}", idx + 1, source.title, source.url));
            }
        }
        out
    }
}

pub trait WebSearch {
    fn search(&self, query: &str, max_sources: usize) -> Result<SearchReport>;
}

/// Search provider that runs an external command.
///
/// The command reads the query on stdin, finds the source limit in
/// `AGENT_SEARCH_MAX_SOURCES`, and prints a JSON report
/// `{"summary": "...", "sources": [{"title": "...", "url": "..."}]}`.
#[derive(Debug, Clone)]
pub struct CommandSearch {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandSearch {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl WebSearch for CommandSearch {
    #[instrument(skip_all, fields(max_sources = max_sources))]
    fn search(&self, query: &str, max_sources: usize) -> Result<SearchReport> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("web search command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args).env(MAX_SOURCES_ENV, max_sources.to_string());
        debug!(query, "spawning web search command");

        let output = run_command_with_timeout(
            cmd,
            Some(query.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run web search command `{}`", self.command.join(" ")))?;
        if output.timed_out {
            bail!("web search timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            bail!(
                "web search command exited with code {}: {}",
                output.exit_code(),
                output.stderr_lossy().trim()
            );
        }

        let parsed = parse_response(&output.stdout_lossy()).context("web search reply is not JSON")?;
        let mut report: SearchReport =
            serde_json::from_value(parsed.value).context("web search reply has the wrong shape")?;
        report.sources.truncate(max_sources);
        if report.summary.trim().is_empty() && report.sources.is_empty() {
            bail!("web search returned no results");
        }
        Ok(report)
    }
}
