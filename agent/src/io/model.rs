//! Language model transport.
//!
//! [`Backend`] performs one request; [`RetryingModel`] wraps a backend with
//! linear backoff and exposes the [`Model`] contract the control loop uses:
//! a reply, or nothing once the retry budget is spent.

use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::parser::parse_response;
use crate::io::process::run_command_with_timeout;

/// Replies carrying these markers are treated as a transient outage.
const TRANSIENT_MARKERS: &[&str] = &[
    "503 service unavailable",
    "http 503",
    "\"code\":503",
    "\"code\": 503",
    "overloaded_error",
    "rate limit exceeded",
    "too many requests",
];

/// Env var telling the backend command which reply shape is expected.
pub const FORMAT_ENV: &str = "AGENT_RESPONSE_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Text,
}

impl ResponseFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::Text => "text",
        }
    }
}

/// Chat-style model as seen by the control loop.
pub trait Model {
    /// Sends one request. `None` means no usable reply after all retries.
    fn send(&self, system_prompt: &str, user_prompt: &str, format: ResponseFormat) -> Option<String>;
}

/// One model request with no retry logic.
pub trait Backend {
    fn complete(&self, system_prompt: &str, user_prompt: &str, format: ResponseFormat)
    -> Result<String>;
}

/// Backend that pipes the prompt into an external command.
///
/// The command receives the system prompt and the user prompt on stdin,
/// separated by a blank line, and must print the reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl Backend for CommandBackend {
    #[instrument(skip_all, fields(format = format.as_str()))]
    fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        format: ResponseFormat,
    ) -> Result<String> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("model command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args).env(FORMAT_ENV, format.as_str());
        let prompt = format!("{system_prompt}\n\n{user_prompt}");
        debug!(prompt_bytes = prompt.len(), "spawning model command");

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run model command `{}`", self.command.join(" ")))?;

        if output.timed_out {
            bail!("model command timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            bail!(
                "model command exited with code {}: {}",
                output.exit_code(),
                output.stderr_lossy().trim()
            );
        }
        Ok(output.stdout_lossy())
    }
}

/// [`Model`] that retries a [`Backend`] with linear backoff
/// (`base_delay * attempt`).
pub struct RetryingModel<B> {
    backend: B,
    max_attempts: u32,
    base_delay: Duration,
}

impl<B: Backend> RetryingModel<B> {
    pub fn new(backend: B, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn attempt(&self, system_prompt: &str, user_prompt: &str, format: ResponseFormat) -> Result<String> {
        let reply = self.backend.complete(system_prompt, user_prompt, format)?;
        let trimmed = reply.trim();
        if trimmed.is_empty() {
            bail!("model returned an empty reply");
        }
        if is_transient(trimmed) {
            bail!("model service temporarily unavailable");
        }
        if format == ResponseFormat::Json {
            // Hand back canonical JSON when it can be extracted; otherwise
            // the raw text goes to the caller, which asks for a correction.
            match parse_response(trimmed) {
                Ok(parsed) => return Ok(parsed.canonical),
                Err(err) => debug!(%err, "reply is not valid JSON; returning raw text"),
            }
        }
        Ok(trimmed.to_string())
    }
}

impl<B: Backend> Model for RetryingModel<B> {
    fn send(&self, system_prompt: &str, user_prompt: &str, format: ResponseFormat) -> Option<String> {
        for attempt in 1..=self.max_attempts {
            match self.attempt(system_prompt, user_prompt, format) {
                Ok(reply) => {
                    if attempt > 1 {
                        info!(attempt, "model request succeeded after retry");
                    }
                    return Some(reply);
                }
                Err(err) => {
                    warn!(attempt, max_attempts = self.max_attempts, err = %format!("{err:#}"), "model request failed");
                    if attempt < self.max_attempts {
                        let delay = self.base_delay * attempt;
                        debug!(delay_secs = delay.as_secs_f64(), "backing off before retry");
                        thread::sleep(delay);
                    }
                }
            }
        }
        warn!(max_attempts = self.max_attempts, "model unavailable after all attempts");
        None
    }
}

fn is_transient(reply: &str) -> bool {
    // Long replies are real content that merely mentions the markers.
    if reply.len() > 500 {
        return false;
    }
    let lower = reply.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}
