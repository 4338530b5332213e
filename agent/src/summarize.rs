//! Model-backed conversation summaries for the context store.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::context::Summarizer;
use crate::core::types::Turn;
use crate::io::model::{Model, ResponseFormat};
use crate::io::prompt::{PromptEngine, SUMMARIZER_SYSTEM_PROMPT};

/// Each turn is clipped to this many characters before summarization.
const TURN_CHARS: usize = 800;

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("fence regex is valid"));

/// [`Summarizer`] that delegates to a language model.
pub struct ModelSummarizer<'a, M: Model + ?Sized> {
    model: &'a M,
    prompts: &'a PromptEngine,
}

impl<'a, M: Model + ?Sized> ModelSummarizer<'a, M> {
    pub fn new(model: &'a M, prompts: &'a PromptEngine) -> Self {
        Self { model, prompts }
    }
}

impl<M: Model + ?Sized> Summarizer for ModelSummarizer<'_, M> {
    fn summarize(&self, previous: Option<&str>, turns: &[Turn]) -> Option<String> {
        let clipped: Vec<Turn> = turns
            .iter()
            .map(|turn| Turn::new(turn.role, clip(&turn.content, TURN_CHARS)))
            .collect();
        let request = match self.prompts.summary_request(previous, &clipped) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "failed to render summary request");
                return None;
            }
        };
        let reply = self
            .model
            .send(SUMMARIZER_SYSTEM_PROMPT, &request, ResponseFormat::Text)?;
        let cleaned = CODE_FENCE_RE.replace_all(&reply, "").trim().to_string();
        debug!(turns = turns.len(), chars = cleaned.len(), "model summary received");
        (!cleaned.is_empty()).then_some(cleaned)
    }
}

fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(limit).collect();
    clipped.push_str("...");
    clipped
}
