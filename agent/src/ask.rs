//! Ask mode: the model answers questions and nothing is executed.
//!
//! Questions and answers accumulate in a [`ContextStore`], so long chats are
//! bounded and summarized the same way as agent sessions.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::context::{ContextLimits, ContextStore};
use crate::core::types::Role;
use crate::io::model::{Model, ResponseFormat};
use crate::io::operator::Operator;
use crate::io::prompt::{ASK_SYSTEM_PROMPT, PromptEngine, render_window};
use crate::summarize::ModelSummarizer;

const QUIT_WORDS: &[&str] = &["exit", "quit"];

pub struct AskSession<'a, M: Model + ?Sized> {
    model: &'a M,
    prompts: PromptEngine,
    context: ContextStore,
    system_prompt: String,
}

impl<'a, M: Model + ?Sized> AskSession<'a, M> {
    /// `target` names the machine the questions are about.
    pub fn new(model: &'a M, limits: ContextLimits, target: &str) -> Self {
        let system_prompt = format!(
            "{}\nThe user works on: {target}.",
            ASK_SYSTEM_PROMPT.trim_end()
        );
        let mut context = ContextStore::new(limits);
        context.append(Role::System, system_prompt.clone());
        Self {
            model,
            prompts: PromptEngine::new(),
            context,
            system_prompt,
        }
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    /// Answer to `question` given the conversation so far, or `None` when the
    /// model gave no usable reply.
    #[instrument(skip_all)]
    pub fn answer(&mut self, question: &str) -> Option<String> {
        let question = question.trim();
        if question.is_empty() {
            return None;
        }
        self.context.append(Role::User, question);
        let summarizer = ModelSummarizer::new(self.model, &self.prompts);
        let window = self.context.window(&summarizer, None);
        let reply = self
            .model
            .send(&self.system_prompt, &render_window(&window), ResponseFormat::Text)
            .map(|reply| reply.trim().to_string())
            .filter(|reply| !reply.is_empty());
        match reply {
            Some(answer) => {
                self.context.append(Role::Assistant, answer.clone());
                Some(answer)
            }
            None => {
                warn!("model gave no answer");
                None
            }
        }
    }
}

/// Reads questions from the operator until an empty line, `exit` or `quit`,
/// showing each answer. Returns the number of questions answered.
pub fn chat<M: Model + ?Sized, O: Operator>(
    session: &mut AskSession<'_, M>,
    operator: &O,
) -> Result<usize> {
    operator.status(
        "Ask mode: questions are answered without running anything. \
         An empty line, 'exit' or 'quit' ends the chat.",
    );
    let mut answered = 0;
    loop {
        let question = operator.ask(">")?;
        let question = question.trim();
        if question.is_empty() || QUIT_WORDS.contains(&question.to_ascii_lowercase().as_str()) {
            break;
        }
        match session.answer(question) {
            Some(answer) => {
                answered += 1;
                operator.status(&answer);
            }
            None => operator.status("No response from the model."),
        }
    }
    info!(answered, "ask mode ended");
    Ok(answered)
}
