//! The human operator: status output, confirmations, questions and follow-up
//! instructions.

use anyhow::{Context, Result};
use dialoguer::console::Term;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input};

/// Answer to a confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Approved,
    /// Declined. A justification is passed to the model so it can choose
    /// another approach; without one the session stops.
    Declined { justification: Option<String> },
}

pub trait Operator {
    /// Shows a progress or status line.
    fn status(&self, message: &str);

    fn confirm(&self, prompt: &str) -> Result<Confirmation>;

    /// Asks a free-text question on behalf of the model.
    fn ask(&self, question: &str) -> Result<String>;

    /// Offers to continue after a finished task. `None` ends the session.
    fn next_instruction(&self) -> Result<Option<String>>;
}

/// Interactive terminal operator.
pub struct TerminalOperator {
    term: Term,
    theme: ColorfulTheme,
}

impl Default for TerminalOperator {
    fn default() -> Self {
        Self {
            term: Term::stdout(),
            theme: ColorfulTheme::default(),
        }
    }
}

impl TerminalOperator {
    /// Reads a multi-line goal, ending at the first empty line.
    pub fn read_goal(&self) -> Result<String> {
        self.term
            .write_line("Describe the goal (finish with an empty line):")
            .context("write goal prompt")?;
        let mut lines = Vec::new();
        loop {
            let line: String = Input::with_theme(&self.theme)
                .with_prompt(">")
                .allow_empty(true)
                .interact_text()
                .context("read goal line")?;
            if line.trim().is_empty() {
                break;
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }
}

impl Operator for TerminalOperator {
    fn status(&self, message: &str) {
        // status output is best effort; a closed terminal must not stop the run
        let _ = self.term.write_line(message);
    }

    fn confirm(&self, prompt: &str) -> Result<Confirmation> {
        let approved = Confirm::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(true)
            .interact()
            .context("read confirmation")?;
        if approved {
            return Ok(Confirmation::Approved);
        }
        let justification: String = Input::with_theme(&self.theme)
            .with_prompt("Why not? Suggest an alternative (empty to stop the agent)")
            .allow_empty(true)
            .interact_text()
            .context("read justification")?;
        let justification = justification.trim();
        Ok(Confirmation::Declined {
            justification: (!justification.is_empty()).then(|| justification.to_string()),
        })
    }

    fn ask(&self, question: &str) -> Result<String> {
        Input::with_theme(&self.theme)
            .with_prompt(question)
            .allow_empty(true)
            .interact_text()
            .context("read answer")
    }

    fn next_instruction(&self) -> Result<Option<String>> {
        let more = Confirm::with_theme(&self.theme)
            .with_prompt("Continue with a new instruction in the same session?")
            .default(false)
            .interact()
            .context("read continuation choice")?;
        if !more {
            return Ok(None);
        }
        let instruction = self.read_goal()?;
        Ok((!instruction.trim().is_empty()).then_some(instruction))
    }
}
