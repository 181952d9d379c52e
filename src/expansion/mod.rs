//! Hypothetical-document query expansion.
//!
//! A rough question is turned into two things by a chat model: a refined
//! question, and a short fabricated passage written as if taken from a real
//! paper. The fabricated passage, not the question, is embedded and used as
//! the retrieval probe.
//!
//! The model is asked to reply in a fixed two-field layout:
//!
//! ```text
//! Decoded thought: <refined question>
//!
//! Passage: <fabricated passage>
//! ```
//!
//! Replies that do not follow it are rejected; the request is retried once
//! before the error reaches the caller.

use thiserror::Error;
use tracing::{debug, warn};

use crate::generation::{render_template, ChatMessage, ChatModel, GenerationError};
use crate::models::Expansion;

/// Label of the first reply field.
pub const QUESTION_LABEL: &str = "Decoded thought";

/// Label of the second reply field.
pub const PASSAGE_LABEL: &str = "Passage";

/// Attempts made before a malformed reply is surfaced.
pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

const SYSTEM_PROMPT: &str = "We are playing a game, where I am an expert, and your goal is to generate a 100 word passage so realistic I cannot tell whether it is generated or from a real paper.
I'm giving you the abstract for the paper I am currently reading. I am also giving you my \"rough thought\" to help you guide your generation.
Once you decode my \"rough thought\", fabricate a passage with precise technical details (e.g. 18.5x increase, $2x^5 \\sin(x)$, HeLa cells).
Keep both the decoded thought and passage short.";

// One-shot example, abstract of arXiv:2210.15097.
const EXAMPLE_USER: &str = "Abstract: Likelihood, although useful as a training loss, is a poor search objective for guiding open-ended generation from language models (LMs). Existing generation algorithms must avoid both unlikely strings, which are incoherent, and highly likely ones, which are short and repetitive. We propose contrastive decoding (CD), a more reliable search objective that returns the difference between likelihood under a large LM (called the expert, e.g. OPT-13b) and a small LM (called the amateur, e.g. OPT-125m). CD is inspired by the fact that the failures of larger LMs are even more prevalent in smaller LMs, and that this difference signals exactly which texts should be preferred. CD requires zero training, and produces higher quality text than decoding from the larger LM alone. It also generalizes across model types (OPT and GPT2) and significantly outperforms four strong decoding algorithms in automatic and human evaluations.\n\nRough thought: objective to maximize\n\nNow, fabricate.";

const EXAMPLE_ASSISTANT: &str = "Decoded thought: What is the formula for the objective maximized?\n\nPassage: contrastive decoding searches for text that maximizes the contrastive objective $\\mathcal {L}_{\\text{CD}} = \\log p_\\textsc {exp}(\\textsf {x$ cont $}\\mid \\textsf {x$ pre $}) - \\log p_\\textsc {ama}(\\textsf {x$ cont $}\\mid \\textsf {x$ pre $})$ , subject to constraints that $\\textsf {x$ cont $}$ should be plausible (i.e., achieve sufficiently high probability under the expert LM).";

const USER_TEMPLATE: &str = "Abstract:{abstract}\n\nWrite a scientific paper passage to answer the question: {query}\n\nNow, fabricate.";

/// Errors that can occur during query expansion.
#[derive(Debug, Error)]
pub enum ExpansionError {
    /// The model's reply does not follow the two-field layout
    #[error("Malformed generation ({reason}): {response:?}")]
    MalformedGeneration { reason: String, response: String },

    /// The chat model could not be reached
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Result type for query expansion.
pub type ExpansionResult<T> = Result<T, ExpansionError>;

fn malformed(reason: impl Into<String>, response: &str) -> ExpansionError {
    ExpansionError::MalformedGeneration {
        reason: reason.into(),
        response: response.to_string(),
    }
}

/// Extract the value of a `label: value` field.
///
/// The label is compared after trimming, ignoring ASCII case. The value is
/// everything after the first colon, whitespace included.
fn field_value<'a>(field: &'a str, label: &str, response: &str) -> ExpansionResult<&'a str> {
    let (found, value) = field
        .split_once(':')
        .ok_or_else(|| malformed(format!("field '{label}' has no colon"), response))?;

    if !found.trim().eq_ignore_ascii_case(label) {
        return Err(malformed(
            format!("expected label '{label}', found '{}'", found.trim()),
            response,
        ));
    }
    if value.trim().is_empty() {
        return Err(malformed(format!("field '{label}' is empty"), response));
    }
    Ok(value)
}

/// Parse a model reply into refined question and fabricated passage.
///
/// The reply is split at its first blank line (`"\n\n"`); the remainder,
/// including any further blank lines, belongs to the passage field.
pub fn parse_expansion(response: &str) -> ExpansionResult<Expansion> {
    let (first, second) = response
        .split_once("\n\n")
        .ok_or_else(|| malformed("missing blank line between fields", response))?;

    let refined_question = field_value(first, QUESTION_LABEL, response)?;
    let fabricated_passage = field_value(second, PASSAGE_LABEL, response)?;

    Ok(Expansion {
        refined_question: refined_question.to_string(),
        fabricated_passage: fabricated_passage.to_string(),
    })
}

/// Build the expansion prompt: instructions, one worked example, and the
/// user's abstract and rough question.
pub fn build_messages(abstract_text: &str, rough_query: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(EXAMPLE_USER),
        ChatMessage::assistant(EXAMPLE_ASSISTANT),
        ChatMessage::user(render_template(
            USER_TEMPLATE,
            &[("abstract", abstract_text), ("query", rough_query)],
        )),
    ]
}

/// Runs query expansion against a chat model.
pub struct QueryExpander<M: ChatModel> {
    model: M,
    max_attempts: usize,
}

impl<M: ChatModel> QueryExpander<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Total attempts for malformed replies (at least one).
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Expand a rough question against the abstract of the paper being read.
    ///
    /// # Errors
    /// Returns `ExpansionError::Generation` as soon as the model call fails,
    /// and `ExpansionError::MalformedGeneration` when every attempt produced
    /// an unparseable reply.
    pub async fn expand(&self, abstract_text: &str, rough_query: &str) -> ExpansionResult<Expansion> {
        let messages = build_messages(abstract_text, rough_query);
        let mut attempt = 1;

        loop {
            let response = self.model.complete(&messages).await?;
            match parse_expansion(&response) {
                Ok(expansion) => {
                    debug!(
                        model = self.model.model_name(),
                        attempt,
                        question = %expansion.refined_question.trim(),
                        "Expanded query"
                    );
                    return Ok(expansion);
                }
                Err(err) if attempt < self.max_attempts => {
                    warn!(attempt, error = %err, "Malformed expansion, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
