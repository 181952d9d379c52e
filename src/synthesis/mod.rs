//! Answer synthesis.
//!
//! Sends the abstract, the refined question and the retrieved passages to a
//! chat model and returns its Markdown answer unchanged.

use tracing::debug;

use crate::generation::{
    render_template, ChatMessage, ChatModel, GenerationError, GenerationResult,
};

const SYSTEM_PROMPT: &str = "You are taking a technical writing assessment, where you are provided the following:
    1. The abstract for a research paper.
    2. A question to be answered about the research paper.
    3. Full length passages from the paper that are relevant to answering the question.

To achieve a high score, you must:
    1. Produce a factual answer to the question asked. Your answer should be in formatted Markdown.
    2. Seamlessly integrate information from the passages provided. Such information may include equations, quotes and technical acronyms.
    3. Ensure your answer is concise and clear. Do not add unnecessary detail beyond what is strictly needed, as this may confuse your examiner.";

const USER_TEMPLATE: &str = "Paper Abstract: {abstract}
Question: {question}
Relevant passages: {retr_passages}

Using the instructions provided, answer the question.";

/// Render retrieved passages as one numbered block, one passage per line.
pub fn format_passages<S: AsRef<str>>(passages: &[S]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, passage)| format!("Passage {i} - <<{}>>", passage.as_ref()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the synthesis prompt.
pub fn build_messages<S: AsRef<str>>(
    abstract_text: &str,
    question: &str,
    passages: &[S],
) -> Vec<ChatMessage> {
    let block = format_passages(passages);
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(render_template(
            USER_TEMPLATE,
            &[
                ("abstract", abstract_text),
                ("question", question),
                ("retr_passages", &block),
            ],
        )),
    ]
}

/// Produces final answers with a chat model.
pub struct AnswerSynthesizer<M: ChatModel> {
    model: M,
}

impl<M: ChatModel> AnswerSynthesizer<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// Answer `question` from the abstract and the retrieved passages.
    ///
    /// An empty passage list is rejected without calling the model.
    pub async fn synthesize<S: AsRef<str> + Sync>(
        &self,
        abstract_text: &str,
        question: &str,
        passages: &[S],
    ) -> GenerationResult<String> {
        if passages.is_empty() {
            return Err(GenerationError::NoPassages);
        }
        let messages = build_messages(abstract_text, question, passages);
        debug!(
            model = self.model.model_name(),
            passages = passages.len(),
            "Synthesizing answer"
        );
        self.model.complete(&messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::generation::Role;

    struct EchoModel {
        last_prompt: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn complete(&self, messages: &[ChatMessage]) -> GenerationResult<String> {
            let user = messages
                .last()
                .map(|m| m.content.clone())
                .ok_or(GenerationError::EmptyCompletion)?;
            *self.last_prompt.lock().unwrap() = Some(user);
            Ok("**Answer** with $x^2$".to_string())
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    #[test]
    fn test_format_passages_numbered_from_zero() {
        let block = format_passages(&["first", "second"]);
        assert_eq!(block, "Passage 0 - <<first>>\nPassage 1 - <<second>>");
    }

    #[test]
    fn test_format_passages_empty() {
        let empty: [&str; 0] = [];
        assert_eq!(format_passages(&empty), "");
    }

    #[test]
    fn test_build_messages_fields() {
        let messages = build_messages("The abstract.", " What is CD?", &["p0"]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(
            messages[1].content,
            "Paper Abstract: The abstract.\nQuestion:  What is CD?\nRelevant passages: Passage 0 - <<p0>>\n\nUsing the instructions provided, answer the question."
        );
    }

    #[tokio::test]
    async fn test_synthesize_returns_response_verbatim() {
        let synthesizer = AnswerSynthesizer::new(EchoModel {
            last_prompt: Mutex::new(None),
        });
        let passages = vec!["alpha".to_string(), "beta".to_string()];

        let answer = synthesizer.synthesize("abs", "q", &passages).await.unwrap();
        assert_eq!(answer, "**Answer** with $x^2$");

        let prompt = synthesizer.model.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Passage 1 - <<beta>>"));
    }

    #[tokio::test]
    async fn test_synthesize_rejects_empty_passages() {
        let synthesizer = AnswerSynthesizer::new(EchoModel {
            last_prompt: Mutex::new(None),
        });
        let passages: Vec<String> = Vec::new();

        let result = synthesizer.synthesize("abs", "q", &passages).await;
        assert!(matches!(result, Err(GenerationError::NoPassages)));
        assert!(synthesizer.model.last_prompt.lock().unwrap().is_none());
    }
}
