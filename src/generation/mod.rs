//! Generative language model abstraction.
//!
//! Query expansion and answer synthesis both talk to a chat-style model
//! through the [`ChatModel`] trait, so tests can substitute scripted fakes
//! for the hosted service.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when calling a chat model.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Network or API communication error
    #[error("API request failed: {0}")]
    ApiError(String),

    /// The service replied without any completion text
    #[error("Empty completion")]
    EmptyCompletion,

    /// Configuration error (e.g., missing API key)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Nothing to ground an answer on
    #[error("No passages to answer from")]
    NoPassages,
}

/// Result type for chat model operations.
pub type GenerationResult<T> = Result<T, GenerationError>;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Trait for chat completion services.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send the conversation and return the model's reply text.
    ///
    /// # Errors
    /// Returns `GenerationError` if the request fails or no text comes back
    async fn complete(&self, messages: &[ChatMessage]) -> GenerationResult<String>;

    /// Model identifier, for logging.
    fn model_name(&self) -> &str;
}

/// Lets expansion and synthesis share one client.
#[async_trait]
impl<M: ChatModel + ?Sized> ChatModel for std::sync::Arc<M> {
    async fn complete(&self, messages: &[ChatMessage]) -> GenerationResult<String> {
        (**self).complete(messages).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Substitute `{name}` placeholders in a prompt template.
///
/// Placeholders without a matching field are left untouched, and field
/// values are never re-scanned, so braces inside abstracts or LaTeX survive.
pub fn render_template(template: &str, fields: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after.find('}').and_then(|close| {
            let name = &after[..close];
            fields
                .iter()
                .find(|(field, _)| *field == name)
                .map(|(_, value)| (*value, close))
        });

        match replacement {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
