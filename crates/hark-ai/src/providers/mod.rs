//! LLM Provider implementations

pub mod openai;

use crate::{Context, Message, Model, Result};
use async_trait::async_trait;

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Request one complete assistant message for the given context.
    ///
    /// The returned message is always `Message::Assistant`; it may hold
    /// text, tool calls, or both.
    async fn complete(&self, model: &Model, context: &Context) -> Result<Message>;
}
