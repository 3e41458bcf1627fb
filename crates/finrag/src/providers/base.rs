use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::conversation::Conversation;
use crate::models::message::AssistantResponse;
use crate::models::tool::Tool;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// A partial output event received while the model is still generating
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A fragment of the answer text
    TextDelta(String),
    /// A fragment of a tool call. `id` and `name` arrive on the first fragment for an
    /// index, the JSON arguments arrive in pieces afterwards.
    ToolCallDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// The model finished this response
    Done,
}

/// Incremental model output. Dropping the stream is how a consumer cancels it.
pub type ModelStream = BoxStream<'static, Result<ModelEvent>>;

#[derive(Debug, Error)]
#[error("Streaming is not supported by this provider")]
pub struct StreamingUnsupported;

/// Base trait for AI providers (OpenAI, Ollama, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next assistant response for the conversation so far
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[Tool],
    ) -> Result<(AssistantResponse, Usage)>;

    /// Generate the next assistant response incrementally
    async fn stream(&self, _conversation: &Conversation, _tools: &[Tool]) -> Result<ModelStream> {
        Err(StreamingUnsupported.into())
    }
}
