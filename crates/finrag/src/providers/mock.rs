use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::models::conversation::Conversation;
use crate::models::message::AssistantResponse;
use crate::models::tool::Tool;
use crate::providers::base::{ModelEvent, ModelStream, Provider, StreamingUnsupported, Usage};

pub type ScriptedStream = Result<Vec<Result<ModelEvent, String>>, String>;

/// A mock provider that returns pre-configured responses for testing
///
/// Completions are served in order; once the script runs out an empty final answer is
/// returned. Streaming is unsupported unless streams were scripted with
/// [`MockProvider::with_streams`].
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<AssistantResponse, String>>>,
    streams: Option<Mutex<VecDeque<ScriptedStream>>>,
    conversations: Mutex<Vec<Conversation>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<AssistantResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            streams: None,
            conversations: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next unscripted completion with the given message
    pub fn then_fail<S: Into<String>>(self, message: S) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Err(message.into()));
        }
        self
    }

    /// Script the streams returned by successive `stream` calls. An `Err` fails the
    /// call itself; an `Err` item inside a stream fails mid-way.
    pub fn with_streams(mut self, streams: Vec<ScriptedStream>) -> Self {
        self.streams = Some(Mutex::new(streams.into_iter().collect()));
        self
    }

    /// Number of model calls made so far, streamed or not
    pub fn call_count(&self) -> usize {
        self.conversations.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Snapshot of the conversation passed to each model call
    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn record(&self, conversation: &Conversation) {
        if let Ok(mut conversations) = self.conversations.lock() {
            conversations.push(conversation.clone());
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        conversation: &Conversation,
        _tools: &[Tool],
    ) -> Result<(AssistantResponse, Usage)> {
        self.record(conversation);
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("mock provider lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(response)) => Ok((response, Usage::default())),
            Some(Err(message)) => Err(anyhow!(message)),
            // Return empty response if no more pre-configured responses
            None => Ok((AssistantResponse::text(""), Usage::default())),
        }
    }

    async fn stream(&self, conversation: &Conversation, _tools: &[Tool]) -> Result<ModelStream> {
        let Some(streams) = &self.streams else {
            return Err(StreamingUnsupported.into());
        };
        self.record(conversation);
        let next = streams
            .lock()
            .map_err(|_| anyhow!("mock provider lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(events)) => {
                let events = events
                    .into_iter()
                    .map(|event| event.map_err(|message| anyhow!(message)));
                Ok(Box::pin(futures::stream::iter(events)))
            }
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Box::pin(futures::stream::iter(vec![Ok(ModelEvent::Done)]))),
        }
    }
}
