//! Delivery of an agent's answer as an ordered sequence of chunks.
//!
//! [`WordReplay`] runs the loop to completion and replays the answer word by word.
//! [`Incremental`] streams every model step as it is generated. [`WithFallback`] tries
//! one strategy and switches to another whenever it fails.
//!
//! An empty final answer produces no text chunks under either strategy.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::agent::{Agent, AgentState};
use crate::errors::InvocationError;
use crate::models::message::{AssistantResponse, Turn};
use crate::providers::base::ModelEvent;
use crate::providers::stream::ToolCallAccumulator;

pub const WORD_DELAY: Duration = Duration::from_millis(30);
pub const TOOL_NOTICE_DELAY: Duration = Duration::from_millis(500);

/// One piece of streamed output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AnswerChunk {
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        result: String,
    },
    /// Human readable note that tools were consulted
    Notice(String),
    Text(String),
}

impl AnswerChunk {
    /// The chunk as plain text, for chunks meant to be read directly
    pub fn plain_text(&self) -> Option<&str> {
        match self {
            AnswerChunk::Notice(text) | AnswerChunk::Text(text) => Some(text),
            AnswerChunk::ToolCall { .. } | AnswerChunk::ToolResult { .. } => None,
        }
    }
}

pub type AnswerStream<'a> = BoxStream<'a, Result<AnswerChunk, InvocationError>>;

/// A way of turning one question into a stream of answer chunks
///
/// A stream yields at most one error, as its last item.
pub trait StreamStrategy: Send + Sync {
    fn stream<'a>(&'a self, agent: &'a Agent, question: &'a str) -> AnswerStream<'a>;
}

/// Split an answer on single spaces, keeping a trailing space on every piece
pub fn split_words(answer: &str) -> Vec<String> {
    answer.split(' ').map(|word| format!("{} ", word)).collect()
}

/// Runs the agent to completion, then replays the final answer word by word
#[derive(Debug, Clone)]
pub struct WordReplay {
    word_delay: Duration,
    tool_notice_delay: Option<Duration>,
}

impl WordReplay {
    /// `tool_notice_delay` enables the tool notice and sets the pause after it
    pub fn new(word_delay: Duration, tool_notice_delay: Option<Duration>) -> Self {
        Self {
            word_delay,
            tool_notice_delay,
        }
    }

    pub fn without_tool_notice(mut self) -> Self {
        self.tool_notice_delay = None;
        self
    }
}

impl Default for WordReplay {
    fn default() -> Self {
        Self::new(WORD_DELAY, Some(TOOL_NOTICE_DELAY))
    }
}

impl StreamStrategy for WordReplay {
    fn stream<'a>(&'a self, agent: &'a Agent, question: &'a str) -> AnswerStream<'a> {
        Box::pin(async_stream::stream! {
            let run = match agent.invoke(question).await {
                Ok(run) => run,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            // Only tools that exist are announced, not names the model made up
            let tool_names: Vec<&str> = run
                .conversation
                .tool_names()
                .into_iter()
                .filter(|name| agent.has_tool(name))
                .collect();
            if let Some(delay) = self.tool_notice_delay {
                if !tool_names.is_empty() {
                    yield Ok(AnswerChunk::Notice(format!("[Tool Call: {}] ", tool_names.join(", "))));
                    tokio::time::sleep(delay).await;
                }
            }

            if run.answer.is_empty() {
                return;
            }
            for word in split_words(&run.answer) {
                yield Ok(AnswerChunk::Text(word));
                tokio::time::sleep(self.word_delay).await;
            }
        })
    }
}

/// Streams each model step from the provider, running tools between steps
#[derive(Debug, Clone, Default)]
pub struct Incremental;

impl StreamStrategy for Incremental {
    fn stream<'a>(&'a self, agent: &'a Agent, question: &'a str) -> AnswerStream<'a> {
        Box::pin(async_stream::stream! {
            let mut invocation = agent.start(question);
            loop {
                if let AgentState::Failed(err) = invocation.state() {
                    yield Err(err.clone());
                    break;
                }
                if matches!(invocation.state(), AgentState::Done(_)) {
                    break;
                }

                if matches!(invocation.state(), AgentState::ExecutingTools(_)) {
                    for turn in invocation.step().await {
                        if let Turn::ToolResult(result) = turn {
                            yield Ok(AnswerChunk::ToolResult {
                                tool_call_id: result.request_id,
                                result: result.content,
                            });
                        }
                    }
                    continue;
                }

                invocation.note_model_call();
                let opened = agent
                    .provider()
                    .stream(invocation.conversation(), invocation.tools())
                    .await;
                let mut events = match opened {
                    Ok(events) => events,
                    Err(err) => {
                        invocation.fail(InvocationError::model_client(err));
                        continue;
                    }
                };

                let mut text = String::new();
                let mut calls = ToolCallAccumulator::new();
                let mut failure = None;
                while let Some(event) = events.next().await {
                    match event {
                        Ok(ModelEvent::TextDelta(delta)) => {
                            text.push_str(&delta);
                            yield Ok(AnswerChunk::Text(delta));
                        }
                        Ok(ModelEvent::ToolCallDelta { index, id, name, arguments }) => {
                            calls.push(index, id, name, &arguments);
                        }
                        Ok(ModelEvent::Done) => break,
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                drop(events);

                if let Some(err) = failure {
                    invocation.fail(InvocationError::model_client(err));
                    continue;
                }

                let response = AssistantResponse::classify(Some(text), calls.finish());
                if let Some(requests) = response.as_tool_calls() {
                    for request in requests {
                        yield Ok(AnswerChunk::ToolCall {
                            id: request.id.clone(),
                            name: request.tool_name.clone(),
                            args: request.arguments_value(),
                        });
                    }
                }
                invocation.accept_response(response);
            }
        })
    }
}

/// Marks where fallback output replaces a partial answer that it does not continue
pub const RESTART_NOTICE: &str = "\n[Answer restarted] ";

/// Uses `primary`, switching to `fallback` if `primary` fails at any point
///
/// Text the primary already delivered is not repeated: fallback text that matches it is
/// swallowed and only the continuation is emitted. If the fallback answer diverges from
/// what was sent, a [`RESTART_NOTICE`] precedes the complete fallback answer. Only an
/// error from the fallback reaches the caller.
#[derive(Debug, Clone)]
pub struct WithFallback<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> WithFallback<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: StreamStrategy, F: StreamStrategy> StreamStrategy for WithFallback<P, F> {
    fn stream<'a>(&'a self, agent: &'a Agent, question: &'a str) -> AnswerStream<'a> {
        Box::pin(async_stream::stream! {
            let mut sent = String::new();
            let mut failure = None;

            let mut primary = self.primary.stream(agent, question);
            while let Some(item) = primary.next().await {
                match item {
                    Ok(chunk) => {
                        if let AnswerChunk::Text(text) = &chunk {
                            sent.push_str(text);
                        }
                        yield Ok(chunk);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            drop(primary);

            let Some(err) = failure else {
                return;
            };
            warn!(error = %err, delivered = sent.len(), "streaming failed, falling back");

            let mut resume = Resume::after(sent);
            let mut fallback = self.fallback.stream(agent, question);
            while let Some(item) = fallback.next().await {
                match item {
                    Ok(chunk) => {
                        for chunk in resume.admit(chunk) {
                            yield Ok(chunk);
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }
}

/// Lines fallback text up with the text a failed primary already delivered
struct Resume {
    pending: String,
    matched: Vec<AnswerChunk>,
}

impl Resume {
    fn after(sent: String) -> Self {
        Self {
            pending: sent,
            matched: Vec::new(),
        }
    }

    /// The chunks to emit for one fallback chunk
    fn admit(&mut self, chunk: AnswerChunk) -> Vec<AnswerChunk> {
        if self.pending.is_empty() {
            return vec![chunk];
        }
        let AnswerChunk::Text(text) = &chunk else {
            return vec![chunk];
        };

        if self.pending.starts_with(text.as_str()) {
            self.pending.drain(..text.len());
            if self.pending.is_empty() {
                self.matched.clear();
            } else {
                self.matched.push(chunk);
            }
            Vec::new()
        } else if text.starts_with(self.pending.as_str()) {
            let rest = text[self.pending.len()..].to_string();
            self.pending.clear();
            self.matched.clear();
            if rest.is_empty() {
                Vec::new()
            } else {
                vec![AnswerChunk::Text(rest)]
            }
        } else {
            self.pending.clear();
            let mut out = vec![AnswerChunk::Notice(RESTART_NOTICE.to_string())];
            out.append(&mut self.matched);
            out.push(chunk);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentResult;
    use crate::models::message::ToolRequest;
    use crate::models::tool::Tool;
    use crate::providers::mock::MockProvider;
    use crate::tools::ToolHandler;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct EchoTool(Tool);

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn tool(&self) -> &Tool {
            &self.0
        }

        async fn invoke(&self, query: &str) -> AgentResult<String> {
            Ok(format!("echo: {}", query))
        }
    }

    fn agent(provider: Arc<MockProvider>) -> Agent {
        let mut agent = Agent::new(provider, "system");
        agent.add_tool(Box::new(EchoTool(Tool::new(
            "echo",
            "Echoes back the query",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        ))));
        agent
    }

    fn instant_replay() -> WordReplay {
        WordReplay::new(Duration::ZERO, Some(Duration::ZERO))
    }

    async fn collect(stream: AnswerStream<'_>) -> Vec<Result<AnswerChunk, InvocationError>> {
        stream.collect().await
    }

    fn texts(items: &[Result<AnswerChunk, InvocationError>]) -> String {
        items
            .iter()
            .filter_map(|item| item.as_ref().ok())
            .filter_map(|chunk| match chunk {
                AnswerChunk::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_split_words() {
        assert_eq!(split_words("a b"), vec!["a ", "b "]);
        assert_eq!(split_words("a  b"), vec!["a ", " ", "b "]);
        assert_eq!(split_words(""), vec![" "]);
    }

    #[test]
    fn test_chunk_serialization() -> serde_json::Result<()> {
        let chunk = AnswerChunk::ToolResult {
            tool_call_id: "call_1".to_string(),
            result: "Document 1:\nA".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&chunk)?,
            json!({"type": "tool_result", "data": {"toolCallId": "call_1", "result": "Document 1:\nA"}})
        );
        assert_eq!(
            serde_json::to_value(AnswerChunk::Text("Hi ".to_string()))?,
            json!({"type": "text", "data": "Hi "})
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_word_replay_concatenates_to_answer() {
        let answer = "The  market rose 20% in 2024.";
        let provider = Arc::new(MockProvider::new(vec![AssistantResponse::text(answer)]));
        let agent = agent(provider);

        let items = collect(instant_replay().stream(&agent, "q")).await;

        assert!(items.iter().all(Result::is_ok));
        assert_eq!(texts(&items), format!("{} ", answer));
    }

    #[tokio::test]
    async fn test_word_replay_tool_notice() {
        let lookup =
            || AssistantResponse::tool_calls(vec![ToolRequest::new("1", "echo", json!({"query": "q"}))]);
        let provider = Arc::new(MockProvider::new(vec![
            lookup(),
            AssistantResponse::text("Done"),
            lookup(),
            AssistantResponse::text("Done"),
        ]));
        let agent = agent(provider);

        let items = collect(instant_replay().stream(&agent, "q")).await;
        assert_eq!(
            items[0].as_ref().ok(),
            Some(&AnswerChunk::Notice("[Tool Call: echo] ".to_string()))
        );
        assert_eq!(texts(&items), "Done ");

        let items = collect(
            instant_replay()
                .without_tool_notice()
                .stream(&agent, "q"),
        )
        .await;
        assert_eq!(
            items[0].as_ref().ok(),
            Some(&AnswerChunk::Text("Done ".to_string()))
        );
    }

    #[tokio::test]
    async fn test_word_replay_failure() {
        let provider = Arc::new(MockProvider::new(vec![]).then_fail("model offline"));
        let agent = agent(provider);

        let items = collect(instant_replay().stream(&agent, "q")).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(InvocationError::ModelClient(msg)) if msg.contains("model offline")));
    }

    #[tokio::test]
    async fn test_incremental_with_tool_call() {
        let provider = Arc::new(MockProvider::new(vec![]).with_streams(vec![
            Ok(vec![
                Ok(ModelEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("echo".to_string()),
                    arguments: "{\"query\":".to_string(),
                }),
                Ok(ModelEvent::ToolCallDelta {
                    index: 0,
                    id: None,
                    name: None,
                    arguments: "\"gains\"}".to_string(),
                }),
                Ok(ModelEvent::Done),
            ]),
            Ok(vec![
                Ok(ModelEvent::TextDelta("Stocks".to_string())),
                Ok(ModelEvent::TextDelta(" rose.".to_string())),
                Ok(ModelEvent::Done),
            ]),
        ]));
        let agent = agent(provider.clone());

        let items = collect(Incremental.stream(&agent, "q")).await;
        let chunks: Vec<AnswerChunk> = items.into_iter().map(Result::unwrap).collect();

        assert_eq!(
            chunks,
            vec![
                AnswerChunk::ToolCall {
                    id: "call_1".to_string(),
                    name: "echo".to_string(),
                    args: json!({"query": "gains"}),
                },
                AnswerChunk::ToolResult {
                    tool_call_id: "call_1".to_string(),
                    result: "echo: gains".to_string(),
                },
                AnswerChunk::Text("Stocks".to_string()),
                AnswerChunk::Text(" rose.".to_string()),
            ]
        );
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_fallback_when_streaming_unsupported() {
        let provider = Arc::new(MockProvider::new(vec![AssistantResponse::text(
            "Fallback answer",
        )]));
        let agent = agent(provider);
        let strategy = WithFallback::new(Incremental, instant_replay().without_tool_notice());

        let items = collect(strategy.stream(&agent, "q")).await;
        assert!(items.iter().all(Result::is_ok));
        assert_eq!(texts(&items), "Fallback answer ");
    }

    fn partial_then_reset(delta: &str, answer: &str) -> Arc<MockProvider> {
        Arc::new(
            MockProvider::new(vec![AssistantResponse::text(answer)]).with_streams(vec![Ok(vec![
                Ok(ModelEvent::TextDelta(delta.to_string())),
                Err("connection reset".to_string()),
            ])]),
        )
    }

    #[tokio::test]
    async fn test_fallback_after_output_began_restarts_answer() {
        let provider = partial_then_reset("Partial", "Full answer");
        let agent = agent(provider.clone());
        let strategy = WithFallback::new(Incremental, instant_replay().without_tool_notice());

        let items = collect(strategy.stream(&agent, "q")).await;
        let chunks: Vec<AnswerChunk> = items.into_iter().map(Result::unwrap).collect();

        assert_eq!(
            chunks,
            vec![
                AnswerChunk::Text("Partial".to_string()),
                AnswerChunk::Notice(RESTART_NOTICE.to_string()),
                AnswerChunk::Text("Full ".to_string()),
                AnswerChunk::Text("answer ".to_string()),
            ]
        );
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_fallback_continues_matching_answer() {
        let provider = partial_then_reset("Stocks ro", "Stocks rose sharply.");
        let agent = agent(provider);
        let strategy = WithFallback::new(Incremental, instant_replay().without_tool_notice());

        let items = collect(strategy.stream(&agent, "q")).await;

        assert!(items.iter().all(Result::is_ok));
        assert_eq!(texts(&items), "Stocks rose sharply. ");
        assert!(!items
            .iter()
            .any(|item| matches!(item, Ok(AnswerChunk::Notice(_)))));
    }

    #[tokio::test]
    async fn test_fallback_error_is_reported() {
        let provider = Arc::new(
            MockProvider::new(vec![])
                .then_fail("model offline")
                .with_streams(vec![Err("stream refused".to_string())]),
        );
        let agent = agent(provider);
        let strategy = WithFallback::new(Incremental, instant_replay());

        let items = collect(strategy.stream(&agent, "q")).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(InvocationError::ModelClient(msg)) if msg.contains("model offline")));
    }

    #[test]
    fn test_resume_passes_through_without_sent_text() {
        let mut resume = Resume::after(String::new());
        let chunk = AnswerChunk::Text("Hello ".to_string());
        assert_eq!(resume.admit(chunk.clone()), vec![chunk]);
    }

    #[tokio::test]
    async fn test_word_replay_notice_skips_unknown_tools() {
        let provider = Arc::new(MockProvider::new(vec![
            AssistantResponse::tool_calls(vec![
                ToolRequest::new("1", "invalid_tool", json!({"query": "q"})),
                ToolRequest::new("2", "echo", json!({"query": "q"})),
            ]),
            AssistantResponse::text("Done"),
        ]));
        let agent = agent(provider);

        let items = collect(instant_replay().stream(&agent, "q")).await;
        assert_eq!(
            items[0].as_ref().ok(),
            Some(&AnswerChunk::Notice("[Tool Call: echo] ".to_string()))
        );
    }

    #[tokio::test]
    async fn test_word_replay_notice_omitted_when_only_unknown_tools() {
        let provider = Arc::new(MockProvider::new(vec![
            AssistantResponse::tool_calls(vec![ToolRequest::new(
                "1",
                "invalid_tool",
                json!({"query": "q"}),
            )]),
            AssistantResponse::text("Done"),
        ]));
        let agent = agent(provider);

        let items = collect(instant_replay().stream(&agent, "q")).await;
        assert_eq!(
            items[0].as_ref().ok(),
            Some(&AnswerChunk::Text("Done ".to_string()))
        );
    }

    #[tokio::test]
    async fn test_empty_answer_yields_no_text_from_either_strategy() {
        let provider = Arc::new(
            MockProvider::new(vec![AssistantResponse::text("")])
                .with_streams(vec![Ok(vec![Ok(ModelEvent::Done)])]),
        );
        let agent = agent(provider);

        let replayed = collect(instant_replay().stream(&agent, "q")).await;
        let streamed = collect(Incremental.stream(&agent, "q")).await;

        assert!(replayed.is_empty());
        assert!(streamed.is_empty());
    }
}
