use crate::state::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use finrag::agent::Agent;
use finrag::streaming::{AnswerChunk, StreamStrategy};
use futures::{stream::StreamExt, Stream};
use serde::Deserialize;
use serde_json::json;
use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

const HEARTBEAT: Duration = Duration::from_millis(500);
const EVENT_STREAM: &str = "text/event-stream";
const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

#[derive(Debug, Deserialize)]
struct StreamRequest {
    question: String,
}

// Streaming body fed from a channel, one frame per message
pub struct ChunkedResponse {
    rx: ReceiverStream<String>,
    content_type: &'static str,
}

impl ChunkedResponse {
    fn new(rx: ReceiverStream<String>, content_type: &'static str) -> Self {
        Self { rx, content_type }
    }
}

impl Stream for ChunkedResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for ChunkedResponse {
    fn into_response(self) -> Response {
        let content_type = self.content_type;
        let mut response = Response::new(Body::from_stream(self));

        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if content_type == EVENT_STREAM {
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        response
    }
}

// Server-sent event framing
struct EventFormatter;

impl EventFormatter {
    fn format_data(payload: &str) -> String {
        // Every line of a multi-line payload needs its own data field
        let mut event = String::new();
        for line in payload.split('\n') {
            event.push_str("data: ");
            event.push_str(line);
            event.push('\n');
        }
        event.push('\n');
        event
    }

    fn format_chunk(chunk: &AnswerChunk) -> String {
        let payload = serde_json::to_string(chunk).unwrap_or_else(|_| String::new());
        Self::format_data(&payload)
    }

    fn format_error(message: &str) -> String {
        Self::format_data(&json!({ "type": "error", "data": message }).to_string())
    }

    fn format_done() -> String {
        "data: [DONE]\n\n".to_string()
    }
}

/// How answer chunks are written to the response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    /// Raw chunk text
    PlainText,
    /// Chunk text as server-sent events
    TextEvents,
    /// JSON chunk payloads as server-sent events
    JsonEvents,
}

impl Encoding {
    fn content_type(self) -> &'static str {
        match self {
            Encoding::PlainText => PLAIN_TEXT,
            Encoding::TextEvents | Encoding::JsonEvents => EVENT_STREAM,
        }
    }

    fn chunk(self, chunk: &AnswerChunk) -> Option<String> {
        match self {
            Encoding::PlainText => chunk.plain_text().map(str::to_string),
            Encoding::TextEvents => chunk.plain_text().map(EventFormatter::format_data),
            Encoding::JsonEvents => Some(EventFormatter::format_chunk(chunk)),
        }
    }

    fn error(self, message: &str) -> String {
        match self {
            Encoding::PlainText => format!("Error: {}", message),
            Encoding::TextEvents => EventFormatter::format_data(&format!("Error: {}", message)),
            Encoding::JsonEvents => EventFormatter::format_error(message),
        }
    }

    fn done(self) -> Option<String> {
        match self {
            Encoding::PlainText => None,
            Encoding::TextEvents | Encoding::JsonEvents => Some(EventFormatter::format_done()),
        }
    }
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(EVENT_STREAM))
}

/// Run `strategy` on a background task and forward its encoded chunks
///
/// The returned receiver resolves with the error message if the answer failed before
/// its first chunk, and is dropped without a value otherwise. The task stops when the
/// client goes away, which drops the in-flight invocation.
fn spawn_answer<S>(
    strategy: Arc<S>,
    agent: Arc<Agent>,
    question: String,
    encoding: Encoding,
) -> (ReceiverStream<String>, oneshot::Receiver<String>)
where
    S: StreamStrategy + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    let (first_tx, first_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut first_tx = Some(first_tx);
        let mut stream = strategy.stream(&agent, &question);

        loop {
            match timeout(HEARTBEAT, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    first_tx.take();
                    if let Some(frame) = encoding.chunk(&chunk) {
                        if tx.send(frame).await.is_err() {
                            info!("client disconnected, abandoning answer");
                            return;
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    error!("Error streaming answer: {}", e);
                    let message = e.to_string();
                    if let Some(first_tx) = first_tx.take() {
                        let _ = first_tx.send(message.clone());
                    }
                    let _ = tx.send(encoding.error(&message)).await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    // Heartbeat, used to detect disconnected clients while the agent works
                    if tx.is_closed() {
                        info!("client disconnected, abandoning answer");
                        return;
                    }
                }
            }
        }

        if let Some(done) = encoding.done() {
            let _ = tx.send(done).await;
        }
        debug!("answer stream finished");
    });

    (ReceiverStream::new(rx), first_rx)
}

async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StreamRequest>,
) -> Response {
    info!(question = %request.question, "stream");

    let encoding = if accepts_event_stream(&headers) {
        Encoding::TextEvents
    } else {
        Encoding::PlainText
    };
    let (rx, first_error) = spawn_answer(
        state.replay.clone(),
        state.agent.clone(),
        request.question,
        encoding,
    );

    // A plain response can still report an immediate failure through its status
    if encoding == Encoding::PlainText {
        if let Ok(message) = first_error.await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, PLAIN_TEXT)],
                encoding.error(&message),
            )
                .into_response();
        }
    }

    ChunkedResponse::new(rx, encoding.content_type()).into_response()
}

async fn stream_with_tools_handler(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> ChunkedResponse {
    info!(question = %request.question, "stream with tools");

    let (rx, _) = spawn_answer(
        state.tool_stream.clone(),
        state.agent.clone(),
        request.question,
        Encoding::JsonEvents,
    );
    ChunkedResponse::new(rx, EVENT_STREAM)
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/stream", post(stream_handler))
        .route("/stream-with-tools", post(stream_with_tools_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::state_with;
    use axum::http::Request;
    use finrag::models::message::{AssistantResponse, ToolRequest};
    use finrag::providers::base::ModelEvent;
    use finrag::providers::mock::MockProvider;
    use finrag::streaming::AnswerStream;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tower::ServiceExt;

    async fn post_stream(
        state: AppState,
        uri: &str,
        accept: Option<&str>,
        question: &str,
    ) -> (StatusCode, String, String) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(accept) = accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        let request = builder
            .body(Body::from(json!({ "question": question }).to_string()))
            .unwrap();

        let response = routes(state).oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn data_payloads(body: &str) -> Vec<String> {
        body.split("\n\n")
            .filter(|event| !event.is_empty())
            .map(|event| {
                event
                    .lines()
                    .map(|line| line.trim_start_matches("data: "))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect()
    }

    fn lookup_then(answer: &str) -> MockProvider {
        MockProvider::new(vec![
            AssistantResponse::tool_calls(vec![ToolRequest::new(
                "call_1",
                "retriever_tool",
                json!({"query": "market"}),
            )]),
            AssistantResponse::text(answer),
        ])
    }

    #[test]
    fn test_format_data_splits_lines() {
        assert_eq!(
            EventFormatter::format_data("first\nsecond"),
            "data: first\ndata: second\n\n"
        );
        assert_eq!(EventFormatter::format_data("word "), "data: word \n\n");
    }

    #[test]
    fn test_format_chunk_payloads() {
        assert_eq!(
            EventFormatter::format_chunk(&AnswerChunk::Text("Hi".to_string())),
            "data: {\"type\":\"text\",\"data\":\"Hi\"}\n\n"
        );

        let error = EventFormatter::format_error("boom");
        let payload: Value =
            serde_json::from_str(error.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(payload, json!({"type": "error", "data": "boom"}));
    }

    #[test]
    fn test_accepts_event_stream() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_event_stream(&headers));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream, */*"),
        );
        assert!(accepts_event_stream(&headers));
    }

    #[tokio::test]
    async fn test_stream_plain_text() {
        let state = state_with(lookup_then("Stocks rose sharply.")).await;

        let (status, content_type, body) =
            post_stream(state, "/stream", None, "How did stocks do?").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/plain"));
        assert_eq!(body, "[Tool Call: retriever_tool] Stocks rose sharply. ");
    }

    #[tokio::test]
    async fn test_stream_event_stream() {
        let state = state_with(MockProvider::new(vec![AssistantResponse::text(
            "Energy lagged.",
        )]))
        .await;

        let (status, content_type, body) =
            post_stream(state, "/stream", Some(EVENT_STREAM), "Weakest sector?").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, EVENT_STREAM);
        assert_eq!(
            body,
            "data: Energy \n\ndata: lagged. \n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn test_stream_immediate_failure() {
        let state = state_with(MockProvider::new(vec![]).then_fail("boom")).await;

        let (status, _, body) = post_stream(state, "/stream", None, "Anything?").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Error: "));
        assert!(body.contains("boom"));
    }

    #[tokio::test]
    async fn test_stream_event_stream_failure() {
        let state = state_with(MockProvider::new(vec![]).then_fail("boom")).await;

        let (status, _, body) =
            post_stream(state, "/stream", Some(EVENT_STREAM), "Anything?").await;

        assert_eq!(status, StatusCode::OK);
        let payloads = data_payloads(&body);
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].starts_with("Error: "));
        assert_eq!(payloads[1], "[DONE]");
    }

    #[tokio::test]
    async fn test_stream_with_tools_incremental() {
        let provider = MockProvider::new(vec![]).with_streams(vec![
            Ok(vec![
                Ok(ModelEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("retriever_tool".to_string()),
                    arguments: "{\"query\":\"energy\"}".to_string(),
                }),
                Ok(ModelEvent::Done),
            ]),
            Ok(vec![
                Ok(ModelEvent::TextDelta("Energy".to_string())),
                Ok(ModelEvent::TextDelta(" lagged.".to_string())),
                Ok(ModelEvent::Done),
            ]),
        ]);
        let state = state_with(provider).await;

        let (status, content_type, body) =
            post_stream(state, "/stream-with-tools", None, "Weakest sector?").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, EVENT_STREAM);

        let payloads = data_payloads(&body);
        assert_eq!(payloads.len(), 5);
        let events: Vec<Value> = payloads[..4]
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect();

        assert_eq!(
            events[0],
            json!({"type": "tool_call", "data": {"id": "call_1", "name": "retriever_tool", "args": {"query": "energy"}}})
        );
        assert_eq!(events[1]["type"], json!("tool_result"));
        assert_eq!(events[1]["data"]["toolCallId"], json!("call_1"));
        assert!(events[1]["data"]["result"]
            .as_str()
            .unwrap()
            .starts_with("Document 1:\n"));
        assert_eq!(events[2], json!({"type": "text", "data": "Energy"}));
        assert_eq!(events[3], json!({"type": "text", "data": " lagged."}));
        assert_eq!(payloads[4], "[DONE]");
    }

    #[tokio::test]
    async fn test_stream_with_tools_falls_back_to_replay() {
        // No scripted streams, so incremental streaming is unsupported
        let state = state_with(lookup_then("Bonds fell.")).await;

        let (_, _, body) =
            post_stream(state, "/stream-with-tools", None, "What about bonds?").await;

        let payloads = data_payloads(&body);
        assert_eq!(
            payloads,
            vec![
                "{\"type\":\"text\",\"data\":\"Bonds \"}".to_string(),
                "{\"type\":\"text\",\"data\":\"fell. \"}".to_string(),
                "[DONE]".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_with_tools_failure() {
        let provider = MockProvider::new(vec![])
            .then_fail("boom")
            .with_streams(vec![Err("stream refused".to_string())]);
        let state = state_with(provider).await;

        let (status, _, body) =
            post_stream(state, "/stream-with-tools", None, "Anything?").await;

        assert_eq!(status, StatusCode::OK);
        let payloads = data_payloads(&body);
        assert_eq!(payloads.len(), 2);
        let error: Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(error["type"], json!("error"));
        assert!(error["data"].as_str().unwrap().contains("boom"));
        assert_eq!(payloads[1], "[DONE]");
    }

    /// Sets its flag when the answer stream holding it is dropped
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Works for a minute before producing anything
    struct Stalled {
        dropped: Arc<AtomicBool>,
    }

    impl StreamStrategy for Stalled {
        fn stream<'a>(&'a self, _agent: &'a Agent, _question: &'a str) -> AnswerStream<'a> {
            let guard = DropFlag(Arc::clone(&self.dropped));
            futures::stream::once(async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(AnswerChunk::Text("late".to_string()))
            })
            .boxed()
        }
    }

    /// Produces text forever, counting what it produced
    struct Endless {
        produced: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl StreamStrategy for Endless {
        fn stream<'a>(&'a self, _agent: &'a Agent, _question: &'a str) -> AnswerStream<'a> {
            let state = (
                Arc::clone(&self.produced),
                DropFlag(Arc::clone(&self.dropped)),
            );
            futures::stream::unfold(state, |state| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                state.0.fetch_add(1, Ordering::SeqCst);
                Some((Ok(AnswerChunk::Text("tick ".to_string())), state))
            })
            .boxed()
        }
    }

    fn idle_agent() -> Arc<Agent> {
        Arc::new(Agent::new(
            Arc::new(MockProvider::new(vec![])),
            "Answer from the report.",
        ))
    }

    async fn wait_for(flag: &AtomicBool, limit: Duration) -> bool {
        let started = tokio::time::Instant::now();
        while started.elapsed() < limit {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        flag.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_disconnect_during_work_abandons_answer() {
        let dropped = Arc::new(AtomicBool::new(false));
        let strategy = Arc::new(Stalled {
            dropped: Arc::clone(&dropped),
        });

        let (rx, first_rx) =
            spawn_answer(strategy, idle_agent(), "Q".to_string(), Encoding::PlainText);
        drop(rx);
        drop(first_rx);

        // Noticed on the next heartbeat, long before the work would finish
        assert!(wait_for(&dropped, HEARTBEAT * 4).await);
    }

    #[tokio::test]
    async fn test_disconnect_mid_answer_stops_producing() {
        let produced = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let strategy = Arc::new(Endless {
            produced: Arc::clone(&produced),
            dropped: Arc::clone(&dropped),
        });

        let (mut rx, _first_rx) =
            spawn_answer(strategy, idle_agent(), "Q".to_string(), Encoding::PlainText);
        for _ in 0..3 {
            assert_eq!(rx.next().await, Some("tick ".to_string()));
        }
        drop(rx);

        assert!(wait_for(&dropped, Duration::from_secs(1)).await);
        let after_abandon = produced.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(produced.load(Ordering::SeqCst), after_abandon);
    }
}
