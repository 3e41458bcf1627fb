//! Server-sent event parsing for OpenAI-compatible chat completion streams.
//!
//! The body is buffered until a blank line closes an event, then each event's `data:`
//! payload is decoded into [`ModelEvent`]s. Tool calls arrive as fragments keyed by
//! index and are reassembled by [`ToolCallAccumulator`].

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use serde_json::Value;

use super::base::{ModelEvent, ModelStream};
use super::utils::parse_tool_request;
use crate::models::message::ToolRequest;

const MAX_BUF: usize = 16 * 1024 * 1024;

/// Convert a streaming chat completions response into a [`ModelStream`]
pub fn into_model_stream(response: reqwest::Response) -> ModelStream {
    let events = response
        .bytes_stream()
        .scan(Vec::<u8>::new(), |buffer, chunk| {
            let results = match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    if buffer.len() > MAX_BUF {
                        buffer.clear();
                        vec![Err(anyhow!("SSE stream buffer exceeded 16 MiB"))]
                    } else {
                        drain_events(buffer)
                    }
                }
                Err(e) => vec![Err(anyhow!("Stream read error: {}", e))],
            };
            async move { Some(results) }
        })
        .flat_map(stream::iter);

    Box::pin(events)
}

/// Remove every complete event from the front of the buffer and parse it
fn drain_events(buffer: &mut Vec<u8>) -> Vec<Result<ModelEvent>> {
    let mut results = Vec::new();
    while let Some(pos) = find_event_end(buffer) {
        let raw: Vec<u8> = buffer.drain(..pos + 2).collect();
        let text = String::from_utf8_lossy(&raw);
        match parse_sse_event(&text) {
            Ok(events) => results.extend(events.into_iter().map(Ok)),
            Err(e) => results.push(Err(e)),
        }
    }
    results
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parse one event block into zero or more model events
pub fn parse_sse_event(event_text: &str) -> Result<Vec<ModelEvent>> {
    let data: Vec<&str> = event_text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        return Ok(vec![]);
    }
    let data = data.join("\n");

    if data == "[DONE]" {
        return Ok(vec![ModelEvent::Done]);
    }

    let chunk: Value = serde_json::from_str(&data)
        .map_err(|e| anyhow!("Could not decode stream chunk {}: {}", data, e))?;

    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        return Err(anyhow!("Model stream reported an error: {}", message));
    }

    let Some(delta) = chunk
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
    else {
        return Ok(vec![]);
    };

    let mut events = Vec::new();

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            events.push(ModelEvent::TextDelta(text.to_string()));
        }
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for (position, call) in tool_calls.iter().enumerate() {
            let index = call
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(position as u64) as u32;
            let function = call.get("function");
            events.push(ModelEvent::ToolCallDelta {
                index,
                id: call.get("id").and_then(Value::as_str).map(String::from),
                name: function
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .map(String::from),
                arguments: function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }

    Ok(events)
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles streamed tool call fragments into complete requests
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PendingCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u32, id: Option<String>, name: Option<String>, arguments: &str) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id {
            call.id = id;
        }
        if let Some(name) = name {
            call.name.push_str(&name);
        }
        call.arguments.push_str(arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// The complete requests, ordered by their stream index
    pub fn finish(self) -> Vec<ToolRequest> {
        self.calls
            .into_values()
            .map(|call| parse_tool_request(&call.id, &call.name, &call.arguments))
            .collect()
    }
}
