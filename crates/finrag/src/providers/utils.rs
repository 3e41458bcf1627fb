use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::base::Usage;
use crate::errors::AgentError;
use crate::models::conversation::Conversation;
use crate::models::message::{AssistantResponse, ToolRequest, Turn};
use crate::models::tool::Tool;

lazy_static! {
    static ref INVALID_FUNCTION_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_FUNCTION_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// Convert a conversation to OpenAI's API message specification
pub fn conversation_to_openai_spec(conversation: &Conversation) -> Vec<Value> {
    conversation
        .turns()
        .iter()
        .map(|turn| match turn {
            Turn::SystemDirective { content } => json!({
                "role": "system",
                "content": content,
            }),
            Turn::UserQuery { content } => json!({
                "role": "user",
                "content": content,
            }),
            Turn::AssistantResponse(AssistantResponse::Final { text }) => json!({
                "role": "assistant",
                "content": text,
            }),
            Turn::AssistantResponse(AssistantResponse::ToolCalls { requests }) => {
                let tool_calls: Vec<Value> = requests
                    .iter()
                    .map(|request| {
                        json!({
                            "id": request.id,
                            "type": "function",
                            "function": {
                                "name": sanitize_function_name(&request.tool_name),
                                "arguments": request.arguments_value().to_string(),
                            }
                        })
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": Value::Null,
                    "tool_calls": tool_calls,
                })
            }
            Turn::ToolResult(result) => json!({
                "role": "tool",
                "content": result.content,
                "tool_call_id": result.request_id,
            }),
        })
        .collect()
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Build the body of a chat completions request
pub fn build_chat_payload(
    model: &str,
    conversation: &Conversation,
    tools: &[Tool],
    temperature: Option<f32>,
    max_tokens: Option<i32>,
    stream: bool,
) -> Result<Value> {
    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(model));
    payload.insert(
        "messages".to_string(),
        json!(conversation_to_openai_spec(conversation)),
    );

    let tools_spec = tools_to_openai_spec(tools)?;
    if !tools_spec.is_empty() {
        payload.insert("tools".to_string(), json!(tools_spec));
    }
    if let Some(temp) = temperature {
        payload.insert("temperature".to_string(), json!(temp));
    }
    if let Some(tokens) = max_tokens {
        payload.insert("max_tokens".to_string(), json!(tokens));
    }
    if stream {
        payload.insert("stream".to_string(), json!(true));
    }

    Ok(Value::Object(payload))
}

/// Convert OpenAI's API response to an assistant response
pub fn openai_response_to_assistant(response: &Value) -> Result<AssistantResponse> {
    let original = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("No message in response: {}", response))?;

    let text = original
        .get("content")
        .and_then(Value::as_str)
        .map(String::from);

    let mut requests = Vec::new();
    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default();
            let function_name = tool_call["function"]["name"].as_str().unwrap_or_default();
            let arguments = match &tool_call["function"]["arguments"] {
                Value::String(raw) => raw.clone(),
                Value::Null => String::new(),
                // Some compatible servers send the arguments already decoded
                other => other.to_string(),
            };
            requests.push(parse_tool_request(id, function_name, &arguments));
        }
    }

    Ok(AssistantResponse::classify(text, requests))
}

/// Build a tool request from the raw pieces the model sent
pub fn parse_tool_request(id: &str, function_name: &str, arguments: &str) -> ToolRequest {
    let id = if id.is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        id.to_string()
    };

    if !is_valid_function_name(function_name) {
        let error = AgentError::ToolNotFound(format!(
            "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
            function_name
        ));
        return ToolRequest::with_error(id, function_name, error);
    }

    if arguments.trim().is_empty() {
        return ToolRequest::new(id, function_name, json!({}));
    }

    match serde_json::from_str::<Value>(arguments) {
        Ok(params) => ToolRequest::new(id, function_name, params),
        Err(e) => {
            let error = AgentError::InvalidParameters(format!(
                "Could not interpret tool use parameters for id {}: {}",
                id, e
            ));
            ToolRequest::with_error(id, function_name, error)
        }
    }
}

/// Read the token usage block of a chat completions response
pub fn get_usage(data: &Value) -> Usage {
    let Some(usage) = data.get("usage") else {
        return Usage::default();
    };

    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_FUNCTION_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_FUNCTION_NAME.is_match(name)
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}
