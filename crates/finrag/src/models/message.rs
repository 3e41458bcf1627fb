use serde::Serialize;
use serde_json::{Map, Value};

use super::role::Role;
use crate::errors::{AgentError, AgentResult};

/// A request from the model to execute a named tool
///
/// Arguments that could not be interpreted are kept as an error rather than dropped, so
/// the request still receives a matching tool result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRequest {
    pub id: String,
    pub tool_name: String,
    pub arguments: AgentResult<Map<String, Value>>,
}

impl ToolRequest {
    /// Create a request from already decoded arguments. Anything other than a JSON object
    /// is recorded as invalid parameters.
    pub fn new<I: Into<String>, N: Into<String>>(id: I, tool_name: N, arguments: Value) -> Self {
        let id = id.into();
        let arguments = match arguments {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(AgentError::InvalidParameters(format!(
                "Tool arguments for id {} must be a JSON object, got {}",
                id, other
            ))),
        };
        Self {
            id,
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn with_error<I: Into<String>, N: Into<String>>(
        id: I,
        tool_name: N,
        error: AgentError,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments: Err(error),
        }
    }

    /// The `query` argument, or an empty string when it is absent or not a string
    pub fn query(&self) -> &str {
        self.arguments
            .as_ref()
            .ok()
            .and_then(|args| args.get("query"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Arguments as a JSON value, with undecodable arguments shown as an empty object
    pub fn arguments_value(&self) -> Value {
        match &self.arguments {
            Ok(map) => Value::Object(map.clone()),
            Err(_) => Value::Object(Map::new()),
        }
    }
}

/// The output of one tool request, always coerced to text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub request_id: String,
    pub tool_name: String,
    pub content: String,
}

impl ToolResult {
    pub fn new<I, N, C>(request_id: I, tool_name: N, content: C) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
        }
    }
}

/// A non-empty, ordered set of tool requests
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ToolCalls(Vec<ToolRequest>);

impl ToolCalls {
    /// Returns `None` for an empty list, which must be treated as a final answer
    pub fn new(requests: Vec<ToolRequest>) -> Option<Self> {
        if requests.is_empty() {
            None
        } else {
            Some(Self(requests))
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ToolRequest> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false, kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[ToolRequest] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a ToolCalls {
    type Item = &'a ToolRequest;
    type IntoIter = std::slice::Iter<'a, ToolRequest>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// What the model produced for one step: a terminal answer or pending tool calls
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssistantResponse {
    Final { text: String },
    ToolCalls { requests: ToolCalls },
}

impl AssistantResponse {
    /// A final answer
    pub fn text<S: Into<String>>(text: S) -> Self {
        AssistantResponse::Final { text: text.into() }
    }

    /// Classify raw model output. Tool calls win when the list is non-empty; otherwise
    /// the response is final, with missing text read as an empty answer.
    pub fn classify(text: Option<String>, requests: Vec<ToolRequest>) -> Self {
        match ToolCalls::new(requests) {
            Some(requests) => AssistantResponse::ToolCalls { requests },
            None => AssistantResponse::Final {
                text: text.unwrap_or_default(),
            },
        }
    }

    /// Shorthand for a response made only of tool requests
    pub fn tool_calls(requests: Vec<ToolRequest>) -> Self {
        Self::classify(None, requests)
    }

    pub fn as_tool_calls(&self) -> Option<&ToolCalls> {
        match self {
            AssistantResponse::ToolCalls { requests } => Some(requests),
            AssistantResponse::Final { .. } => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AssistantResponse::Final { text } => Some(text),
            AssistantResponse::ToolCalls { .. } => None,
        }
    }
}

/// One unit of conversation content, tagged by role
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    SystemDirective { content: String },
    UserQuery { content: String },
    AssistantResponse(AssistantResponse),
    ToolResult(ToolResult),
}

impl Turn {
    pub fn system<S: Into<String>>(content: S) -> Self {
        Turn::SystemDirective {
            content: content.into(),
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Turn::UserQuery {
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Turn::SystemDirective { .. } => Role::System,
            Turn::UserQuery { .. } => Role::User,
            Turn::AssistantResponse(_) => Role::Assistant,
            Turn::ToolResult(_) => Role::Tool,
        }
    }

    pub fn as_assistant_response(&self) -> Option<&AssistantResponse> {
        match self {
            Turn::AssistantResponse(response) => Some(response),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match self {
            Turn::ToolResult(result) => Some(result),
            _ => None,
        }
    }
}
