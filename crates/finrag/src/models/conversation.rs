use serde::Serialize;

use super::message::{AssistantResponse, ToolRequest, Turn};

/// The ordered, append-only turns of a single agent invocation
///
/// A conversation always starts with the system directive followed by the user query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new<S: Into<String>, Q: Into<String>>(system_directive: S, question: Q) -> Self {
        Self {
            turns: vec![Turn::system(system_directive), Turn::user(question)],
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Text of the last assistant response, if that response was a final answer
    pub fn final_answer(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find_map(Turn::as_assistant_response)
            .and_then(AssistantResponse::as_text)
    }

    /// Every tool request issued so far, in order
    pub fn tool_requests(&self) -> impl Iterator<Item = &ToolRequest> {
        self.turns
            .iter()
            .filter_map(Turn::as_assistant_response)
            .filter_map(AssistantResponse::as_tool_calls)
            .flat_map(|calls| calls.iter())
    }

    /// Distinct names of the tools requested so far, in first-use order
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for request in self.tool_requests() {
            if !names.contains(&request.tool_name.as_str()) {
                names.push(&request.tool_name);
            }
        }
        names
    }
}
