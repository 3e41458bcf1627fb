use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use super::ToolHandler;
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;
use crate::store::DocumentStore;

pub const RETRIEVER_TOOL_NAME: &str = "retriever_tool";
pub const DEFAULT_DOCUMENT_TITLE: &str = "Stock Market Performance 2024";
pub const DEFAULT_TOP_K: usize = 5;

/// Searches the loaded document and returns the best matching passages as one text
pub struct RetrieverTool {
    store: Arc<dyn DocumentStore>,
    title: String,
    top_k: usize,
    tool: Tool,
}

impl RetrieverTool {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_title(store, DEFAULT_DOCUMENT_TITLE)
    }

    pub fn with_title<S: Into<String>>(store: Arc<dyn DocumentStore>, title: S) -> Self {
        let title = title.into();
        let tool = Tool::new(
            RETRIEVER_TOOL_NAME,
            format!(
                "This tool searches and returns the information from the {} document.",
                title
            ),
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to look up in the document"
                    }
                },
                "required": ["query"]
            }),
        );
        Self {
            store,
            title,
            top_k: DEFAULT_TOP_K,
            tool,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    fn no_results(&self) -> String {
        format!(
            "I found no relevant information in the {} document.",
            self.title
        )
    }
}

#[async_trait]
impl ToolHandler for RetrieverTool {
    fn tool(&self) -> &Tool {
        &self.tool
    }

    async fn invoke(&self, query: &str) -> AgentResult<String> {
        let passages = self
            .store
            .search(query, self.top_k)
            .await
            .map_err(|e| AgentError::ExecutionError(e.to_string()))?;

        tracing::debug!(query, passages = passages.len(), "retrieved passages");

        if passages.is_empty() {
            return Ok(self.no_results());
        }

        Ok(passages
            .iter()
            .enumerate()
            .map(|(i, passage)| format!("Document {}:\n{}", i + 1, passage.content))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
