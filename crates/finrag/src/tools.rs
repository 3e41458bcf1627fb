pub mod retriever;

use async_trait::async_trait;

use crate::errors::AgentResult;
use crate::models::tool::Tool;

/// A named, schema-described callable the agent can dispatch model requests to
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The schema advertised to the model
    fn tool(&self) -> &Tool;

    fn name(&self) -> &str {
        &self.tool().name
    }

    /// Run the tool for a query and return its text output
    async fn invoke(&self, query: &str) -> AgentResult<String>;
}
