use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of a single tool dispatch. These never abort an invocation: they are
/// rendered into the tool result so the model can correct itself on the next turn.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Terminal failure of one agent invocation
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum InvocationError {
    #[error("Model client error: {0}")]
    ModelClient(String),

    #[error("Exceeded the limit of {0} tool cycles without a final answer")]
    MaxToolCyclesExceeded(usize),
}

impl InvocationError {
    pub fn model_client(err: anyhow::Error) -> Self {
        InvocationError::ModelClient(format!("{:#}", err))
    }
}
