use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::errors::{AgentError, InvocationError};
use crate::models::conversation::Conversation;
use crate::models::message::{AssistantResponse, ToolCalls, ToolRequest, ToolResult, Turn};
use crate::models::tool::Tool;
use crate::providers::base::Provider;
use crate::tools::ToolHandler;

/// Tool result sent back when the model asks for a tool that does not exist
pub const UNKNOWN_TOOL_RESULT: &str =
    "Incorrect Tool Name, Please Retry and Select tool from List of Available tools.";

pub const DEFAULT_MAX_TOOL_CYCLES: usize = 10;

/// Content of the tool result for a tool call that failed
pub fn tool_error_content(error: &AgentError) -> String {
    format!("The tool call returned the following error:\n{}", error)
}

/// Where a single invocation is in the model/tool cycle
#[derive(Debug, Clone, PartialEq)]
pub enum AgentState {
    AwaitingModel,
    ExecutingTools(ToolCalls),
    Done(String),
    Failed(InvocationError),
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Done(_) | AgentState::Failed(_))
    }
}

/// The outcome of a completed invocation
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub answer: String,
    pub conversation: Conversation,
    pub model_calls: usize,
    pub tool_cycles: usize,
}

/// Agent pairs a model provider with the tools it may call
pub struct Agent {
    provider: Arc<dyn Provider>,
    tools: Vec<Box<dyn ToolHandler>>,
    system_directive: String,
    max_tool_cycles: Option<usize>,
}

impl Agent {
    /// Create a new Agent with the specified provider and system directive
    pub fn new<S: Into<String>>(provider: Arc<dyn Provider>, system_directive: S) -> Self {
        Self {
            provider,
            tools: Vec::new(),
            system_directive: system_directive.into(),
            max_tool_cycles: Some(DEFAULT_MAX_TOOL_CYCLES),
        }
    }

    /// Bound the number of tool cycles per invocation. `None` never stops the loop.
    pub fn with_max_tool_cycles(mut self, max_tool_cycles: Option<usize>) -> Self {
        self.max_tool_cycles = max_tool_cycles;
        self
    }

    pub fn add_tool(&mut self, tool: Box<dyn ToolHandler>) {
        self.tools.push(tool);
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn system_directive(&self) -> &str {
        &self.system_directive
    }

    pub fn max_tool_cycles(&self) -> Option<usize> {
        self.max_tool_cycles
    }

    /// Schemas of every registered tool, as advertised to the model
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.tool().clone()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Begin a fresh invocation for a question
    pub fn start(&self, question: &str) -> Invocation<'_> {
        info!(question, "starting invocation");
        Invocation {
            agent: self,
            conversation: Conversation::new(self.system_directive.clone(), question),
            state: AgentState::AwaitingModel,
            tools: self.tools(),
            model_calls: 0,
            tool_cycles: 0,
        }
    }

    /// Run an invocation to its final answer
    pub async fn invoke(&self, question: &str) -> Result<AgentRun, InvocationError> {
        self.start(question).run().await
    }

    /// Run an invocation, yielding every turn it appends as soon as it exists
    ///
    /// The stream ends after the final answer, or with an error item if the invocation
    /// fails. Dropping the stream abandons the invocation.
    pub fn reply<'a>(&'a self, question: &str) -> BoxStream<'a, Result<Turn, InvocationError>> {
        let question = question.to_string();
        Box::pin(async_stream::stream! {
            let mut invocation = self.start(&question);
            loop {
                for turn in invocation.step().await {
                    yield Ok(turn);
                }

                // Let consumers see the turn before long-running tool calls start
                tokio::task::yield_now().await;

                match invocation.state() {
                    AgentState::Done(_) => break,
                    AgentState::Failed(err) => {
                        yield Err(err.clone());
                        break;
                    }
                    AgentState::AwaitingModel | AgentState::ExecutingTools(_) => {}
                }
            }
        })
    }

    /// Execute one tool request. Never fails: problems become the result content.
    pub async fn dispatch_tool_call(&self, request: &ToolRequest) -> ToolResult {
        let Some(tool) = self.tools.iter().find(|t| t.name() == request.tool_name) else {
            warn!(tool = %request.tool_name, id = %request.id, "model requested an unknown tool");
            return ToolResult::new(&request.id, &request.tool_name, UNKNOWN_TOOL_RESULT);
        };

        let content = match &request.arguments {
            Err(err) => {
                warn!(tool = %request.tool_name, id = %request.id, error = %err, "invalid tool call");
                tool_error_content(err)
            }
            Ok(_) => {
                debug!(tool = %request.tool_name, query = request.query(), "calling tool");
                match tool.invoke(request.query()).await {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(tool = %request.tool_name, error = %err, "tool call failed");
                        tool_error_content(&err)
                    }
                }
            }
        };

        ToolResult::new(&request.id, &request.tool_name, content)
    }
}

/// A single question being answered
///
/// Owns its conversation exclusively; nothing is shared with other invocations.
pub struct Invocation<'a> {
    agent: &'a Agent,
    conversation: Conversation,
    state: AgentState,
    tools: Vec<Tool>,
    model_calls: usize,
    tool_cycles: usize,
}

impl<'a> Invocation<'a> {
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn model_calls(&self) -> usize {
        self.model_calls
    }

    pub fn tool_cycles(&self) -> usize {
        self.tool_cycles
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Perform one state transition and return the turns it appended
    pub async fn step(&mut self) -> Vec<Turn> {
        let before = self.conversation.len();
        match std::mem::replace(&mut self.state, AgentState::AwaitingModel) {
            AgentState::AwaitingModel => {
                self.note_model_call();
                match self
                    .agent
                    .provider
                    .complete(&self.conversation, &self.tools)
                    .await
                {
                    Ok((response, usage)) => {
                        debug!(
                            model_call = self.model_calls,
                            total_tokens = ?usage.total_tokens,
                            "model responded"
                        );
                        self.accept_response(response);
                    }
                    Err(err) => self.fail(InvocationError::model_client(err)),
                }
            }
            AgentState::ExecutingTools(requests) => {
                self.tool_cycles += 1;
                debug!(cycle = self.tool_cycles, requests = requests.len(), "executing tools");
                for request in &requests {
                    let result = self.agent.dispatch_tool_call(request).await;
                    self.conversation.push(Turn::ToolResult(result));
                }
            }
            terminal => self.state = terminal,
        }
        self.conversation.turns()[before..].to_vec()
    }

    /// Count a model call made outside of [`Invocation::step`]
    pub fn note_model_call(&mut self) {
        self.model_calls += 1;
    }

    /// Record the model's response and move to the state it implies
    pub fn accept_response(&mut self, response: AssistantResponse) {
        self.conversation
            .push(Turn::AssistantResponse(response.clone()));

        match response {
            AssistantResponse::Final { text } => {
                info!(
                    model_calls = self.model_calls,
                    tool_cycles = self.tool_cycles,
                    "invocation finished"
                );
                self.state = AgentState::Done(text);
            }
            AssistantResponse::ToolCalls { requests } => match self.agent.max_tool_cycles {
                Some(max) if self.tool_cycles >= max => {
                    self.fail(InvocationError::MaxToolCyclesExceeded(max));
                }
                _ => self.state = AgentState::ExecutingTools(requests),
            },
        }
    }

    /// Terminate the invocation with an error
    pub fn fail(&mut self, err: InvocationError) {
        error!(error = %err, model_calls = self.model_calls, "invocation failed");
        self.state = AgentState::Failed(err);
    }

    /// Step until a terminal state and return the outcome
    pub async fn run(mut self) -> Result<AgentRun, InvocationError> {
        loop {
            match std::mem::replace(&mut self.state, AgentState::AwaitingModel) {
                AgentState::Done(answer) => {
                    return Ok(AgentRun {
                        answer,
                        conversation: self.conversation,
                        model_calls: self.model_calls,
                        tool_cycles: self.tool_cycles,
                    })
                }
                AgentState::Failed(err) => return Err(err),
                state => {
                    self.state = state;
                    self.step().await;
                }
            }
        }
    }
}
