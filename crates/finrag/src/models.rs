//! These models represent the objects passed around by the agent loop
//!
//! A question is answered inside a single [`conversation::Conversation`], an append-only list
//! of [`message::Turn`]s. The formats we exchange with the outside world are converted into
//! these structs at the edge:
//! - openai chat messages/tools, sent from the agent to the LLM
//! - streaming deltas, received from the LLM while it is still generating
//! - the JSON events of the streaming endpoints, sent from the agent to the interface
//!
//! Whether the model answered or asked for tools is decided once, when its output is
//! converted into an [`message::AssistantResponse`], and never re-inferred afterwards.
pub mod conversation;
pub mod message;
pub mod role;
pub mod tool;
