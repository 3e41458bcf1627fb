use finrag::agent::Agent;
use finrag::streaming::{Incremental, WithFallback, WordReplay};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    /// Strategy behind `/stream`
    pub replay: Arc<WordReplay>,
    /// Strategy behind `/stream-with-tools`
    pub tool_stream: Arc<WithFallback<Incremental, WordReplay>>,
}

impl AppState {
    pub fn new(agent: Agent, replay: WordReplay) -> Self {
        let fallback = replay.clone().without_tool_notice();
        Self {
            agent: Arc::new(agent),
            replay: Arc::new(replay),
            tool_stream: Arc::new(WithFallback::new(Incremental, fallback)),
        }
    }
}
