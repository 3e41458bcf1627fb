use crate::state::AppState;
use axum::{extract::State, routing::post, Json, Router};
use finrag::models::conversation::Conversation;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub include_messages: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Conversation>,
}

// Agent failures are reported in the body, the status stays 200
async fn handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    info!(question = %request.question, "query");

    let response = match state.agent.invoke(&request.question).await {
        Ok(run) => {
            info!(
                model_calls = run.model_calls,
                tool_cycles = run.tool_cycles,
                "query answered"
            );
            QueryResponse {
                answer: run.answer,
                success: true,
                error: None,
                messages: request.include_messages.then_some(run.conversation),
            }
        }
        Err(e) => {
            error!("Query failed: {}", e);
            QueryResponse {
                answer: String::new(),
                success: false,
                error: Some(e.to_string()),
                messages: None,
            }
        }
    };

    Json(response)
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/query", post(handler))
        .with_state(state)
}
