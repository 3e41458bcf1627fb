use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::base::{ModelStream, Provider, Usage};
use super::configs::OpenAiProviderConfig;
use super::stream::into_model_stream;
use super::utils::{
    build_chat_payload, check_openai_context_length_error, get_usage,
    openai_response_to_assistant,
};
use crate::models::conversation::Conversation;
use crate::models::message::AssistantResponse;
use crate::models::tool::Tool;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const OPENAI_MODEL: &str = "gpt-4o";

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn payload(&self, conversation: &Conversation, tools: &[Tool], stream: bool) -> Result<Value> {
        build_chat_payload(
            &self.config.model,
            conversation,
            tools,
            self.config.temperature,
            self.config.max_tokens,
            stream,
        )
    }

    async fn post(&self, payload: &Value) -> Result<Response> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            status => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                if let Some(err) = body
                    .get("error")
                    .and_then(check_openai_context_length_error)
                {
                    return Err(err.into());
                }
                Err(anyhow!("Request failed: {}\nResponse: {}", status, body))
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[Tool],
    ) -> Result<(AssistantResponse, Usage)> {
        let payload = self.payload(conversation, tools, false)?;
        let response: Value = self.post(&payload).await?.json().await?;

        // Raise specific error if context length is exceeded
        if let Some(error) = response.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err.into());
            }
            return Err(anyhow!("OpenAI API error: {}", error));
        }

        let assistant = openai_response_to_assistant(&response)?;
        let usage = get_usage(&response);
        tracing::debug!(
            model = %self.config.model,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            "openai completion"
        );

        Ok((assistant, usage))
    }

    async fn stream(&self, conversation: &Conversation, tools: &[Tool]) -> Result<ModelStream> {
        let payload = self.payload(conversation, tools, true)?;
        let response = self.post(&payload).await?;
        Ok(into_model_stream(response))
    }
}
