use super::base::{ModelStream, Provider, Usage};
use super::configs::OllamaProviderConfig;
use super::stream::into_model_stream;
use super::utils::{build_chat_payload, get_usage, openai_response_to_assistant};
use crate::models::conversation::Conversation;
use crate::models::message::AssistantResponse;
use crate::models::tool::Tool;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

pub const OLLAMA_HOST: &str = "http://localhost:11434";
pub const OLLAMA_MODEL: &str = "qwen2.5";

/// Talks to Ollama through its OpenAI-compatible chat endpoint
pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    async fn post(&self, payload: &Value) -> Result<Response> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self.client.post(&url).json(payload).send().await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            status => Err(anyhow!(
                "Request failed: {}\nPayload: {}",
                status,
                payload
            )),
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[Tool],
    ) -> Result<(AssistantResponse, Usage)> {
        let payload = build_chat_payload(
            &self.config.model,
            conversation,
            tools,
            self.config.temperature,
            self.config.max_tokens,
            false,
        )?;

        let response: Value = self.post(&payload).await?.json().await?;
        if let Some(error) = response.get("error") {
            return Err(anyhow!("Ollama API error: {}", error));
        }

        let assistant = openai_response_to_assistant(&response)?;
        Ok((assistant, get_usage(&response)))
    }

    async fn stream(&self, conversation: &Conversation, tools: &[Tool]) -> Result<ModelStream> {
        let payload = build_chat_payload(
            &self.config.model,
            conversation,
            tools,
            self.config.temperature,
            self.config.max_tokens,
            true,
        )?;

        let response = self.post(&payload).await?;
        Ok(into_model_stream(response))
    }
}
