use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::provider::{Message, Provider, ProviderAdapter, ProviderError, ProviderReply};

/// Adapter for every vendor exposing the OpenAI chat-completions API
/// (OpenAI itself, Groq, DeepSeek, Mistral, xAI).
pub struct OpenAICompatibleProvider {
    provider: Provider,
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAICompatibleProvider {
    pub fn new(
        provider: Provider,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Self::with_base_url(provider, api_key, provider.default_base_url().to_string(), timeout)
    }

    pub fn with_base_url(
        provider: Provider,
        api_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn create_headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ProviderError::Unauthorized(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OpenAIMessage> {
        messages
            .iter()
            .map(|msg| OpenAIMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAICompatibleProvider {
    async fn call(
        &self,
        conversation: &[Message],
        model: &str,
    ) -> Result<ProviderReply, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let headers = self.create_headers()?;

        let request = OpenAIRequest {
            model: model.to_string(),
            messages: self.convert_messages(conversation),
            stream: false,
        };

        debug!(
            "Sending request to {}: model={}, messages={}",
            self.provider,
            model,
            conversation.len()
        );
        let start_time = Instant::now();

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&request)
            .send()
            .await?;

        debug!("{} request completed in {:?}", self.provider, start_time.elapsed());

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!("{} API error: {} - {}", self.provider, status, error_text);
            return Err(ProviderError::from_status(status.as_u16(), error_text));
        }

        let body: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("Failed to parse response: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("No choices in response".to_string()))?;

        Ok(ProviderReply::new(content))
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}
