use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::provider::{
    Message, MessageRole, Provider, ProviderAdapter, ProviderError, ProviderReply,
};

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_base_url(api_key, Provider::Gemini.default_base_url().to_string(), timeout)
    }

    pub fn with_base_url(
        api_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<GeminiContent> {
        let mut gemini_contents = Vec::new();
        let mut system_parts = Vec::new();

        for message in messages {
            match message.role {
                MessageRole::System => system_parts.push(message.content.clone()),
                MessageRole::User => gemini_contents.push(GeminiContent {
                    role: "user".to_string(),
                    parts: vec![GeminiPart {
                        text: message.content.clone(),
                    }],
                }),
                // Gemini calls the assistant "model"
                MessageRole::Assistant => gemini_contents.push(GeminiContent {
                    role: "model".to_string(),
                    parts: vec![GeminiPart {
                        text: message.content.clone(),
                    }],
                }),
            }
        }

        if !system_parts.is_empty() {
            let system_text = system_parts.join("\n");

            if let Some(first_user) = gemini_contents.iter_mut().find(|c| c.role == "user") {
                first_user.parts.insert(
                    0,
                    GeminiPart {
                        text: format!("System instructions: {}\n\nUser: ", system_text),
                    },
                );
            } else {
                gemini_contents.insert(
                    0,
                    GeminiContent {
                        role: "user".to_string(),
                        parts: vec![GeminiPart { text: system_text }],
                    },
                );
            }
        }

        gemini_contents
    }
}

#[async_trait]
impl ProviderAdapter for GeminiProvider {
    async fn call(
        &self,
        conversation: &[Message],
        model: &str,
    ) -> Result<ProviderReply, ProviderError> {
        let request = GeminiRequest {
            contents: self.convert_messages(conversation),
        };

        debug!("Making Gemini API request to model: {}", model);

        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!("Gemini API error: {} - {}", status, error_text);
            return Err(ProviderError::from_status(status.as_u16(), error_text));
        }

        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("Failed to parse response: {}", e)))?;

        body.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|content| content.parts.into_iter().next())
            .map(|part| ProviderReply::new(part.text))
            .ok_or_else(|| ProviderError::Malformed("No candidates in response".to_string()))
    }

    fn provider(&self) -> Provider {
        Provider::Gemini
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}
