use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::config::ProviderConfig;
use crate::error::Result;
use crate::models::anthropic::AnthropicProvider;
use crate::models::gemini::GeminiProvider;
use crate::models::openai::OpenAICompatibleProvider;
use crate::models::provider::{Provider, ProviderAdapter};

/// The set of adapters available to the router, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per provider that has an API key. Credentials are
    /// captured here and never re-read.
    pub fn from_config(providers: &HashMap<Provider, ProviderConfig>) -> Result<Self> {
        let mut registry = Self::new();

        for provider in Provider::ALL {
            let Some(config) = providers.get(&provider) else {
                continue;
            };
            let Some(api_key) = config.api_key.clone().filter(|k| !k.trim().is_empty()) else {
                debug!("Provider {} has no API key, leaving it unregistered", provider);
                continue;
            };

            let timeout = Duration::from_secs(config.timeout_seconds);
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| provider.default_base_url().to_string());

            let adapter: Arc<dyn ProviderAdapter> = match provider {
                Provider::Anthropic => {
                    Arc::new(AnthropicProvider::with_base_url(api_key, base_url, timeout)?)
                }
                Provider::Gemini => {
                    Arc::new(GeminiProvider::with_base_url(api_key, base_url, timeout)?)
                }
                _ => Arc::new(OpenAICompatibleProvider::with_base_url(
                    provider, api_key, base_url, timeout,
                )?),
            };
            registry.register(adapter);
        }

        if registry.is_empty() {
            warn!("No provider has an API key configured; every dispatch will fail");
        } else {
            info!("Registered providers: {:?}", registry.providers());
        }

        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.adapters.contains_key(&provider)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Registered providers in canonical order.
    pub fn providers(&self) -> Vec<Provider> {
        Provider::ALL
            .iter()
            .copied()
            .filter(|p| self.adapters.contains_key(p))
            .collect()
    }
}
