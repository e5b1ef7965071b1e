//! In-process adapters for exercising dispatch without a network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::models::provider::{Message, Provider, ProviderAdapter, ProviderError, ProviderReply};
use crate::models::registry::ProviderRegistry;

/// Shared record of `(provider, model)` calls in the order they were made.
pub type CallLog = Arc<Mutex<Vec<(Provider, String)>>>;

pub struct ScriptedAdapter {
    provider: Provider,
    result: Result<String, ProviderError>,
    delay: Option<Duration>,
    calls: CallLog,
}

impl ScriptedAdapter {
    pub fn ok(provider: Provider, content: &str, calls: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            provider,
            result: Ok(content.to_string()),
            delay: None,
            calls: calls.clone(),
        })
    }

    pub fn failing(provider: Provider, error: ProviderError, calls: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            provider,
            result: Err(error),
            delay: None,
            calls: calls.clone(),
        })
    }

    pub fn slow(provider: Provider, delay: Duration, content: &str, calls: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            provider,
            result: Ok(content.to_string()),
            delay: Some(delay),
            calls: calls.clone(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn call(
        &self,
        _conversation: &[Message],
        model: &str,
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.lock().push((self.provider, model.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone().map(ProviderReply::new)
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}

pub fn new_call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn registry_of(adapters: Vec<Arc<ScriptedAdapter>>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    registry
}

pub fn called_providers(calls: &CallLog) -> Vec<Provider> {
    calls.lock().iter().map(|(p, _)| *p).collect()
}
