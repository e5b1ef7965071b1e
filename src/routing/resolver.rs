use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::Provider;

/// Static mapping from a logical model id to the endpoint that serves it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRoute {
    /// Logical model id chosen by the caller.
    pub id: String,
    pub provider: Provider,
    /// Model name understood by the provider.
    pub model: String,
    /// Alternate model on the same provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
}

impl ModelRoute {
    pub fn new(id: &str, provider: Provider, model: &str) -> Self {
        Self {
            id: id.to_string(),
            provider,
            model: model.to_string(),
            fallback_model: None,
        }
    }

    pub fn with_fallback_model(mut self, model: &str) -> Self {
        self.fallback_model = Some(model.to_string());
        self
    }
}

/// Provider/model pair used for ids missing from the table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteTarget {
    pub provider: Provider,
    pub model: String,
}

impl Default for RouteTarget {
    fn default() -> Self {
        Self {
            provider: Provider::Groq,
            model: "llama-3.1-8b-instant".to_string(),
        }
    }
}

pub fn default_routes() -> Vec<ModelRoute> {
    vec![
        ModelRoute::new("gpt-4o", Provider::OpenAi, "gpt-4o").with_fallback_model("gpt-4o-mini"),
        ModelRoute::new("gpt-4o-mini", Provider::OpenAi, "gpt-4o-mini"),
        ModelRoute::new("claude-3.5-sonnet", Provider::Anthropic, "claude-3-5-sonnet-latest")
            .with_fallback_model("claude-3-5-haiku-latest"),
        ModelRoute::new("claude-3.5-haiku", Provider::Anthropic, "claude-3-5-haiku-latest"),
        ModelRoute::new("gemini-pro", Provider::Gemini, "gemini-1.5-pro")
            .with_fallback_model("gemini-1.5-flash"),
        ModelRoute::new("gemini-flash", Provider::Gemini, "gemini-1.5-flash"),
        ModelRoute::new("grok-2", Provider::Groq, "llama-3.3-70b-versatile")
            .with_fallback_model("llama-3.1-8b-instant"),
        ModelRoute::new("llama-3.1", Provider::Groq, "llama-3.1-8b-instant"),
        ModelRoute::new("deepseek-chat", Provider::DeepSeek, "deepseek-chat"),
        ModelRoute::new("deepseek-r1", Provider::DeepSeek, "deepseek-reasoner")
            .with_fallback_model("deepseek-chat"),
        ModelRoute::new("mistral-large", Provider::Mistral, "mistral-large-latest")
            .with_fallback_model("mistral-small-latest"),
        ModelRoute::new("grok-beta", Provider::Xai, "grok-beta"),
    ]
}

/// Exact-match lookup of logical model ids. Unknown ids resolve to the
/// default target, never to an undefined provider.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    routes: HashMap<String, ModelRoute>,
    default_target: RouteTarget,
}

impl ModelResolver {
    pub fn new(routes: Vec<ModelRoute>, default_target: RouteTarget) -> Result<Self> {
        let mut table = HashMap::with_capacity(routes.len());
        for route in routes {
            if route.id.trim().is_empty() || route.model.trim().is_empty() {
                return Err(Error::validation("Model route has an empty id or model"));
            }
            if let Some(previous) = table.insert(route.id.clone(), route) {
                return Err(Error::validation(format!(
                    "Duplicate model route: {}",
                    previous.id
                )));
            }
        }

        Ok(Self {
            routes: table,
            default_target,
        })
    }

    pub fn resolve(&self, logical_model_id: &str) -> ModelRoute {
        match self.routes.get(logical_model_id) {
            Some(route) => route.clone(),
            None => {
                debug!(
                    "No route for model '{}', using default {}/{}",
                    logical_model_id, self.default_target.provider, self.default_target.model
                );
                ModelRoute::new(
                    logical_model_id,
                    self.default_target.provider,
                    &self.default_target.model,
                )
            }
        }
    }

    pub fn default_target(&self) -> &RouteTarget {
        &self.default_target
    }

    /// All configured routes, sorted by id.
    pub fn routes(&self) -> Vec<&ModelRoute> {
        let mut routes: Vec<_> = self.routes.values().collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        routes
    }
}
