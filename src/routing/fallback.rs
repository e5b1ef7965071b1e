use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::generation::types::{
    FailedAttempt, FallbackNotice, GenerationCategory, GenerationFailure, GenerationOutcome,
    GenerationPayload, GenerationRequest,
};
use crate::models::{Message, Provider, ProviderError, ProviderRegistry, ProviderReply};
use crate::routing::classifier::ErrorClassifier;
use crate::routing::resolver::ModelResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTier {
    Fast,
    Medium,
    Slow,
}

/// An alternate provider tried after the primary route fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackCandidate {
    pub provider: Provider,
    pub model: String,
    pub display_name: String,
    pub speed: SpeedTier,
}

impl FallbackCandidate {
    pub fn new(provider: Provider, model: &str, display_name: &str, speed: SpeedTier) -> Self {
        Self {
            provider,
            model: model.to_string(),
            display_name: display_name.to_string(),
            speed,
        }
    }
}

/// Hand-ordered from lowest latency / highest reliability to slowest.
pub fn default_chain() -> Vec<FallbackCandidate> {
    use SpeedTier::{Fast, Medium, Slow};

    vec![
        FallbackCandidate::new(Provider::Gemini, "gemini-1.5-flash", "Gemini 1.5 Flash", Fast),
        FallbackCandidate::new(
            Provider::Groq,
            "llama-3.3-70b-versatile",
            "Llama 3.3 70B (Groq)",
            Fast,
        ),
        FallbackCandidate::new(Provider::OpenAi, "gpt-4o-mini", "GPT-4o mini", Medium),
        FallbackCandidate::new(Provider::Mistral, "mistral-small-latest", "Mistral Small", Medium),
        FallbackCandidate::new(Provider::DeepSeek, "deepseek-chat", "DeepSeek Chat", Slow),
        FallbackCandidate::new(
            Provider::Anthropic,
            "claude-3-5-haiku-latest",
            "Claude 3.5 Haiku",
            Slow,
        ),
    ]
}

/// Ordered fallback candidates, uniform across categories unless a category
/// has its own override.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    default: Vec<FallbackCandidate>,
    per_category: HashMap<GenerationCategory, Vec<FallbackCandidate>>,
}

impl FallbackChain {
    pub fn new(default: Vec<FallbackCandidate>) -> Self {
        Self {
            default,
            per_category: HashMap::new(),
        }
    }

    pub fn with_override(
        mut self,
        category: GenerationCategory,
        chain: Vec<FallbackCandidate>,
    ) -> Self {
        self.per_category.insert(category, chain);
        self
    }

    pub fn for_category(&self, category: GenerationCategory) -> &[FallbackCandidate] {
        self.per_category
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&self.default)
    }
}

impl Default for FallbackChain {
    fn default() -> Self {
        Self::new(default_chain())
    }
}

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Upper bound for a single adapter call on top of the adapter's own HTTP timeout.
    pub attempt_timeout: Option<Duration>,
    /// Budget for the primary call plus the whole fallback pass.
    pub overall_deadline: Option<Duration>,
    /// Try the route's same-provider fallback model before leaving the provider.
    pub retry_same_provider: bool,
    /// Maximum characters of an upstream error kept in logs and messages.
    pub error_excerpt_chars: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Some(Duration::from_secs(45)),
            overall_deadline: Some(Duration::from_secs(120)),
            retry_same_provider: false,
            error_excerpt_chars: 200,
        }
    }
}

struct DeadlineBudget {
    deadline: Option<Instant>,
}

impl DeadlineBudget {
    fn start(overall: Option<Duration>) -> Self {
        Self {
            deadline: overall.map(|d| Instant::now() + d),
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn is_exhausted(&self) -> bool {
        self.remaining().map_or(false, |r| r.is_zero())
    }

    fn attempt_limit(&self, per_attempt: Option<Duration>) -> Option<Duration> {
        match (per_attempt, self.remaining()) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }
}

/// Sends a request to its resolved route and, on failure, walks the fallback
/// chain sequentially until one provider answers.
pub struct FallbackRouter {
    resolver: ModelResolver,
    registry: ProviderRegistry,
    chain: FallbackChain,
    classifier: ErrorClassifier,
    policy: DispatchPolicy,
}

impl FallbackRouter {
    pub fn new(
        resolver: ModelResolver,
        registry: ProviderRegistry,
        chain: FallbackChain,
        policy: DispatchPolicy,
    ) -> Result<Self> {
        if chain.for_category(GenerationCategory::Chat).is_empty() {
            return Err(Error::validation("Fallback chain must not be empty"));
        }

        Ok(Self {
            resolver,
            registry,
            chain,
            classifier: ErrorClassifier::new()?,
            policy,
        })
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub async fn dispatch(&self, request: &GenerationRequest) -> GenerationOutcome {
        let route = self.resolver.resolve(&request.model_id);
        let conversation = request.input.to_conversation();
        let budget = DeadlineBudget::start(self.policy.overall_deadline);
        let mut attempted = vec![route.provider];
        let mut failures = Vec::new();

        info!(
            "Dispatching request {} ({}) for model '{}' to {}/{}",
            request.id, request.category, request.model_id, route.provider, route.model
        );

        let primary_error = match self
            .attempt(route.provider, &route.model, &conversation, &budget)
            .await
        {
            Ok(reply) => {
                return GenerationOutcome::Success(GenerationPayload {
                    content: reply.content,
                    provider: route.provider,
                    model: route.model,
                    fallback: None,
                    attempted,
                });
            }
            Err(e) => e,
        };
        warn!(
            "Primary provider {} failed for request {}: {}",
            route.provider,
            request.id,
            self.excerpt(&primary_error.to_string())
        );
        failures.push(self.failed(route.provider, &route.model, &primary_error));

        if self.policy.retry_same_provider {
            if let Some(model) = route.fallback_model.as_deref().filter(|m| *m != route.model) {
                if !budget.is_exhausted() {
                    match self.attempt(route.provider, model, &conversation, &budget).await {
                        Ok(reply) => {
                            info!(
                                "Request {} served by {}/{} after model fallback",
                                request.id, route.provider, model
                            );
                            return GenerationOutcome::Success(GenerationPayload {
                                content: reply.content,
                                provider: route.provider,
                                model: model.to_string(),
                                fallback: None,
                                attempted,
                            });
                        }
                        Err(e) => {
                            warn!(
                                "Same-provider model {}/{} failed: {}",
                                route.provider,
                                model,
                                self.excerpt(&e.to_string())
                            );
                            failures.push(self.failed(route.provider, model, &e));
                        }
                    }
                }
            }
        }

        for candidate in self.chain.for_category(request.category) {
            if attempted.contains(&candidate.provider) {
                debug!("Skipping fallback {}: already attempted", candidate.provider);
                continue;
            }
            if !self.registry.contains(candidate.provider) {
                debug!("Skipping fallback {}: not configured", candidate.provider);
                continue;
            }
            if budget.is_exhausted() {
                warn!("Dispatch deadline exhausted for request {}, stopping fallback", request.id);
                break;
            }

            attempted.push(candidate.provider);
            match self
                .attempt(candidate.provider, &candidate.model, &conversation, &budget)
                .await
            {
                Ok(reply) => {
                    let notice = FallbackNotice {
                        served_by: candidate.provider,
                        served_by_name: candidate.display_name.clone(),
                        original_provider: route.provider,
                    };
                    info!(
                        "Request {} served by fallback {} after {} failed",
                        request.id, candidate.provider, route.provider
                    );
                    return GenerationOutcome::Success(GenerationPayload {
                        content: format!("{}\n\n---\n{}", reply.content, notice.text()),
                        provider: candidate.provider,
                        model: candidate.model.clone(),
                        fallback: Some(notice),
                        attempted,
                    });
                }
                Err(e) => {
                    warn!(
                        "Fallback {} failed for request {}: {}",
                        candidate.provider,
                        request.id,
                        self.excerpt(&e.to_string())
                    );
                    failures.push(self.failed(candidate.provider, &candidate.model, &e));
                }
            }
        }

        self.exhausted(request, route.provider, &primary_error, attempted, failures)
    }

    async fn attempt(
        &self,
        provider: Provider,
        model: &str,
        conversation: &[Message],
        budget: &DeadlineBudget,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or_else(|| ProviderError::missing_key(provider))?;

        debug!("Calling {}/{}", provider, model);
        let started = Instant::now();

        let result = match budget.attempt_limit(self.policy.attempt_timeout) {
            Some(limit) => tokio::time::timeout(limit, adapter.call(conversation, model))
                .await
                .unwrap_or(Err(ProviderError::Timeout(limit))),
            None => adapter.call(conversation, model).await,
        };

        debug!("{}/{} finished in {:?}", provider, model, started.elapsed());
        result
    }

    fn exhausted(
        &self,
        request: &GenerationRequest,
        primary: Provider,
        primary_error: &ProviderError,
        attempted: Vec<Provider>,
        failures: Vec<FailedAttempt>,
    ) -> GenerationOutcome {
        let kind = self.classifier.classify_provider_error(primary_error);
        let tried = attempted
            .iter()
            .map(Provider::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        error!(
            "All providers failed for request {} ({} attempts): {}",
            request.id,
            failures.len(),
            tried
        );

        let message = format!(
            "{} Providers tried: {}. {}\n\nOriginal error from {}: {}",
            kind.headline(),
            tried,
            kind.remediation(),
            primary,
            self.excerpt(&primary_error.to_string())
        );

        GenerationOutcome::Failure(GenerationFailure {
            kind,
            message,
            attempted,
            attempts: failures,
        })
    }

    fn failed(&self, provider: Provider, model: &str, error: &ProviderError) -> FailedAttempt {
        FailedAttempt {
            provider,
            model: model.to_string(),
            kind: self.classifier.classify_provider_error(error),
            error: self.excerpt(&error.to_string()),
        }
    }

    fn excerpt(&self, text: &str) -> String {
        let limit = self.policy.error_excerpt_chars;
        if text.chars().count() <= limit {
            text.to_string()
        } else {
            let mut cut: String = text.chars().take(limit).collect();
            cut.push('…');
            cut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::{called_providers, new_call_log, registry_of, ScriptedAdapter};
    use crate::routing::resolver::{default_routes, RouteTarget};
    use crate::routing::ErrorKind;
    use super::SpeedTier::{Fast, Medium};

    fn router(
        registry: ProviderRegistry,
        chain: FallbackChain,
        policy: DispatchPolicy,
    ) -> FallbackRouter {
        let resolver = ModelResolver::new(default_routes(), RouteTarget::default()).unwrap();
        FallbackRouter::new(resolver, registry, chain, policy).unwrap()
    }

    fn chat(model: &str) -> GenerationRequest {
        GenerationRequest::chat("user-1", model, vec![Message::user("hello")])
    }

    #[tokio::test]
    async fn test_primary_success_makes_no_fallback_calls() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::ok(Provider::Groq, "from groq", &calls),
            ScriptedAdapter::ok(Provider::Gemini, "from gemini", &calls),
        ]);
        let router = router(registry, FallbackChain::default(), DispatchPolicy::default());

        let outcome = router.dispatch(&chat("grok-2")).await;

        let payload = outcome.payload().unwrap();
        assert_eq!(payload.content, "from groq");
        assert_eq!(payload.provider, Provider::Groq);
        assert!(payload.fallback.is_none());
        assert_eq!(called_providers(&calls), vec![Provider::Groq]);
    }

    #[tokio::test]
    async fn test_rate_limited_primary_falls_back_to_gemini() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::failing(
                Provider::Groq,
                ProviderError::Other("rate limit exceeded".into()),
                &calls,
            ),
            ScriptedAdapter::ok(Provider::Gemini, "answer", &calls),
            ScriptedAdapter::ok(Provider::OpenAi, "unused", &calls),
        ]);
        let router = router(registry, FallbackChain::default(), DispatchPolicy::default());
        assert_eq!(router.classifier().classify("rate limit exceeded"), ErrorKind::RateLimit);

        let outcome = router.dispatch(&chat("grok-2")).await;

        let payload = outcome.payload().unwrap();
        assert_eq!(payload.provider, Provider::Gemini);
        assert!(payload.content.starts_with("answer\n\n---\n"));
        assert!(payload.content.contains("groq was unavailable"));
        assert!(payload.content.contains("(gemini)"));
        let notice = payload.fallback.as_ref().unwrap();
        assert_eq!(notice.served_by, Provider::Gemini);
        assert_eq!(notice.original_provider, Provider::Groq);
        assert_eq!(called_providers(&calls), vec![Provider::Groq, Provider::Gemini]);
    }

    #[tokio::test]
    async fn test_failed_primary_is_never_called_again() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::failing(
                Provider::Gemini,
                ProviderError::Transport("fetch failed".into()),
                &calls,
            ),
            ScriptedAdapter::failing(Provider::Groq, ProviderError::Other("boom".into()), &calls),
            ScriptedAdapter::ok(Provider::OpenAi, "ok", &calls),
        ]);
        let router = router(registry, FallbackChain::default(), DispatchPolicy::default());

        let outcome = router.dispatch(&chat("gemini-flash")).await;

        assert_eq!(outcome.payload().unwrap().provider, Provider::OpenAi);
        assert_eq!(
            called_providers(&calls),
            vec![Provider::Gemini, Provider::Groq, Provider::OpenAi]
        );
    }

    #[tokio::test]
    async fn test_exhausted_chain_lists_each_provider_once() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::failing(
                Provider::Groq,
                ProviderError::RateLimited("rate limit exceeded".into()),
                &calls,
            ),
            ScriptedAdapter::failing(
                Provider::Gemini,
                ProviderError::Other("overloaded".into()),
                &calls,
            ),
            ScriptedAdapter::failing(
                Provider::OpenAi,
                ProviderError::Transport("reset".into()),
                &calls,
            ),
        ]);
        let chain = FallbackChain::new(vec![
            FallbackCandidate::new(Provider::Gemini, "gemini-1.5-flash", "Flash", Fast),
            FallbackCandidate::new(Provider::Groq, "llama-3.1-8b-instant", "Llama", Fast),
            FallbackCandidate::new(Provider::Gemini, "gemini-1.5-pro", "Pro", Medium),
            FallbackCandidate::new(Provider::OpenAi, "gpt-4o-mini", "Mini", Medium),
        ]);
        let router = router(registry, chain, DispatchPolicy::default());

        let outcome = router.dispatch(&chat("grok-2")).await;

        let expected = vec![Provider::Groq, Provider::Gemini, Provider::OpenAi];
        assert_eq!(called_providers(&calls), expected);
        match outcome {
            GenerationOutcome::Failure(failure) => {
                assert_eq!(failure.kind, ErrorKind::RateLimit);
                assert_eq!(failure.attempted, expected);
                assert!(failure.message.contains("Providers tried: groq, gemini, openai."));
                assert!(failure.message.contains(ErrorKind::RateLimit.remediation()));

                let attempts: Vec<(Provider, &str, ErrorKind)> = failure
                    .attempts
                    .iter()
                    .map(|a| (a.provider, a.model.as_str(), a.kind))
                    .collect();
                assert_eq!(
                    attempts,
                    vec![
                        (Provider::Groq, "llama-3.3-70b-versatile", ErrorKind::RateLimit),
                        (Provider::Gemini, "gemini-1.5-flash", ErrorKind::Unknown),
                        (Provider::OpenAi, "gpt-4o-mini", ErrorKind::Network),
                    ]
                );
                assert!(failure.attempts[1].error.contains("overloaded"));
            }
            GenerationOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_candidates_are_skipped() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::failing(Provider::Groq, ProviderError::Other("boom".into()), &calls),
            ScriptedAdapter::ok(Provider::DeepSeek, "deep", &calls),
        ]);
        let router = router(registry, FallbackChain::default(), DispatchPolicy::default());

        let outcome = router.dispatch(&chat("grok-2")).await;

        let payload = outcome.payload().unwrap();
        assert_eq!(payload.provider, Provider::DeepSeek);
        assert_eq!(payload.attempted, vec![Provider::Groq, Provider::DeepSeek]);
    }

    #[tokio::test]
    async fn test_unregistered_primary_fails_as_auth_config() {
        let calls = new_call_log();
        let router = router(
            registry_of(vec![ScriptedAdapter::failing(
                Provider::Gemini,
                ProviderError::Other("x".into()),
                &calls,
            )]),
            FallbackChain::default(),
            DispatchPolicy::default(),
        );

        let outcome = router.dispatch(&chat("gpt-4o")).await;

        assert_eq!(outcome.error_kind(), Some(ErrorKind::AuthConfig));
        assert_eq!(called_providers(&calls), vec![Provider::Gemini]);
        assert_eq!(outcome.attempts()[0].provider, Provider::OpenAi);
        assert_eq!(outcome.attempts()[0].kind, ErrorKind::AuthConfig);
    }

    #[tokio::test]
    async fn test_slow_attempt_is_cut_off() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::slow(Provider::Groq, Duration::from_secs(5), "late", &calls),
            ScriptedAdapter::ok(Provider::Gemini, "fast", &calls),
        ]);
        let policy = DispatchPolicy {
            attempt_timeout: Some(Duration::from_millis(50)),
            overall_deadline: None,
            ..DispatchPolicy::default()
        };
        let router = router(registry, FallbackChain::default(), policy);

        let outcome = router.dispatch(&chat("grok-2")).await;

        assert_eq!(outcome.payload().unwrap().provider, Provider::Gemini);
    }

    #[tokio::test]
    async fn test_overall_deadline_stops_the_chain() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::slow(Provider::Groq, Duration::from_secs(5), "late", &calls),
            ScriptedAdapter::ok(Provider::Gemini, "never", &calls),
        ]);
        let policy = DispatchPolicy {
            attempt_timeout: None,
            overall_deadline: Some(Duration::from_millis(80)),
            ..DispatchPolicy::default()
        };
        let router = router(registry, FallbackChain::default(), policy);

        let outcome = router.dispatch(&chat("grok-2")).await;

        assert_eq!(outcome.error_kind(), Some(ErrorKind::Network));
        assert_eq!(called_providers(&calls), vec![Provider::Groq]);
    }

    #[tokio::test]
    async fn test_same_provider_model_retry_is_opt_in() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::failing(
                Provider::Groq,
                ProviderError::Other("model decommissioned".into()),
                &calls,
            ),
            ScriptedAdapter::ok(Provider::Gemini, "ok", &calls),
        ]);
        let policy = DispatchPolicy {
            retry_same_provider: true,
            ..DispatchPolicy::default()
        };
        let router = router(registry, FallbackChain::default(), policy);

        router.dispatch(&chat("grok-2")).await;

        let models: Vec<String> = calls.lock().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(
            models,
            vec!["llama-3.3-70b-versatile", "llama-3.1-8b-instant", "gemini-1.5-flash"]
        );
    }

    #[tokio::test]
    async fn test_category_override_chain() {
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::failing(Provider::Gemini, ProviderError::Other("down".into()), &calls),
            ScriptedAdapter::ok(Provider::OpenAi, "image url", &calls),
            ScriptedAdapter::ok(Provider::Groq, "unused", &calls),
        ]);
        let chain = FallbackChain::default().with_override(
            GenerationCategory::Image,
            vec![FallbackCandidate::new(
                Provider::OpenAi,
                "dall-e-3",
                "DALL-E 3",
                SpeedTier::Slow,
            )],
        );
        let router = router(registry, chain, DispatchPolicy::default());

        let request =
            GenerationRequest::prompt("u", GenerationCategory::Image, "gemini-flash", "a fox");
        let outcome = router.dispatch(&request).await;

        let payload = outcome.payload().unwrap();
        assert_eq!(payload.provider, Provider::OpenAi);
        assert_eq!(payload.model, "dall-e-3");
        assert_eq!(called_providers(&calls), vec![Provider::Gemini, Provider::OpenAi]);
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let policy = DispatchPolicy {
            error_excerpt_chars: 3,
            ..DispatchPolicy::default()
        };
        let router = router(ProviderRegistry::new(), FallbackChain::default(), policy);
        assert_eq!(router.excerpt("héllo"), "hél…");
        assert_eq!(router.excerpt("hi"), "hi");
    }
}
