use std::sync::Arc;
use tracing::{error, info, warn};

use crate::billing::admission::insufficient_message;
use crate::billing::{AdmissionController, AdmissionDecision, Charge, MeteringUnit, Settlement};
use crate::generation::types::{GenerationOutcome, GenerationRequest};
use crate::routing::{ErrorKind, FallbackRouter};

const USAGE_NOT_RECORDED: &str = "Your usage could not be recorded, so the result was not \
     delivered. You were not charged; please try again.";

/// Admission, dispatch and metering for one request at a time.
///
/// Holds no per-request state, so one service can serve any number of
/// concurrent requests.
pub struct GenerationService {
    admission: AdmissionController,
    router: FallbackRouter,
    metering: MeteringUnit,
}

impl GenerationService {
    pub fn new(
        admission: AdmissionController,
        router: FallbackRouter,
        metering: MeteringUnit,
    ) -> Self {
        Self {
            admission,
            router,
            metering,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn router(&self) -> &FallbackRouter {
        &self.router
    }

    /// Never fails: every error path becomes a `GenerationOutcome::Failure`.
    pub async fn generate(&self, request: &GenerationRequest) -> GenerationOutcome {
        let admission = match self
            .admission
            .check(&request.user_id, request.category, &request.model_id)
            .await
        {
            AdmissionDecision::Admitted(admission) => admission,
            AdmissionDecision::Denied { kind, message } => {
                info!("Request {} not admitted ({}): {}", request.id, kind, message);
                return GenerationOutcome::failure(kind, message);
            }
        };

        let outcome = self.router.dispatch(request).await;
        let payload = match outcome {
            GenerationOutcome::Success(payload) => payload,
            failure => return failure,
        };

        // Metered accounts pay for the model they asked for, whoever served it.
        let charge = Charge {
            user_id: request.user_id.clone(),
            model_id: request.model_id.clone(),
            provider: payload.provider,
            cost: admission.charge,
            category: request.category,
        };

        match self.metering.settle(&charge).await {
            Settlement::Recorded { .. } => GenerationOutcome::Success(payload),
            Settlement::Insufficient { balance } => {
                warn!("Request {} withheld: balance spent before settlement", request.id);
                GenerationOutcome::failure(
                    ErrorKind::InsufficientTokens,
                    insufficient_message(&request.model_id, balance, charge.cost),
                )
            }
            Settlement::Failed(reason) => {
                error!("Request {} withheld: usage could not be recorded ({})", request.id, reason);
                GenerationOutcome::failure(ErrorKind::Unknown, USAGE_NOT_RECORDED)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::billing::PricingTable;
    use crate::generation::types::GenerationCategory;
    use crate::models::testing::{
        called_providers, new_call_log, registry_of, CallLog, ScriptedAdapter,
    };
    use crate::models::{
        Message, Provider, ProviderAdapter, ProviderError, ProviderRegistry, ProviderReply,
    };
    use crate::routing::{
        default_routes, DispatchPolicy, FallbackChain, ModelResolver, RouteTarget,
    };
    use crate::storage::{BalanceStore, MemoryStore, QuotaLimits, Tier, TokenDebit};

    fn service(store: &Arc<MemoryStore>, registry: ProviderRegistry) -> GenerationService {
        let resolver = ModelResolver::new(default_routes(), RouteTarget::default()).unwrap();
        let router = FallbackRouter::new(
            resolver,
            registry,
            FallbackChain::default(),
            DispatchPolicy::default(),
        )
        .unwrap();
        GenerationService::new(
            AdmissionController::new(store.clone(), store.clone(), PricingTable::default()),
            router,
            MeteringUnit::new(store.clone(), store.clone()),
        )
    }

    fn healthy_registry(calls: &CallLog) -> ProviderRegistry {
        registry_of(
            Provider::ALL
                .iter()
                .map(|p| ScriptedAdapter::ok(*p, &format!("from {}", p), calls))
                .collect(),
        )
    }

    fn failing_registry(calls: &CallLog) -> ProviderRegistry {
        registry_of(
            Provider::ALL
                .iter()
                .map(|p| {
                    let error = ProviderError::Transport("connection refused".into());
                    ScriptedAdapter::failing(*p, error, calls)
                })
                .collect(),
        )
    }

    fn chat(user: &str, model: &str) -> GenerationRequest {
        GenerationRequest::chat(user, model, vec![Message::user("hello")])
    }

    #[tokio::test]
    async fn test_quota_denial_makes_no_provider_call() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.set_usage("u1", GenerationCategory::Image, 5);
        let calls = new_call_log();
        let service = service(&store, healthy_registry(&calls));

        let request = GenerationRequest::prompt(
            "u1",
            GenerationCategory::Image,
            "gemini-flash",
            "a lighthouse",
        );
        let outcome = service.generate(&request).await;

        assert!(outcome.limit_reached());
        assert!(outcome.payload().is_none());
        assert!(calls.lock().is_empty());
        assert_eq!(store.debit_calls(), 0);
        assert_eq!(store.increment_calls(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_balance_makes_no_call_and_no_debit() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 100);
        let calls = new_call_log();
        let service = service(&store, healthy_registry(&calls));

        let outcome = service.generate(&chat("p1", "gpt-4o")).await;

        assert!(outcome.insufficient_tokens());
        assert!(calls.lock().is_empty());
        assert_eq!(store.debit_calls(), 0);
        assert_eq!(store.balance("p1"), 100);
    }

    #[tokio::test]
    async fn test_success_meters_exactly_once() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 1000);
        let calls = new_call_log();
        let service = service(&store, healthy_registry(&calls));

        let outcome = service.generate(&chat("p1", "gpt-4o")).await;

        assert!(outcome.is_success());
        assert_eq!(called_providers(&calls), vec![Provider::OpenAi]);
        assert_eq!(store.debit_calls(), 1);
        assert_eq!(store.increment_calls(), 1);
        assert_eq!(store.balance("p1"), 500);
        assert_eq!(store.usage("p1", GenerationCategory::Chat), 1);
    }

    #[tokio::test]
    async fn test_failure_meters_nothing() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 1000);
        let calls = new_call_log();
        let service = service(&store, failing_registry(&calls));

        let outcome = service.generate(&chat("p1", "gpt-4o")).await;

        assert_eq!(outcome.error_kind(), Some(ErrorKind::Network));
        assert!(!calls.lock().is_empty());
        assert_eq!(store.debit_calls(), 0);
        assert_eq!(store.increment_calls(), 0);
        assert_eq!(store.balance("p1"), 1000);
    }

    #[tokio::test]
    async fn test_free_user_is_counted_not_charged() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        let calls = new_call_log();
        let service = service(&store, healthy_registry(&calls));

        let outcome = service.generate(&chat("u1", "claude-3.5-sonnet")).await;

        assert!(outcome.is_success());
        assert_eq!(store.debit_calls(), 0);
        assert_eq!(store.usage("u1", GenerationCategory::Chat), 1);
    }

    #[tokio::test]
    async fn test_fallback_success_charges_requested_model() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 1000);
        let calls = new_call_log();
        let registry = registry_of(vec![
            ScriptedAdapter::failing(
                Provider::Groq,
                ProviderError::RateLimited("rate limit exceeded".into()),
                &calls,
            ),
            ScriptedAdapter::ok(Provider::Gemini, "from gemini", &calls),
        ]);
        let service = service(&store, registry);

        let outcome = service.generate(&chat("p1", "grok-2")).await;

        let payload = outcome.payload().unwrap();
        assert_eq!(payload.provider, Provider::Gemini);
        let ledger = store.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].model_id, "grok-2");
        assert_eq!(ledger[0].provider, Provider::Gemini);
        assert_eq!(ledger[0].amount, 300);
    }

    #[tokio::test]
    async fn test_increment_failure_still_delivers() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 1000);
        store.fail_increments(true);
        let calls = new_call_log();
        let service = service(&store, healthy_registry(&calls));

        let outcome = service.generate(&chat("p1", "gpt-4o")).await;

        assert!(outcome.is_success());
        assert_eq!(store.balance("p1"), 500);
    }

    #[tokio::test]
    async fn test_debit_failure_withholds_payload() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 1000);
        store.fail_debits(true);
        let calls = new_call_log();
        let service = service(&store, healthy_registry(&calls));

        let outcome = service.generate(&chat("p1", "gpt-4o")).await;

        assert_eq!(outcome.error_kind(), Some(ErrorKind::Unknown));
        assert!(outcome.payload().is_none());
        assert_eq!(store.increment_calls(), 0);
    }

    #[tokio::test]
    async fn test_quota_store_outage_blocks_dispatch() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.fail_reads(true);
        let calls = new_call_log();
        let service = service(&store, healthy_registry(&calls));

        let outcome = service.generate(&chat("u1", "gpt-4o")).await;

        assert_eq!(outcome.error_kind(), Some(ErrorKind::Unknown));
        assert!(calls.lock().is_empty());
    }

    /// Spends the user's balance while the generation is in flight, the way a
    /// concurrent request from the same account would.
    struct SpendingAdapter {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl ProviderAdapter for SpendingAdapter {
        async fn call(
            &self,
            _conversation: &[Message],
            _model: &str,
        ) -> Result<ProviderReply, ProviderError> {
            let debit = TokenDebit {
                user_id: "p1".to_string(),
                model_id: "gpt-4o".to_string(),
                provider: Provider::OpenAi,
                amount: 800,
                category: GenerationCategory::Chat,
            };
            self.store.debit(&debit).await.map_err(|e| ProviderError::Other(e.to_string()))?;
            Ok(ProviderReply::new("spent"))
        }

        fn provider(&self) -> Provider {
            Provider::OpenAi
        }
    }

    #[tokio::test]
    async fn test_balance_spent_concurrently_withholds_payload() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 1000);
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(SpendingAdapter { store: store.clone() }));
        let service = service(&store, registry);

        let outcome = service.generate(&chat("p1", "gpt-4o")).await;

        assert!(outcome.insufficient_tokens());
        assert_eq!(store.balance("p1"), 200);
        assert_eq!(store.ledger().len(), 1);
        assert_eq!(store.usage("p1", GenerationCategory::Chat), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_nothing() {
        let store = Arc::new(MemoryStore::new(QuotaLimits::default()));
        store.upsert_account("p1", Tier::Premium, 0, 10_000);
        let calls = new_call_log();
        let service = Arc::new(service(&store, healthy_registry(&calls)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                let user = if i % 2 == 0 { "p1" } else { "u2" };
                service.generate(&chat(user, "gemini-flash")).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }

        assert_eq!(store.usage("p1", GenerationCategory::Chat), 4);
        assert_eq!(store.usage("u2", GenerationCategory::Chat), 4);
        assert_eq!(store.balance("p1"), 10_000 - 4 * 25);
    }
}
