use std::sync::Arc;
use tracing::info;

use crate::app::config::AppConfig;
use crate::billing::{AdmissionController, MeteringUnit};
use crate::error::{Error, Result};
use crate::generation::GenerationService;
use crate::models::ProviderRegistry;
use crate::platform::AppPaths;
use crate::routing::FallbackRouter;
use crate::storage::{
    BalanceStore, Database, LedgerEntry, MemoryStore, QuotaStore, SqliteStore, Tier, TierInfo,
};

/// Where quota counters and balances live for this process.
#[derive(Clone)]
pub enum StoreHandle {
    Sqlite(Arc<SqliteStore>),
    /// Process-local; nothing survives exit.
    Memory(Arc<MemoryStore>),
}

impl StoreHandle {
    pub fn quota(&self) -> Arc<dyn QuotaStore> {
        match self {
            StoreHandle::Sqlite(store) => store.clone(),
            StoreHandle::Memory(store) => store.clone(),
        }
    }

    pub fn balance(&self) -> Arc<dyn BalanceStore> {
        match self {
            StoreHandle::Sqlite(store) => store.clone(),
            StoreHandle::Memory(store) => store.clone(),
        }
    }

    pub async fn upsert_account(
        &self,
        user_id: &str,
        tier: Tier,
        free_tokens: u64,
        paid_tokens: u64,
    ) -> Result<TierInfo> {
        match self {
            StoreHandle::Sqlite(store) => {
                store.upsert_account(user_id, tier, free_tokens, paid_tokens).await
            }
            StoreHandle::Memory(store) => {
                Ok(store.upsert_account(user_id, tier, free_tokens, paid_tokens))
            }
        }
    }

    /// Only the SQLite store keeps a ledger with balances.
    pub async fn recent_debits(&self, user_id: &str, limit: u32) -> Result<Vec<LedgerEntry>> {
        match self {
            StoreHandle::Sqlite(store) => store.recent_debits(user_id, limit).await,
            StoreHandle::Memory(_) => Ok(Vec::new()),
        }
    }
}

pub struct AppState {
    config: AppConfig,
    paths: AppPaths,
    store: StoreHandle,
    service: GenerationService,
}

impl AppState {
    /// Validate the configuration once and wire every component from it.
    pub async fn new(config: AppConfig, paths: AppPaths, ephemeral: bool) -> Result<Self> {
        info!("Initializing application state");
        config.validate()?;

        let limits = config.to_quota_limits()?;
        let store = if ephemeral {
            info!("Using in-memory store; usage will not be persisted");
            StoreHandle::Memory(Arc::new(MemoryStore::new(limits)))
        } else {
            let database = match &config.database_url {
                Some(url) => Database::connect(url).await?,
                None => Database::new(&paths).await?,
            };
            // Balances live here; refuse to meter against a damaged file.
            if !database.verify_integrity().await? {
                return Err(Error::store("database integrity check failed"));
            }
            StoreHandle::Sqlite(Arc::new(SqliteStore::new(database.pool().clone(), limits)))
        };

        let registry = ProviderRegistry::from_config(&config.provider_configs()?)?;
        let router = FallbackRouter::new(
            config.to_resolver()?,
            registry,
            config.to_fallback_chain()?,
            config.to_dispatch_policy(),
        )?;
        let admission =
            AdmissionController::new(store.quota(), store.balance(), config.to_pricing_table()?);
        let metering = MeteringUnit::new(store.quota(), store.balance());

        Ok(Self {
            config,
            paths,
            store,
            service: GenerationService::new(admission, router, metering),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn service(&self) -> &GenerationService {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::ProviderConfig;
    use crate::generation::{GenerationCategory, GenerationRequest};
    use crate::models::{Message, Provider};
    use crate::routing::ErrorKind;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_with_groq(base_url: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.providers.insert(
            "groq".to_string(),
            ProviderConfig {
                api_key: Some("gsk-test".to_string()),
                base_url: Some(base_url.to_string()),
                timeout_seconds: 5,
            },
        );
        config
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_at_startup() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(temp_dir.path());
        let result = AppState::new(AppConfig::default(), paths, true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_generate_end_to_end_with_sqlite() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "a short poem"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(temp_dir.path());
        let state = AppState::new(config_with_groq(&server.uri()), paths, false).await.unwrap();
        state.store().upsert_account("p1", Tier::Premium, 0, 1000).await.unwrap();

        let conversation = vec![Message::user("write a poem")];
        let request = GenerationRequest::chat("p1", "llama-3.1", conversation);
        let outcome = state.service().generate(&request).await;

        let payload = outcome.payload().unwrap();
        assert_eq!(payload.content, "a short poem");
        assert_eq!(payload.provider, Provider::Groq);

        let info = state.store().balance().get_tier("p1").await.unwrap().unwrap();
        assert_eq!(info.token_balance, 980);
        let ledger = state.store().recent_debits("p1", 5).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].model_id, "llama-3.1");
    }

    #[tokio::test]
    async fn test_unconfigured_primary_fails_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(temp_dir.path());
        let state = AppState::new(config_with_groq(&server.uri()), paths, true).await.unwrap();

        // gpt-4o routes to OpenAI, which has no key; only groq from the chain is tried.
        let request = GenerationRequest::prompt("u1", GenerationCategory::Chat, "gpt-4o", "hi");
        let outcome = state.service().generate(&request).await;

        assert_eq!(outcome.error_kind(), Some(ErrorKind::AuthConfig));
        match &outcome {
            crate::generation::GenerationOutcome::Failure(failure) => {
                assert_eq!(failure.attempted, vec![Provider::OpenAi, Provider::Groq]);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_provider_does_not_expose_its_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let mut config = config_with_groq(&server.uri());
        config.providers.insert(
            "gemini".to_string(),
            ProviderConfig {
                api_key: Some("SECRETKEY123".to_string()),
                base_url: Some("http://127.0.0.1:1".to_string()),
                timeout_seconds: 2,
            },
        );
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(temp_dir.path());
        let state = AppState::new(config, paths, true).await.unwrap();

        let request =
            GenerationRequest::prompt("u1", GenerationCategory::Chat, "gemini-flash", "hi");
        let outcome = state.service().generate(&request).await;

        let message = outcome.error_message().unwrap();
        assert!(message.contains("Original error from gemini"));
        assert!(!message.contains("SECRETKEY123"));
        assert_eq!(outcome.attempts().len(), 2);
        assert_eq!(outcome.attempts()[0].provider, Provider::Gemini);
        assert_eq!(outcome.attempts()[0].kind, ErrorKind::Network);
        for attempt in outcome.attempts() {
            assert!(!attempt.error.contains("SECRETKEY123"));
        }
        let json = serde_json::to_string(&outcome.view()).unwrap();
        assert!(!json.contains("SECRETKEY123"));
    }
}
