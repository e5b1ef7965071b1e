use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::billing::{default_prices, ModelPrice, PricingTable, DEFAULT_MESSAGE_COST};
use crate::error::{Error, Result};
use crate::generation::types::GenerationCategory;
use crate::models::Provider;
use crate::platform::AppPaths;
use crate::routing::{
    default_chain, default_routes, DispatchPolicy, FallbackCandidate, FallbackChain, ModelResolver,
    ModelRoute, RouteTarget,
};
use crate::storage::QuotaLimits;

pub const ENV_PREFIX: &str = "GENROUTER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Keyed by provider name (`openai`, `groq`, ...).
    pub providers: HashMap<String, ProviderConfig>,
    pub routing: RoutingConfig,
    pub fallback: FallbackConfig,
    pub dispatch: DispatchConfig,
    pub pricing: PricingConfig,
    pub quota: QuotaConfig,
    /// Overrides the SQLite file in the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_route: RouteTarget,
    pub routes: Vec<ModelRoute>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_route: RouteTarget::default(),
            routes: default_routes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub chain: Vec<FallbackCandidate>,
    /// Categories listed here use their own chain instead of `chain`.
    pub per_category: HashMap<String, Vec<FallbackCandidate>>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            per_category: HashMap::new(),
        }
    }
}

/// Millisecond bounds on dispatch; 0 disables a bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub attempt_timeout_ms: u64,
    pub overall_deadline_ms: u64,
    pub retry_same_provider: bool,
    pub error_excerpt_chars: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 45_000,
            overall_deadline_ms: 120_000,
            retry_same_provider: false,
            error_excerpt_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub default_cost: u64,
    pub models: Vec<ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_cost: DEFAULT_MESSAGE_COST,
            models: default_prices(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub free_monthly_limits: HashMap<String, u32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_monthly_limits: QuotaLimits::default()
                .free_monthly
                .into_iter()
                .map(|(category, limit)| (category.to_string(), limit))
                .collect(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let providers = Provider::ALL
            .iter()
            .map(|p| (p.to_string(), ProviderConfig::default()))
            .collect();

        Self {
            providers,
            routing: RoutingConfig::default(),
            fallback: FallbackConfig::default(),
            dispatch: DispatchConfig::default(),
            pricing: PricingConfig::default(),
            quota: QuotaConfig::default(),
            database_url: None,
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file (if any), then `GENROUTER_*` variables.
    pub fn load(paths: &AppPaths, explicit: Option<&Path>) -> Result<Self> {
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__");
        Self::load_from(paths, explicit, environment)
    }

    fn load_from(
        paths: &AppPaths,
        explicit: Option<&Path>,
        environment: Environment,
    ) -> Result<Self> {
        let config_file: PathBuf = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.config_file());

        let mut builder = Config::builder();
        if config_file.exists() {
            info!("Loading configuration from: {:?}", config_file);
            builder =
                builder.add_source(File::from(config_file.as_path()).format(FileFormat::Toml));
        } else if explicit.is_some() {
            return Err(Error::validation(format!(
                "Config file not found: {}",
                config_file.display()
            )));
        }

        let config: AppConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, self.to_toml()?).await?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))
    }

    /// Copy with every API key replaced by a marker, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for provider in copy.providers.values_mut() {
            if provider.api_key.is_some() {
                provider.api_key = Some("<redacted>".to_string());
            }
        }
        copy
    }

    pub fn validate(&self) -> Result<()> {
        for (provider, config) in self.provider_configs()? {
            if let Some(key) = &config.api_key {
                if key.trim().is_empty() {
                    return Err(Error::validation(format!(
                        "Provider {} has an empty api_key",
                        provider
                    )));
                }
            }
            if let Some(base_url) = &config.base_url {
                url::Url::parse(base_url).map_err(|e| {
                    Error::validation(format!(
                        "Provider {} has an invalid base_url '{}': {}",
                        provider, base_url, e
                    ))
                })?;
            }
            if config.timeout_seconds == 0 {
                return Err(Error::validation(format!(
                    "Provider {} timeout_seconds must be positive",
                    provider
                )));
            }
        }

        let mut route_ids = HashSet::new();
        for route in &self.routing.routes {
            if !route_ids.insert(route.id.as_str()) {
                return Err(Error::validation(format!("Duplicate model route: {}", route.id)));
            }
        }

        if self.fallback.chain.is_empty() {
            return Err(Error::validation("Fallback chain must not be empty"));
        }
        for (category, chain) in &self.fallback.per_category {
            if chain.is_empty() {
                return Err(Error::validation(format!(
                    "Fallback chain for {} must not be empty",
                    category
                )));
            }
        }
        self.to_fallback_chain()?;
        self.to_quota_limits()?;

        let mut priced = HashSet::new();
        for price in &self.pricing.models {
            if !priced.insert(price.model_id.as_str()) {
                return Err(Error::validation(format!(
                    "Duplicate price for model '{}'",
                    price.model_id
                )));
            }
        }

        let default_provider = self.routing.default_route.provider;
        if !self.has_api_key(default_provider) {
            return Err(Error::validation(format!(
                "Default route provider {} has no API key; unknown models would have nowhere to go",
                default_provider
            )));
        }

        Ok(())
    }

    /// Provider sections keyed by parsed provider.
    pub fn provider_configs(&self) -> Result<HashMap<Provider, ProviderConfig>> {
        self.providers
            .iter()
            .map(|(name, config)| -> Result<(Provider, ProviderConfig)> {
                Ok((name.parse::<Provider>()?, config.clone()))
            })
            .collect()
    }

    pub fn has_api_key(&self, provider: Provider) -> bool {
        self.providers
            .get(provider.as_str())
            .and_then(|c| c.api_key.as_deref())
            .map_or(false, |k| !k.trim().is_empty())
    }

    pub fn to_resolver(&self) -> Result<ModelResolver> {
        ModelResolver::new(self.routing.routes.clone(), self.routing.default_route.clone())
    }

    pub fn to_fallback_chain(&self) -> Result<FallbackChain> {
        let mut chain = FallbackChain::new(self.fallback.chain.clone());
        for (category, candidates) in &self.fallback.per_category {
            let category = category.parse::<GenerationCategory>()?;
            chain = chain.with_override(category, candidates.clone());
        }
        Ok(chain)
    }

    pub fn to_dispatch_policy(&self) -> DispatchPolicy {
        let bound = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        DispatchPolicy {
            attempt_timeout: bound(self.dispatch.attempt_timeout_ms),
            overall_deadline: bound(self.dispatch.overall_deadline_ms),
            retry_same_provider: self.dispatch.retry_same_provider,
            error_excerpt_chars: self.dispatch.error_excerpt_chars,
        }
    }

    pub fn to_pricing_table(&self) -> Result<PricingTable> {
        PricingTable::new(self.pricing.default_cost, &self.pricing.models)
    }

    pub fn to_quota_limits(&self) -> Result<QuotaLimits> {
        let free_monthly = self
            .quota
            .free_monthly_limits
            .iter()
            .map(|(category, limit)| -> Result<(GenerationCategory, u32)> {
                Ok((category.parse::<GenerationCategory>()?, *limit))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(QuotaLimits { free_monthly })
    }
}
