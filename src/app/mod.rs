pub mod config;
pub mod state;

pub use config::{
    AppConfig, DispatchConfig, FallbackConfig, PricingConfig, ProviderConfig, QuotaConfig,
    RoutingConfig,
};
pub use state::{AppState, StoreHandle};
