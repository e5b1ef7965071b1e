use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::billing::pricing::PricingTable;
use crate::error::Result;
use crate::generation::types::GenerationCategory;
use crate::routing::ErrorKind;
use crate::storage::{BalanceStore, QuotaStatus, QuotaStore, TierInfo};

const LIMITS_UNVERIFIED: &str =
    "Your usage limits could not be verified right now. Please try again in a moment.";

/// Outcome of comparing a model's cost against the current token balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceCheck {
    Sufficient { balance: u64, cost: u64 },
    Insufficient { balance: u64, cost: u64 },
}

/// What settlement should charge once the generation succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub quota: QuotaStatus,
    /// Tokens to debit; zero for quota-counted accounts.
    pub charge: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted(Admission),
    Denied { kind: ErrorKind, message: String },
}

/// Gates every generation behind the monthly quota and, for metered accounts,
/// the token balance. Always calls through to the stores.
pub struct AdmissionController {
    quota: Arc<dyn QuotaStore>,
    balance: Arc<dyn BalanceStore>,
    pricing: PricingTable,
}

impl AdmissionController {
    pub fn new(
        quota: Arc<dyn QuotaStore>,
        balance: Arc<dyn BalanceStore>,
        pricing: PricingTable,
    ) -> Self {
        Self {
            quota,
            balance,
            pricing,
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Monthly category quota for the user.
    pub async fn admit(
        &self,
        user_id: &str,
        category: GenerationCategory,
        model_id: &str,
    ) -> Result<QuotaStatus> {
        debug!("Checking {} quota for {} (model {})", category, user_id, model_id);
        self.quota.check_limit(user_id, category, None).await
    }

    /// A missing or unreadable account counts as free with no tokens.
    pub async fn verify_balance(&self, user_id: &str, model_id: &str) -> BalanceCheck {
        let info = match self.balance.get_tier(user_id).await {
            Ok(Some(info)) => info,
            Ok(None) => TierInfo::default(),
            Err(e) => {
                warn!("Tier lookup failed for {}, treating as empty free account: {}", user_id, e);
                TierInfo::default()
            }
        };

        let cost = self.pricing.cost_for(model_id);
        if info.token_balance >= cost {
            BalanceCheck::Sufficient {
                balance: info.token_balance,
                cost,
            }
        } else {
            BalanceCheck::Insufficient {
                balance: info.token_balance,
                cost,
            }
        }
    }

    /// Quota first, then balance for unmetered tiers.
    pub async fn check(
        &self,
        user_id: &str,
        category: GenerationCategory,
        model_id: &str,
    ) -> AdmissionDecision {
        let quota = match self.admit(user_id, category, model_id).await {
            Ok(status) => status,
            Err(e) => {
                error!("Quota check failed for {}: {}", user_id, e);
                return AdmissionDecision::Denied {
                    kind: ErrorKind::Unknown,
                    message: LIMITS_UNVERIFIED.to_string(),
                };
            }
        };

        if !quota.can_generate {
            debug!("Quota denied {} for {}: {}", category, user_id, quota.message);
            return AdmissionDecision::Denied {
                kind: ErrorKind::LimitReached,
                message: quota.message,
            };
        }

        if !quota.is_unmetered_tier {
            return AdmissionDecision::Admitted(Admission { quota, charge: 0 });
        }

        match self.verify_balance(user_id, model_id).await {
            BalanceCheck::Sufficient { cost, .. } => {
                AdmissionDecision::Admitted(Admission { quota, charge: cost })
            }
            BalanceCheck::Insufficient { balance, cost } => {
                debug!("Balance denied {} for {}: {} < {}", model_id, user_id, balance, cost);
                AdmissionDecision::Denied {
                    kind: ErrorKind::InsufficientTokens,
                    message: insufficient_message(model_id, balance, cost),
                }
            }
        }
    }
}

pub fn insufficient_message(model_id: &str, balance: u64, cost: u64) -> String {
    format!(
        "Not enough tokens: {} costs {} tokens per message and your balance is {}. \
         Purchase more tokens to continue.",
        model_id, cost, balance
    )
}
