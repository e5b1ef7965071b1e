use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::generation::types::GenerationCategory;
use crate::models::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            other => Err(Error::validation(format!("Unknown tier: {}", other))),
        }
    }
}

/// Account tier and token balance as held by the billing store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierInfo {
    pub tier: Tier,
    pub token_balance: u64,
    pub free_tokens: u64,
    pub paid_tokens: u64,
}

impl TierInfo {
    pub fn new(tier: Tier, free_tokens: u64, paid_tokens: u64) -> Self {
        Self {
            tier,
            token_balance: free_tokens.saturating_add(paid_tokens),
            free_tokens,
            paid_tokens,
        }
    }
}

/// Result of a monthly category quota check. Always derived fresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub can_generate: bool,
    pub current_count: u32,
    /// `None` for unmetered tiers.
    pub monthly_limit: Option<u32>,
    /// No monthly cap; generations are billed from the token balance instead.
    pub is_unmetered_tier: bool,
    pub message: String,
}

impl QuotaStatus {
    pub fn counted(category: GenerationCategory, current_count: u32, monthly_limit: u32) -> Self {
        let can_generate = current_count < monthly_limit;
        let message = if can_generate {
            let remaining = monthly_limit - current_count;
            format!(
                "{} of {} {} generations left this month.",
                remaining, monthly_limit, category
            )
        } else {
            format!(
                "Monthly {} limit reached ({}/{}). Upgrade to premium or wait until next month.",
                category, current_count, monthly_limit
            )
        };

        Self {
            can_generate,
            current_count,
            monthly_limit: Some(monthly_limit),
            is_unmetered_tier: false,
            message,
        }
    }

    pub fn unmetered(category: GenerationCategory, current_count: u32) -> Self {
        Self {
            can_generate: true,
            current_count,
            monthly_limit: None,
            is_unmetered_tier: true,
            message: format!(
                "Unlimited {} generations; each one is billed from your token balance.",
                category
            ),
        }
    }
}

/// Monthly generation caps for quota-counted (free) accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub free_monthly: HashMap<GenerationCategory, u32>,
}

impl QuotaLimits {
    /// Categories without a configured cap get zero generations.
    pub fn limit_for(&self, category: GenerationCategory) -> u32 {
        self.free_monthly.get(&category).copied().unwrap_or(0)
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        let free_monthly = HashMap::from([
            (GenerationCategory::Image, 5),
            (GenerationCategory::Video, 2),
            (GenerationCategory::Song, 3),
            (GenerationCategory::Tts, 10),
            (GenerationCategory::Chat, 50),
        ]);
        Self { free_monthly }
    }
}

/// One metered charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDebit {
    pub user_id: String,
    pub model_id: String,
    pub provider: Provider,
    pub amount: u64,
    pub category: GenerationCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited { remaining: u64 },
    /// Nothing was deducted.
    Insufficient { balance: u64 },
}

/// `YYYY-MM` key of the month counters belong to.
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

pub fn current_period() -> String {
    period_key(Utc::now())
}

/// Monthly per-category generation counters.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn check_limit(
        &self,
        user_id: &str,
        category: GenerationCategory,
        tier_hint: Option<Tier>,
    ) -> Result<QuotaStatus>;

    /// Returns `false` when the counter could not be recorded.
    async fn increment_count(&self, user_id: &str, category: GenerationCategory) -> Result<bool>;
}

/// Account tiers and token balances.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// `None` when the store has no record of the user.
    async fn get_tier(&self, user_id: &str) -> Result<Option<TierInfo>>;

    /// Deduct `amount` only if the balance covers it, as one atomic operation.
    async fn debit(&self, debit: &TokenDebit) -> Result<DebitOutcome>;
}
