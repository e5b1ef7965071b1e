use std::sync::Arc;
use tracing::{error, info, warn};

use crate::generation::types::GenerationCategory;
use crate::models::Provider;
use crate::storage::{BalanceStore, DebitOutcome, QuotaStore, TokenDebit};

/// Usage of one successful generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub user_id: String,
    pub model_id: String,
    pub provider: Provider,
    pub cost: u64,
    pub category: GenerationCategory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Recorded {
        /// Balance after the debit; `None` when nothing was debited.
        remaining: Option<u64>,
        counted: bool,
    },
    /// The conditional debit found less than `cost` left. Nothing was recorded.
    Insufficient { balance: u64 },
    /// The debit could not be applied. Nothing was recorded.
    Failed(String),
}

/// Records usage after a successful generation: debit first, then the
/// monthly counter. Counting is best-effort; the debit is authoritative.
pub struct MeteringUnit {
    quota: Arc<dyn QuotaStore>,
    balance: Arc<dyn BalanceStore>,
}

impl MeteringUnit {
    pub fn new(quota: Arc<dyn QuotaStore>, balance: Arc<dyn BalanceStore>) -> Self {
        Self { quota, balance }
    }

    pub async fn settle(&self, charge: &Charge) -> Settlement {
        let mut remaining = None;

        if charge.cost > 0 {
            let debit = TokenDebit {
                user_id: charge.user_id.clone(),
                model_id: charge.model_id.clone(),
                provider: charge.provider,
                amount: charge.cost,
                category: charge.category,
            };
            match self.balance.debit(&debit).await {
                Ok(DebitOutcome::Debited { remaining: left }) => {
                    info!(
                        "Debited {} tokens from {} for {}",
                        charge.cost, charge.user_id, charge.model_id
                    );
                    remaining = Some(left);
                }
                Ok(DebitOutcome::Insufficient { balance }) => {
                    warn!(
                        "Debit of {} refused for {} at settlement, balance {}",
                        charge.cost, charge.user_id, balance
                    );
                    return Settlement::Insufficient { balance };
                }
                Err(e) => {
                    error!("Token debit failed for {}: {}", charge.user_id, e);
                    return Settlement::Failed(e.to_string());
                }
            }
        }

        let counted = match self.quota.increment_count(&charge.user_id, charge.category).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    "Usage counter for {} ({}) was not recorded",
                    charge.user_id, charge.category
                );
                false
            }
            Err(e) => {
                warn!("Usage counter for {} ({}) failed: {}", charge.user_id, charge.category, e);
                false
            }
        };

        Settlement::Recorded { remaining, counted }
    }
}
