use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::generation::types::GenerationCategory;
use crate::storage::store::{
    current_period, BalanceStore, DebitOutcome, QuotaLimits, QuotaStatus, QuotaStore, Tier,
    TierInfo, TokenDebit,
};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, TierInfo>,
    counters: HashMap<(String, GenerationCategory, String), u32>,
    ledger: Vec<TokenDebit>,
}

/// Process-local store with the same semantics as the SQLite one.
///
/// Counts every store call and can be told to fail reads or writes, which the
/// service tests use to observe admission and settlement.
#[derive(Default)]
pub struct MemoryStore {
    limits: QuotaLimits,
    state: Mutex<MemoryState>,
    fail_reads: AtomicBool,
    fail_debits: AtomicBool,
    fail_increments: AtomicBool,
    debit_calls: AtomicUsize,
    increment_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }

    pub fn upsert_account(
        &self,
        user_id: &str,
        tier: Tier,
        free_tokens: u64,
        paid_tokens: u64,
    ) -> TierInfo {
        let info = TierInfo::new(tier, free_tokens, paid_tokens);
        self.state.lock().accounts.insert(user_id.to_string(), info.clone());
        info
    }

    /// Overwrite this month's counter for a category.
    pub fn set_usage(&self, user_id: &str, category: GenerationCategory, count: u32) {
        self.state
            .lock()
            .counters
            .insert((user_id.to_string(), category, current_period()), count);
    }

    pub fn usage(&self, user_id: &str, category: GenerationCategory) -> u32 {
        self.state
            .lock()
            .counters
            .get(&(user_id.to_string(), category, current_period()))
            .copied()
            .unwrap_or(0)
    }

    pub fn balance(&self, user_id: &str) -> u64 {
        self.state
            .lock()
            .accounts
            .get(user_id)
            .map(|info| info.token_balance)
            .unwrap_or(0)
    }

    /// Debits that were applied, oldest first.
    pub fn ledger(&self) -> Vec<TokenDebit> {
        self.state.lock().ledger.clone()
    }

    pub fn debit_calls(&self) -> usize {
        self.debit_calls.load(Ordering::SeqCst)
    }

    pub fn increment_calls(&self) -> usize {
        self.increment_calls.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_debits(&self, fail: bool) {
        self.fail_debits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_increments(&self, fail: bool) {
        self.fail_increments.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::store("memory store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn check_limit(
        &self,
        user_id: &str,
        category: GenerationCategory,
        tier_hint: Option<Tier>,
    ) -> Result<QuotaStatus> {
        self.check_reads()?;

        let tier = tier_hint.unwrap_or_else(|| {
            self.state
                .lock()
                .accounts
                .get(user_id)
                .map(|info| info.tier)
                .unwrap_or_default()
        });
        let current = self.usage(user_id, category);

        Ok(match tier {
            Tier::Premium => QuotaStatus::unmetered(category, current),
            Tier::Free => QuotaStatus::counted(category, current, self.limits.limit_for(category)),
        })
    }

    async fn increment_count(&self, user_id: &str, category: GenerationCategory) -> Result<bool> {
        self.increment_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_increments.load(Ordering::SeqCst) {
            return Err(Error::store("usage counter write failed"));
        }

        *self
            .state
            .lock()
            .counters
            .entry((user_id.to_string(), category, current_period()))
            .or_insert(0) += 1;
        Ok(true)
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn get_tier(&self, user_id: &str) -> Result<Option<TierInfo>> {
        self.check_reads()?;
        Ok(self.state.lock().accounts.get(user_id).cloned())
    }

    async fn debit(&self, debit: &TokenDebit) -> Result<DebitOutcome> {
        self.debit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_debits.load(Ordering::SeqCst) {
            return Err(Error::store("token debit failed"));
        }

        let mut state = self.state.lock();
        let Some(account) = state.accounts.get_mut(&debit.user_id) else {
            return Ok(DebitOutcome::Insufficient { balance: 0 });
        };
        if account.token_balance < debit.amount {
            return Ok(DebitOutcome::Insufficient {
                balance: account.token_balance,
            });
        }

        let from_free = account.free_tokens.min(debit.amount);
        account.free_tokens -= from_free;
        account.paid_tokens -= debit.amount - from_free;
        account.token_balance = account.free_tokens + account.paid_tokens;
        let remaining = account.token_balance;

        state.ledger.push(debit.clone());
        Ok(DebitOutcome::Debited { remaining })
    }
}
