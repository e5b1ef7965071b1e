// Storage layer for quota counters and token balances

pub mod database;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use database::Database;
pub use memory::MemoryStore;
pub use sqlite::{LedgerEntry, SqliteStore};
pub use store::{
    current_period, period_key, BalanceStore, DebitOutcome, QuotaLimits, QuotaStatus, QuotaStore,
    Tier, TierInfo, TokenDebit,
};
