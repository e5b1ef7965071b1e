use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::generation::types::GenerationCategory;
use crate::storage::store::{
    current_period, BalanceStore, DebitOutcome, QuotaLimits, QuotaStatus, QuotaStore, Tier,
    TierInfo, TokenDebit,
};

/// SQLite-backed quota counters, balances and token ledger.
pub struct SqliteStore {
    pool: SqlitePool,
    limits: QuotaLimits,
}

/// One row of the token ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub model_id: String,
    pub provider: String,
    pub category: String,
    pub amount: u64,
    pub balance_after: u64,
    pub created_at: DateTime<Utc>,
}

fn to_db_amount(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::validation(format!("Token amount out of range: {}", value)))
}

fn from_db_amount(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, limits: QuotaLimits) -> Self {
        Self { pool, limits }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Create or replace an account's tier and token buckets.
    pub async fn upsert_account(
        &self,
        user_id: &str,
        tier: Tier,
        free_tokens: u64,
        paid_tokens: u64,
    ) -> Result<TierInfo> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO accounts (user_id, tier, free_tokens, paid_tokens, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                tier = excluded.tier,
                free_tokens = excluded.free_tokens,
                paid_tokens = excluded.paid_tokens,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(to_db_amount(free_tokens)?)
        .bind(to_db_amount(paid_tokens)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(
            "Account {} set to {} ({} free, {} paid tokens)",
            user_id, tier, free_tokens, paid_tokens
        );
        Ok(TierInfo::new(tier, free_tokens, paid_tokens))
    }

    /// Generations counted for `category` in the current month.
    pub async fn usage_count(&self, user_id: &str, category: GenerationCategory) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM usage_counters WHERE user_id = ? AND category = ? AND period = ?",
        )
        .bind(user_id)
        .bind(category.as_str())
        .bind(current_period())
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.and_then(|c| u32::try_from(c).ok()).unwrap_or(0))
    }

    pub async fn recent_debits(&self, user_id: &str, limit: u32) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, model_id, provider, category, amount, balance_after, created_at
            FROM token_ledger
            WHERE user_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<LedgerEntry> {
                let created_at: i64 = row.try_get("created_at")?;
                Ok(LedgerEntry {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    model_id: row.try_get("model_id")?,
                    provider: row.try_get("provider")?,
                    category: row.try_get("category")?,
                    amount: from_db_amount(row.try_get("amount")?),
                    balance_after: from_db_amount(row.try_get("balance_after")?),
                    created_at: Utc
                        .timestamp_opt(created_at, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn account_tier(&self, user_id: &str) -> Result<Option<Tier>> {
        let tier: Option<String> = sqlx::query_scalar("SELECT tier FROM accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        tier.map(|t| t.parse::<Tier>()).transpose()
    }
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn check_limit(
        &self,
        user_id: &str,
        category: GenerationCategory,
        tier_hint: Option<Tier>,
    ) -> Result<QuotaStatus> {
        let tier = match tier_hint {
            Some(tier) => tier,
            None => self.account_tier(user_id).await?.unwrap_or_default(),
        };
        let current = self.usage_count(user_id, category).await?;

        Ok(match tier {
            Tier::Premium => QuotaStatus::unmetered(category, current),
            Tier::Free => QuotaStatus::counted(category, current, self.limits.limit_for(category)),
        })
    }

    async fn increment_count(&self, user_id: &str, category: GenerationCategory) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_counters (user_id, category, period, count, updated_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(user_id, category, period) DO UPDATE SET
                count = count + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(category.as_str())
        .bind(current_period())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BalanceStore for SqliteStore {
    async fn get_tier(&self, user_id: &str) -> Result<Option<TierInfo>> {
        let row =
            sqlx::query("SELECT tier, free_tokens, paid_tokens FROM accounts WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => {
                let tier: String = row.try_get("tier")?;
                Ok(Some(TierInfo::new(
                    tier.parse()?,
                    from_db_amount(row.try_get("free_tokens")?),
                    from_db_amount(row.try_get("paid_tokens")?),
                )))
            }
            None => Ok(None),
        }
    }

    async fn debit(&self, debit: &TokenDebit) -> Result<DebitOutcome> {
        let amount = to_db_amount(debit.amount)?;
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // SET expressions see the row as it was before the update.
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE accounts SET
                free_tokens = CASE WHEN free_tokens >= ? THEN free_tokens - ? ELSE 0 END,
                paid_tokens = CASE WHEN free_tokens >= ? THEN paid_tokens
                                   ELSE paid_tokens - (? - free_tokens) END,
                updated_at = ?
            WHERE user_id = ? AND free_tokens + paid_tokens >= ?
            RETURNING free_tokens + paid_tokens
            "#,
        )
        .bind(amount)
        .bind(amount)
        .bind(amount)
        .bind(amount)
        .bind(now)
        .bind(&debit.user_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(remaining) = remaining else {
            let balance: Option<i64> = sqlx::query_scalar(
                "SELECT free_tokens + paid_tokens FROM accounts WHERE user_id = ?",
            )
            .bind(&debit.user_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;

            let balance = balance.map(from_db_amount).unwrap_or(0);
            debug!(
                "Debit of {} refused for {}: balance {}",
                debit.amount, debit.user_id, balance
            );
            return Ok(DebitOutcome::Insufficient { balance });
        };

        sqlx::query(
            r#"
            INSERT INTO token_ledger
                (id, user_id, model_id, provider, category, amount, balance_after, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&debit.user_id)
        .bind(&debit.model_id)
        .bind(debit.provider.as_str())
        .bind(debit.category.as_str())
        .bind(amount)
        .bind(remaining)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DebitOutcome::Debited {
            remaining: from_db_amount(remaining),
        })
    }
}
