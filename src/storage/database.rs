use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::platform::AppPaths;

/// Schema steps, applied in order and recorded in `app_settings`.
const MIGRATIONS: &[(i32, &str, &[&str])] = &[
    (
        1,
        "initial",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                tier TEXT NOT NULL DEFAULT 'free' CHECK (tier IN ('free', 'premium')),
                free_tokens INTEGER NOT NULL DEFAULT 0 CHECK (free_tokens >= 0),
                paid_tokens INTEGER NOT NULL DEFAULT 0 CHECK (paid_tokens >= 0),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS usage_counters (
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                period TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, category, period)
            )
            "#,
        ],
    ),
    (
        2,
        "token_ledger",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS token_ledger (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                category TEXT NOT NULL,
                amount INTEGER NOT NULL,
                balance_after INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_token_ledger_user
                ON token_ledger (user_id, created_at)
            "#,
        ],
    ),
];

/// Database connection manager with migration support
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database in the platform data directory.
    pub async fn new(paths: &AppPaths) -> Result<Self> {
        std::fs::create_dir_all(paths.data_dir())?;
        let db_path = paths.database_file();
        info!("Initializing database at: {:?}", db_path);
        Self::connect(&format!("sqlite://{}", db_path.display())).await
    }

    /// Connect to an explicit SQLite URL and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Concurrent debits queue on the write lock instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to `:memory:` is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_database_version().await?;
        debug!("Current database version: {}", current_version);

        for (version, name, statements) in MIGRATIONS {
            if *version <= current_version {
                debug!("Skipping migration {:03}_{} (already applied)", version, name);
                continue;
            }

            info!("Applying migration: {:03}_{}", version, name);
            let mut tx = self.pool.begin().await?;
            for statement in statements.iter() {
                sqlx::query(statement).execute(&mut *tx).await.map_err(|e| {
                    error!("Failed to apply migration {:03}_{}: {}", version, name, e);
                    Error::Database(e)
                })?;
            }
            sqlx::query(
                "INSERT OR REPLACE INTO app_settings (key, value, updated_at) \
                 VALUES ('database_version', ?, unixepoch())",
            )
            .bind(version.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }

        Ok(())
    }

    pub async fn get_database_version(&self) -> Result<i32> {
        let table_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='app_settings'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if !table_exists {
            return Ok(0);
        }

        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = 'database_version'")
                .fetch_optional(&self.pool)
                .await?;

        match version {
            Some(version_str) => version_str.parse().map_err(|e| {
                Error::Database(sqlx::Error::Decode(
                    format!("Invalid database version: {}", e).into(),
                ))
            }),
            None => Ok(0),
        }
    }

    pub async fn verify_integrity(&self) -> Result<bool> {
        let integrity_result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;

        let is_ok = integrity_result == "ok";
        if !is_ok {
            error!("Database integrity check failed: {}", integrity_result);
        }
        Ok(is_ok)
    }

    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}
