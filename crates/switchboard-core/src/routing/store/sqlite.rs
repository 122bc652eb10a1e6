//! SQLite bandit store
//!
//! One row per arm in `bandit_state`, keyed by `(backendId, context)`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::BanditStore;
use crate::error::{Error, Result};
use crate::routing::types::{ArmKey, BanditArmState};

/// SQL to create the bandit state table
pub const CREATE_BANDIT_STATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bandit_state (
    backendId TEXT NOT NULL,
    context TEXT NOT NULL,
    trials INTEGER NOT NULL DEFAULT 0,
    rewardSum REAL NOT NULL DEFAULT 0.0,
    alpha REAL NOT NULL DEFAULT 1.0,
    beta REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (backendId, context)
);
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO bandit_state (backendId, context, trials, rewardSum, alpha, beta)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT(backendId, context) DO UPDATE SET
    trials = excluded.trials,
    rewardSum = excluded.rewardSum,
    alpha = excluded.alpha,
    beta = excluded.beta
"#;

/// Aggregate view of the persisted arms
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSummary {
    pub arms: u64,
    pub backends: u64,
    pub contexts: u64,
    pub total_trials: u64,
}

/// Store for persisting bandit arms in SQLite
#[derive(Debug, Clone)]
pub struct SqliteBanditStore {
    pool: SqlitePool,
}

impl SqliteBanditStore {
    /// Create a store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to (and create if needed) the database file
    pub async fn connect(database_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", database_path.display());
        let pool = SqlitePool::connect(&url).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database
    ///
    /// Limited to one connection, since every SQLite in-memory connection
    /// is a separate database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Create the schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_BANDIT_STATE_TABLE_SQL)
            .execute(&self.pool)
            .await?;

        info!("Bandit state table initialized");
        Ok(())
    }

    /// Upsert many arms atomically
    pub async fn save_batch(&self, states: &[(String, BanditArmState)]) -> Result<()> {
        if states.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (key, state) in states {
            let key = ArmKey::parse(key);
            sqlx::query(UPSERT_SQL)
                .bind(key.backend_id.as_str())
                .bind(key.context.as_str())
                .bind(trials_column(state))
                .bind(state.reward_sum)
                .bind(state.alpha)
                .bind(state.beta)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(count = states.len(), "Saved bandit arm batch");
        Ok(())
    }

    /// Delete every arm in a context
    pub async fn delete_context(&self, context: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM bandit_state WHERE context = ?")
            .bind(context)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        info!(context = %context, deleted, "Deleted bandit context");
        Ok(deleted)
    }

    /// Delete every arm
    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM bandit_state")
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        warn!(deleted, "Cleared all bandit state");
        Ok(deleted)
    }

    /// Counts across all arms
    pub async fn summary(&self) -> Result<StoreSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS arms,
                COUNT(DISTINCT backendId) AS backends,
                COUNT(DISTINCT context) AS contexts,
                SUM(trials) AS total_trials
            FROM bandit_state
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreSummary {
            arms: row.try_get::<i64, _>("arms")? as u64,
            backends: row.try_get::<i64, _>("backends")? as u64,
            contexts: row.try_get::<i64, _>("contexts")? as u64,
            total_trials: row.try_get::<Option<i64>, _>("total_trials")?.unwrap_or(0) as u64,
        })
    }
}

fn trials_column(state: &BanditArmState) -> i64 {
    i64::try_from(state.trials).unwrap_or(i64::MAX)
}

fn row_to_state(row: &SqliteRow) -> Result<BanditArmState> {
    Ok(BanditArmState {
        trials: row.try_get::<i64, _>("trials")?.max(0) as u64,
        reward_sum: row.try_get("rewardSum")?,
        alpha: row.try_get("alpha")?,
        beta: row.try_get("beta")?,
    })
}

#[async_trait]
impl BanditStore for SqliteBanditStore {
    async fn load(&self, backend_id: &str, context: &str) -> Result<Option<BanditArmState>> {
        let row = sqlx::query(
            "SELECT trials, rewardSum, alpha, beta FROM bandit_state WHERE backendId = ? AND context = ?",
        )
        .bind(backend_id)
        .bind(context)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_state).transpose()
    }

    async fn save(&self, backend_id: &str, context: &str, state: &BanditArmState) -> Result<()> {
        sqlx::query(UPSERT_SQL)
            .bind(backend_id)
            .bind(context)
            .bind(trials_column(state))
            .bind(state.reward_sum)
            .bind(state.alpha)
            .bind(state.beta)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        debug!(
            backend_id = %backend_id,
            context = %context,
            trials = state.trials,
            "Saved bandit arm"
        );
        Ok(())
    }

    async fn load_all(&self) -> Result<HashMap<String, BanditArmState>> {
        let rows = sqlx::query("SELECT backendId, context, trials, rewardSum, alpha, beta FROM bandit_state")
            .fetch_all(&self.pool)
            .await?;

        let mut result = HashMap::with_capacity(rows.len());
        for row in &rows {
            let backend_id: String = row.try_get("backendId")?;
            let context: String = row.try_get("context")?;
            result.insert(ArmKey::new(context, backend_id).storage_key(), row_to_state(row)?);
        }

        info!(arms = result.len(), "Loaded bandit arms");
        Ok(result)
    }

    async fn save_all(&self, states: &[(String, BanditArmState)]) -> Result<()> {
        self.save_batch(states).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn create_test_store() -> (SqliteBanditStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("bandit.db");
        let store = SqliteBanditStore::connect(&db_path).await.unwrap();
        store.init().await.unwrap();
        (store, dir)
    }

    fn state(trials: u64, alpha: f64) -> BanditArmState {
        BanditArmState {
            trials,
            reward_sum: trials as f64 * 0.5,
            alpha,
            beta: 1.5,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _dir) = create_test_store().await;

        store.save("openai", "default", &state(4, 3.0)).await.unwrap();
        let loaded = store.load("openai", "default").await.unwrap();
        assert_eq!(loaded, Some(state(4, 3.0)));

        assert!(store.load("openai", "chat").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let (store, _dir) = create_test_store().await;

        store.save("openai", "default", &state(1, 1.5)).await.unwrap();
        store.save("openai", "default", &state(2, 2.5)).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["default:openai"], state(2, 2.5));
    }

    #[tokio::test]
    async fn test_save_batch_and_summary() {
        let (store, _dir) = create_test_store().await;

        store
            .save_all(&[
                ("default:a".to_string(), state(3, 2.0)),
                ("default:b".to_string(), state(5, 4.0)),
                ("chat:a".to_string(), state(1, 1.2)),
            ])
            .await
            .unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(
            summary,
            StoreSummary {
                arms: 3,
                backends: 2,
                contexts: 2,
                total_trials: 9,
            }
        );

        assert_eq!(store.delete_context("chat").await.unwrap(), 1);
        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert_eq!(store.summary().await.unwrap().total_trials, 0);
    }

    #[tokio::test]
    async fn test_persists_across_connections() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("bandit.db");

        {
            let store = SqliteBanditStore::connect(&db_path).await.unwrap();
            store.init().await.unwrap();
            store.save("local", "default", &state(7, 5.0)).await.unwrap();
        }

        let reopened = SqliteBanditStore::connect(&db_path).await.unwrap();
        reopened.init().await.unwrap();
        assert_eq!(
            reopened.load("local", "default").await.unwrap(),
            Some(state(7, 5.0))
        );
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let store = SqliteBanditStore::connect_in_memory().await.unwrap();
        store.init().await.unwrap();
        store.save("a", "default", &state(1, 1.4)).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }
}
