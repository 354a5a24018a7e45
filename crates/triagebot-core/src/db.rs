//! Process-wide datastore handle: an `init -> reconnect-on-error -> execute`
//! recovery path since every store (tasks, suppression, blacklist) shares
//! one connection pool.
//!
//! The schema is five tables: `alerts`, `alert_status`,
//! `user_responses`, `ignored`, `blacklist`.

use std::path::Path;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::DbError;

const MIGRATE: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    hash        TEXT    PRIMARY KEY,
    ldap        TEXT    NOT NULL,
    title       TEXT    NOT NULL,
    description TEXT    NOT NULL,
    reason      TEXT    NOT NULL,
    url         TEXT,
    event_time  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_status (
    hash   TEXT    PRIMARY KEY REFERENCES alerts(hash),
    status INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_responses (
    hash          TEXT    PRIMARY KEY REFERENCES alerts(hash),
    comment       TEXT    NOT NULL,
    performed     INTEGER NOT NULL,
    authenticated INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ignored (
    ldap   TEXT    NOT NULL,
    title  TEXT    NOT NULL,
    reason TEXT    NOT NULL,
    until  INTEGER NOT NULL,
    PRIMARY KEY (ldap, title)
);

CREATE TABLE IF NOT EXISTS blacklist (
    ldap TEXT PRIMARY KEY
);
"#;

/// A `SqlitePool`-backed handle that the stores share. Connection lifecycle
/// (`init`, retry) lives here rather than at call sites.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    url: String,
}

impl Database {
    pub async fn open(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DbError::Migration(e.to_string()))?;
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = Self::connect(&url).await?;
        sqlx::query(MIGRATE)
            .execute(&pool)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(Self { pool, url })
    }

    /// In-memory database, used by tests and the `test` command's scratch
    /// alerts; never persisted to disk.
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let url = "sqlite::memory:".to_string();
        let pool = Self::connect(&url).await?;
        sqlx::query(MIGRATE)
            .execute(&pool)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(Self { pool, url })
    }

    async fn connect(url: &str) -> Result<SqlitePool, DbError> {
        let options: SqliteConnectOptions = url.parse().map_err(sqlx::Error::from)?;
        Ok(SqlitePool::connect_with(options).await?)
    }

    async fn reconnect(&mut self) -> Result<(), DbError> {
        warn!(url = %self.url, "datastore transport error, reconnecting");
        self.pool = Self::connect(&self.url).await?;
        Ok(())
    }

    /// Runs `f` against the pool; on a transport error, rebuilds the
    /// connection once and retries. A second failure is surfaced as-is
    /// (never retried recursively).
    pub async fn with_retry<T, F, Fut>(&mut self, mut f: F) -> Result<T, DbError>
    where
        F: FnMut(SqlitePool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match f(self.pool.clone()).await {
            Ok(value) => Ok(value),
            Err(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => {
                self.reconnect().await?;
                Ok(f(self.pool.clone()).await?)
            }
            Err(other) => Err(other.into()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_fresh_database() {
        let db = Database::open_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn opens_file_backed_store_under_temp_dir() {
        let path = std::env::temp_dir().join(format!("triagebot_test_{}.db", uuid::Uuid::new_v4()));
        let db = Database::open(&path).await.unwrap();
        assert!(path.exists());
        drop(db);
        let _ = std::fs::remove_file(&path);
    }
}
