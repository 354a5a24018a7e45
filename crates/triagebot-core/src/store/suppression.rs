//! Suppression store and blacklist: lazy prune-then-select on read, and
//! an upsert-on-duplicate-key write for refreshed suppressions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::db::Database;
use crate::error::SuppressionStoreError;

#[derive(Clone)]
pub struct SuppressionStore {
    db: Arc<Mutex<Database>>,
}

impl SuppressionStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Prunes `until <= now` rows for `username`, then returns the surviving
    /// `title -> reason` map.
    pub async fn get(&self, username: &str) -> Result<HashMap<String, String>, SuppressionStoreError> {
        self.prune(username).await?;
        let mut db = self.db.lock().await;
        let username = username.to_string();
        let rows = db
            .with_retry(move |pool| {
                let username = username.clone();
                async move {
                    sqlx::query("SELECT title, reason FROM ignored WHERE ldap = ?")
                        .bind(&username)
                        .fetch_all(&pool)
                        .await
                }
            })
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, String), SuppressionStoreError> {
                Ok((
                    row.try_get("title").map_err(crate::error::DbError::from)?,
                    row.try_get("reason").map_err(crate::error::DbError::from)?,
                ))
            })
            .collect()
    }

    pub async fn is_ignored(&self, username: &str, title: &str) -> Result<bool, SuppressionStoreError> {
        Ok(self.get(username).await?.contains_key(title))
    }

    pub async fn ignore(
        &self,
        username: &str,
        title: &str,
        reason: &str,
        ttl: Duration,
    ) -> Result<(), SuppressionStoreError> {
        let until = (Utc::now() + ttl).timestamp();
        let mut db = self.db.lock().await;
        let username = username.to_string();
        let title = title.to_string();
        let reason = reason.to_string();
        db.with_retry(move |pool| {
            let username = username.clone();
            let title = title.clone();
            let reason = reason.clone();
            async move {
                sqlx::query(
                    "INSERT INTO ignored (ldap, title, reason, until) VALUES (?, ?, ?, ?) \
                     ON CONFLICT(ldap, title) DO UPDATE SET reason = excluded.reason, until = excluded.until",
                )
                .bind(&username)
                .bind(&title)
                .bind(&reason)
                .bind(until)
                .execute(&pool)
                .await
            }
        })
        .await?;
        Ok(())
    }

    async fn prune(&self, username: &str) -> Result<(), SuppressionStoreError> {
        let now = Utc::now().timestamp();
        let mut db = self.db.lock().await;
        let username = username.to_string();
        db.with_retry(move |pool| {
            let username = username.clone();
            async move {
                sqlx::query("DELETE FROM ignored WHERE ldap = ? AND until <= ?")
                    .bind(&username)
                    .bind(now)
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Blacklist {
    db: Arc<Mutex<Database>>,
}

impl Blacklist {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    pub async fn contains(&self, username: &str) -> Result<bool, SuppressionStoreError> {
        let mut db = self.db.lock().await;
        let username = username.to_string();
        let row = db
            .with_retry(move |pool| {
                let username = username.clone();
                async move {
                    sqlx::query("SELECT 1 FROM blacklist WHERE ldap = ?")
                        .bind(&username)
                        .fetch_optional(&pool)
                        .await
                }
            })
            .await?;
        Ok(row.is_some())
    }

    pub async fn add(&self, username: &str) -> Result<(), SuppressionStoreError> {
        let mut db = self.db.lock().await;
        let username = username.to_string();
        db.with_retry(move |pool| {
            let username = username.clone();
            async move {
                sqlx::query("INSERT OR IGNORE INTO blacklist (ldap) VALUES (?)")
                    .bind(&username)
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    pub async fn remove(&self, username: &str) -> Result<(), SuppressionStoreError> {
        let mut db = self.db.lock().await;
        let username = username.to_string();
        db.with_retry(move |pool| {
            let username = username.clone();
            async move {
                sqlx::query("DELETE FROM blacklist WHERE ldap = ?")
                    .bind(&username)
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }
}
