//! Task store: the `alerts ⋈ user_responses ⋈ alert_status` view, with
//! mutators that move a task between the open/in-progress/verifying
//! buckets.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use sqlx::Row;
use tokio::sync::Mutex;

use crate::db::Database;
use crate::error::{DbError, TaskStoreError};
use crate::model::{NewTask, Performed, Task, TaskStatus};

const GET_ALERTS: &str = r#"
SELECT a.hash, a.title, a.ldap AS username, a.description, a.reason, a.url,
       a.event_time, s.status, r.performed, r.comment, r.authenticated
FROM alerts a
JOIN alert_status s ON a.hash = s.hash
JOIN user_responses r ON a.hash = r.hash
WHERE s.status = ?
"#;

#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Mutex<Database>>,
}

impl TaskStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    pub async fn new_tasks(&self) -> Result<Vec<Task>, TaskStoreError> {
        self.tasks_with_status(TaskStatus::Open).await
    }

    pub async fn active_tasks(&self) -> Result<Vec<Task>, TaskStoreError> {
        self.tasks_with_status(TaskStatus::InProgress).await
    }

    pub async fn pending_tasks(&self) -> Result<Vec<Task>, TaskStoreError> {
        self.tasks_with_status(TaskStatus::AwaitingVerification).await
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskStoreError> {
        let mut db = self.db.lock().await;
        let rows = db
            .with_retry(|pool| async move {
                sqlx::query(GET_ALERTS).bind(status as i64).fetch_all(&pool).await
            })
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn set_open(&self, task: &Task) -> Result<(), TaskStoreError> {
        self.set_status(&task.hash, TaskStatus::Open).await
    }

    pub async fn set_in_progress(&self, task: &Task) -> Result<(), TaskStoreError> {
        self.set_status(&task.hash, TaskStatus::InProgress).await
    }

    /// Also commits `performed`, `comment`, and `authenticated`.
    pub async fn set_verifying(&self, task: &Task) -> Result<(), TaskStoreError> {
        let mut db = self.db.lock().await;
        let hash = task.hash.clone();
        let comment = task.comment.clone();
        let performed = task.performed.as_bool();
        let authenticated = task.authenticated;
        db.with_retry(move |pool| {
            let hash = hash.clone();
            let comment = comment.clone();
            async move {
                sqlx::query(
                    "UPDATE user_responses SET comment = ?, performed = ?, authenticated = ? WHERE hash = ?",
                )
                .bind(&comment)
                .bind(performed)
                .bind(authenticated)
                .bind(&hash)
                .execute(&pool)
                .await
            }
        })
        .await?;
        drop(db);
        self.set_status(&task.hash, TaskStatus::AwaitingVerification).await
    }

    async fn set_status(&self, hash: &str, status: TaskStatus) -> Result<(), TaskStoreError> {
        let mut db = self.db.lock().await;
        let hash = hash.to_string();
        db.with_retry(move |pool| {
            let hash = hash.clone();
            async move {
                sqlx::query("UPDATE alert_status SET status = ? WHERE hash = ?")
                    .bind(status as i64)
                    .bind(&hash)
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    /// Inserts a new alert with a random 32-byte hash if one isn't supplied.
    /// Initializes the response row to `(comment="", performed=false,
    /// authenticated=false)` and the status row to OPEN.
    pub async fn create(&self, new_task: NewTask) -> Result<Task, TaskStoreError> {
        let hash = new_task.hash.unwrap_or_else(random_hash);
        let event_time = Utc::now();
        let mut db = self.db.lock().await;

        let insert_hash = hash.clone();
        let title = new_task.title.clone();
        let username = new_task.username.clone();
        let description = new_task.description.clone();
        let reason = new_task.reason.clone();
        let url = new_task.url.clone();

        let outcome = db
            .with_retry(move |pool| {
                let insert_hash = insert_hash.clone();
                let title = title.clone();
                let username = username.clone();
                let description = description.clone();
                let reason = reason.clone();
                let url = url.clone();
                async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query(
                        "INSERT INTO alerts (hash, ldap, title, description, reason, url, event_time) VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&insert_hash)
                    .bind(&username)
                    .bind(&title)
                    .bind(&description)
                    .bind(&reason)
                    .bind(&url)
                    .bind(event_time.timestamp())
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query("INSERT INTO alert_status (hash, status) VALUES (?, ?)")
                        .bind(&insert_hash)
                        .bind(TaskStatus::Open as i64)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "INSERT INTO user_responses (hash, comment, performed, authenticated) VALUES (?, '', 0, 0)",
                    )
                    .bind(&insert_hash)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await
                }
            })
            .await;

        match outcome {
            Ok(()) => {}
            Err(DbError::Transport(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                return Err(TaskStoreError::HashCollision);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Task {
            hash,
            title: new_task.title,
            username: new_task.username,
            description: new_task.description,
            reason: new_task.reason,
            url: new_task.url,
            event_time,
            status: TaskStatus::Open,
            performed: Performed::Unknown,
            comment: String::new(),
            authenticated: false,
        })
    }
}

fn random_hash() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, TaskStoreError> {
    let status_raw: i64 = row.try_get("status").map_err(DbError::from)?;
    let status = TaskStatus::from_i64(status_raw)
        .ok_or_else(|| TaskStoreError::Db(DbError::Migration(format!("unknown status {status_raw}"))))?;
    let performed_raw: bool = row.try_get("performed").map_err(DbError::from)?;
    let event_time: i64 = row.try_get("event_time").map_err(DbError::from)?;

    Ok(Task {
        hash: row.try_get("hash").map_err(DbError::from)?,
        title: row.try_get("title").map_err(DbError::from)?,
        username: row.try_get("username").map_err(DbError::from)?,
        description: row.try_get("description").map_err(DbError::from)?,
        reason: row.try_get("reason").map_err(DbError::from)?,
        url: row.try_get("url").map_err(DbError::from)?,
        event_time: datetime_from_secs(event_time),
        status,
        performed: if performed_raw { Performed::Yes } else { Performed::Unknown },
        comment: row.try_get("comment").map_err(DbError::from)?,
        authenticated: row.try_get("authenticated").map_err(DbError::from)?,
    })
}

fn datetime_from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TaskStore {
        let db = Database::open_in_memory().await.unwrap();
        TaskStore::new(Arc::new(Mutex::new(db)))
    }

    fn sample() -> NewTask {
        NewTask {
            title: "ssh_root".into(),
            username: "alice".into(),
            description: "ssh as root".into(),
            reason: "unexpected root login".into(),
            url: None,
            hash: None,
        }
    }

    #[tokio::test]
    async fn create_then_appears_in_new_tasks() {
        let store = store().await;
        let created = store.create(sample()).await.unwrap();
        assert_eq!(created.status, TaskStatus::Open);

        let new = store.new_tasks().await.unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].hash, created.hash);
    }

    #[tokio::test]
    async fn lifecycle_moves_between_buckets() {
        let store = store().await;
        let mut task = store.create(sample()).await.unwrap();

        store.set_in_progress(&task).await.unwrap();
        assert_eq!(store.new_tasks().await.unwrap().len(), 0);
        assert_eq!(store.active_tasks().await.unwrap().len(), 1);

        task.performed = Performed::Yes;
        task.authenticated = true;
        task.comment = "I did this".into();
        store.set_verifying(&task).await.unwrap();

        assert_eq!(store.active_tasks().await.unwrap().len(), 0);
        let pending = store.pending_tasks().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].authenticated);
        assert_eq!(pending[0].comment, "I did this");
    }

    #[tokio::test]
    async fn duplicate_hash_is_rejected() {
        let store = store().await;
        let mut first = sample();
        first.hash = Some("deadbeef".into());
        store.create(first).await.unwrap();

        let mut second = sample();
        second.hash = Some("deadbeef".into());
        let err = store.create(second).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::HashCollision));
    }
}
