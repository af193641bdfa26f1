//! Container registry repository.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{ContainerRecord, RegistryStatus};

const RECORD_COLUMNS: &str =
    "user_id, container_id, container_name, status, created_at, last_active";

/// Persistent ownership store, injected into the fleet managers.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Record `container_id` as the user's container, replacing any previous
    /// row for the user.
    async fn create(
        &self,
        user_id: &str,
        container_id: &str,
        container_name: &str,
    ) -> Result<ContainerRecord>;

    async fn get_by_user_id(&self, user_id: &str) -> Result<Option<ContainerRecord>>;

    async fn get_by_id(&self, container_id: &str) -> Result<Option<ContainerRecord>>;

    async fn update_last_active(&self, container_id: &str) -> Result<()>;

    async fn update_status(&self, container_id: &str, status: RegistryStatus) -> Result<()>;

    async fn delete(&self, container_id: &str) -> Result<()>;

    /// Rows currently marked `running`.
    async fn list_active(&self) -> Result<Vec<ContainerRecord>>;

    /// Every row, for operator listings.
    async fn list_all(&self) -> Result<Vec<ContainerRecord>>;
}

/// True when `err` was caused by the registry table not existing yet.
pub fn is_missing_table(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err.message().contains("no such table"),
        _ => false,
    })
}

/// SQLite-backed registry over the `user_containers` table.
#[derive(Debug, Clone)]
pub struct SqliteContainerRegistry {
    pool: SqlitePool,
}

impl SqliteContainerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContainerRegistry for SqliteContainerRegistry {
    async fn create(
        &self,
        user_id: &str,
        container_id: &str,
        container_name: &str,
    ) -> Result<ContainerRecord> {
        let record = ContainerRecord::new(user_id, container_id, container_name);

        sqlx::query(
            r#"
            INSERT INTO user_containers (
                user_id, container_id, container_name, status, created_at, last_active
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                container_id = excluded.container_id,
                container_name = excluded.container_name,
                status = excluded.status,
                created_at = excluded.created_at,
                last_active = excluded.last_active
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.container_id)
        .bind(&record.container_name)
        .bind(record.status)
        .bind(record.created_at)
        .bind(record.last_active)
        .execute(&self.pool)
        .await
        .with_context(|| format!("creating registry row for user {}", user_id))?;

        Ok(record)
    }

    async fn get_by_user_id(&self, user_id: &str) -> Result<Option<ContainerRecord>> {
        let query = format!(
            "SELECT {} FROM user_containers WHERE user_id = ?",
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, ContainerRecord>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching registry row by user ID")?;

        Ok(record)
    }

    async fn get_by_id(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        let query = format!(
            "SELECT {} FROM user_containers WHERE container_id = ?",
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, ContainerRecord>(&query)
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching registry row by container ID")?;

        Ok(record)
    }

    async fn update_last_active(&self, container_id: &str) -> Result<()> {
        sqlx::query("UPDATE user_containers SET last_active = ? WHERE container_id = ?")
            .bind(Utc::now())
            .bind(container_id)
            .execute(&self.pool)
            .await
            .context("updating registry last_active")?;

        Ok(())
    }

    async fn update_status(&self, container_id: &str, status: RegistryStatus) -> Result<()> {
        sqlx::query("UPDATE user_containers SET status = ? WHERE container_id = ?")
            .bind(status)
            .bind(container_id)
            .execute(&self.pool)
            .await
            .context("updating registry status")?;

        Ok(())
    }

    async fn delete(&self, container_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM user_containers WHERE container_id = ?")
            .bind(container_id)
            .execute(&self.pool)
            .await
            .context("deleting registry row")?;

        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ContainerRecord>> {
        let query = format!(
            "SELECT {} FROM user_containers WHERE status = 'running' ORDER BY last_active DESC",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, ContainerRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing active registry rows")?;

        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<ContainerRecord>> {
        let query = format!(
            "SELECT {} FROM user_containers ORDER BY user_id",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, ContainerRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing registry rows")?;

        Ok(records)
    }
}
