//! In-memory registry for tests and dry runs.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::models::{ContainerRecord, RegistryStatus};
use super::repository::ContainerRegistry;

/// Registry keyed by user id, held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryContainerRegistry {
    rows: RwLock<HashMap<String, ContainerRecord>>,
}

impl InMemoryContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record verbatim (timestamps and status included).
    pub async fn insert(&self, record: ContainerRecord) {
        self.rows
            .write()
            .await
            .insert(record.user_id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl ContainerRegistry for InMemoryContainerRegistry {
    async fn create(
        &self,
        user_id: &str,
        container_id: &str,
        container_name: &str,
    ) -> Result<ContainerRecord> {
        let record = ContainerRecord::new(user_id, container_id, container_name);
        self.insert(record.clone()).await;
        Ok(record)
    }

    async fn get_by_user_id(&self, user_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self.rows.read().await.get(user_id).cloned())
    }

    async fn get_by_id(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|r| r.container_id == container_id)
            .cloned())
    }

    async fn update_last_active(&self, container_id: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(record) = rows.values_mut().find(|r| r.container_id == container_id) {
            record.last_active = Utc::now();
        }
        Ok(())
    }

    async fn update_status(&self, container_id: &str, status: RegistryStatus) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(record) = rows.values_mut().find(|r| r.container_id == container_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn delete(&self, container_id: &str) -> Result<()> {
        self.rows
            .write()
            .await
            .retain(|_, r| r.container_id != container_id);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ContainerRecord>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.status == RegistryStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ContainerRecord>> {
        let mut records: Vec<_> = self.rows.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }
}
