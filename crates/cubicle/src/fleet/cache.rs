//! In-process container cache.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::models::ContainerInfo;
use crate::registry::RegistryStatus;

/// Cache of [`ContainerInfo`] keyed by user id.
pub trait ContainerCache: Send + Sync {
    fn get(&self, user_id: &str) -> Option<ContainerInfo>;

    fn insert(&self, info: ContainerInfo);

    fn remove(&self, user_id: &str) -> Option<ContainerInfo>;

    /// Set `last_active`; false when the user has no entry.
    fn touch(&self, user_id: &str, at: DateTime<Utc>) -> bool;

    /// Set the status; false when the user has no entry.
    fn set_status(&self, user_id: &str, status: RegistryStatus) -> bool;

    fn snapshot(&self) -> Vec<ContainerInfo>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryContainerCache {
    entries: DashMap<String, ContainerInfo>,
}

impl InMemoryContainerCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContainerCache for InMemoryContainerCache {
    fn get(&self, user_id: &str) -> Option<ContainerInfo> {
        self.entries.get(user_id).map(|entry| entry.value().clone())
    }

    fn insert(&self, info: ContainerInfo) {
        self.entries.insert(info.user_id.clone(), info);
    }

    fn remove(&self, user_id: &str) -> Option<ContainerInfo> {
        self.entries.remove(user_id).map(|(_, info)| info)
    }

    fn touch(&self, user_id: &str, at: DateTime<Utc>) -> bool {
        match self.entries.get_mut(user_id) {
            Some(mut entry) => {
                entry.last_active = at;
                true
            }
            None => false,
        }
    }

    fn set_status(&self, user_id: &str, status: RegistryStatus) -> bool {
        match self.entries.get_mut(user_id) {
            Some(mut entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<ContainerInfo> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
