//! Registry data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RegistryStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryStatus::Running => write!(f, "running"),
            RegistryStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for RegistryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RegistryStatus::Running),
            "stopped" => Ok(RegistryStatus::Stopped),
            _ => Err(format!("unknown container status: {}", s)),
        }
    }
}

/// Ownership record: which container belongs to which user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ContainerRecord {
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub status: RegistryStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ContainerRecord {
    /// Fresh `running` record stamped with the current time.
    pub fn new(
        user_id: impl Into<String>,
        container_id: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            container_id: container_id.into(),
            container_name: container_name.into(),
            status: RegistryStatus::Running,
            created_at: now,
            last_active: now,
        }
    }
}
