//! Fleet data models.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::container::{ExecStream, HealthConfig, UserTier};
use crate::registry::{ContainerRecord, RegistryStatus};

/// Cached view of a user's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub status: RegistryStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl From<ContainerRecord> for ContainerInfo {
    fn from(record: ContainerRecord) -> Self {
        Self {
            id: record.container_id,
            name: record.container_name,
            user_id: record.user_id,
            status: record.status,
            created_at: record.created_at,
            last_active: record.last_active,
        }
    }
}

/// Per-request provisioning input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub tier: UserTier,
    /// Image override; the fleet default applies when absent.
    pub image: Option<String>,
    /// Extra container environment.
    pub env: BTreeMap<String, String>,
}

impl UserConfig {
    pub fn with_tier(tier: UserTier) -> Self {
        Self {
            tier,
            ..Default::default()
        }
    }
}

/// A started exec bound to a user's container.
pub struct ExecHandle {
    pub exec_id: String,
    pub container_id: String,
    /// Raw output chunks; the caller demultiplexes and interprets them.
    pub stream: ExecStream,
}

impl fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecHandle")
            .field("exec_id", &self.exec_id)
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}

/// Outcome of restoring the cache from the registry at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Running containers now cached.
    pub restored: usize,
    /// Rows whose container exists but is not running.
    pub marked_stopped: usize,
    /// Rows whose container no longer exists.
    pub removed: usize,
    /// Rows skipped after an error.
    pub failed: usize,
}

/// Settings for [`super::LifecycleManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Parent of the per-user data directories.
    pub data_root: PathBuf,
    pub default_image: String,
    /// Network to attach containers to; the daemon default when absent.
    pub network: Option<String>,
    /// Grace period before a stopping container is killed.
    pub stop_timeout_secs: u32,
    pub health: HealthConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/cubicle/users"),
            default_image: "cubicle/agent:latest".to_string(),
            network: None,
            stop_timeout_secs: 10,
            health: HealthConfig::default(),
        }
    }
}
