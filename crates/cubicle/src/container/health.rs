//! Container readiness polling and point-in-time status checks.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};
use super::{ContainerRuntimeApi, ContainerState};

/// Readiness wait tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Inspections before giving up.
    pub max_attempts: u32,
    /// Delay after the first inspection, doubled after each miss.
    pub initial_delay_ms: u64,
    /// Upper bound for the doubled delay.
    pub max_delay_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

/// Coarse liveness as seen by callers deciding whether to recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Missing,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Missing => write!(f, "missing"),
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: HealthConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Poll until the daemon reports the container running.
    ///
    /// Fails immediately when the container is missing or has exited/died;
    /// transient daemon errors are retried within the attempt budget.
    pub async fn wait_for_container_ready(&self, container_id: &str) -> ContainerResult<()> {
        let attempts = self.config.max_attempts.max(1);
        let max_delay = Duration::from_millis(self.config.max_delay_ms);
        let mut delay = Duration::from_millis(self.config.initial_delay_ms).min(max_delay);
        let mut last_state = ContainerState::Unknown.to_string();

        for attempt in 1..=attempts {
            match self.runtime.inspect_container(container_id).await {
                Ok(Some(details)) if details.state.is_running() => {
                    debug!(
                        "Container {} ready after {} attempt(s)",
                        container_id, attempt
                    );
                    return Ok(());
                }
                Ok(Some(details)) if details.state.is_terminal() => {
                    return Err(ContainerError::StartupFailed {
                        container_id: container_id.to_string(),
                        state: details.state.to_string(),
                    });
                }
                Ok(Some(details)) => {
                    last_state = details.state.to_string();
                }
                Ok(None) => {
                    return Err(ContainerError::ContainerNotFound(container_id.to_string()));
                }
                Err(e @ ContainerError::InvalidInput(_)) => return Err(e),
                Err(e) => {
                    debug!(
                        "Readiness check {} for {} failed: {}",
                        attempt, container_id, e
                    );
                    last_state = format!("error: {}", e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }

        Err(ContainerError::ReadinessTimeout {
            container_id: container_id.to_string(),
            attempts,
            last_state,
        })
    }

    /// Single inspection; a missing container is `Missing`, not an error.
    pub async fn get_container_status(&self, container_id: &str) -> ContainerResult<ContainerStatus> {
        match self.runtime.inspect_container(container_id).await {
            Ok(Some(details)) if details.state.is_running() => Ok(ContainerStatus::Running),
            Ok(Some(_)) => Ok(ContainerStatus::Stopped),
            Ok(None) => Ok(ContainerStatus::Missing),
            Err(ContainerError::ContainerNotFound(_)) => Ok(ContainerStatus::Missing),
            Err(e) => Err(e),
        }
    }
}
