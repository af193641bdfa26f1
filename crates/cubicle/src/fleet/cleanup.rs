//! Idle and orphan container reclamation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::error::LifecycleResult;
use super::manager::LifecycleManager;
use crate::container::{USER_ID_LABEL, managed_label_filter};

/// Background sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Run sweeps on a timer while serving.
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Seconds without activity before a container is destroyed.
    pub idle_timeout_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            idle_timeout_secs: 30 * 60,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Containers reclaimed by one manual run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub idle_containers: usize,
    pub orphaned_containers: usize,
    pub total: usize,
}

#[derive(Clone)]
pub struct CleanupManager {
    lifecycle: LifecycleManager,
    config: CleanupConfig,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CleanupManager {
    pub fn new(lifecycle: LifecycleManager, config: CleanupConfig) -> Self {
        Self {
            lifecycle,
            config,
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Destroy cached containers idle for longer than `idle_time`. The data
    /// directory is kept.
    pub async fn cleanup_idle_containers(&self, idle_time: Duration) -> usize {
        let threshold = TimeDelta::from_std(idle_time).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let mut cleaned = 0;

        for info in self.lifecycle.get_all_containers() {
            let idle_for = now - info.last_active;
            if idle_for <= threshold {
                continue;
            }

            info!(
                "Destroying idle container {} for user {} (idle {}s)",
                info.name,
                info.user_id,
                idle_for.num_seconds()
            );
            match self.lifecycle.destroy_container(&info.user_id, false).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(
                    "Failed to destroy idle container for user {}: {}",
                    info.user_id, e
                ),
            }
        }

        if cleaned > 0 {
            info!("Destroyed {} idle container(s)", cleaned);
        }
        cleaned
    }

    /// Remove managed daemon containers that no registry row claims.
    pub async fn cleanup_orphaned_containers(&self) -> LifecycleResult<usize> {
        let runtime = self.lifecycle.runtime();
        let containers = runtime
            .list_containers_by_label(&managed_label_filter())
            .await?;
        let mut cleaned = 0;

        for container in containers {
            // Checked before the registry: a finished provisioning task has
            // already written its row.
            let provisioning = match container.labels.get(USER_ID_LABEL) {
                Some(owner) => self.lifecycle.is_provisioning(owner).await,
                None => false,
            };
            if provisioning {
                debug!("Skipping {} while its owner is being provisioned", container.id);
                continue;
            }

            match self.lifecycle.registry().get_by_id(&container.id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Registry lookup for {} failed; leaving it alone: {:#}",
                        container.id, e
                    );
                    continue;
                }
            }

            info!(
                "Removing orphaned container {} ({}, {})",
                container.display_name(),
                container.id,
                container.state
            );

            if container.state.is_running() {
                match runtime
                    .stop_container(
                        &container.id,
                        Some(self.lifecycle.config().stop_timeout_secs),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_running() || e.is_not_found() => {}
                    Err(e) => warn!("Failed to stop orphan {}: {}", container.id, e),
                }
            }

            match runtime.remove_container(&container.id, true).await {
                Ok(()) => cleaned += 1,
                Err(e) if e.is_not_found() => {
                    debug!("Orphan {} already gone", container.id);
                }
                Err(e) => {
                    warn!("Failed to remove orphan {}: {}", container.id, e);
                    continue;
                }
            }

            // Drop any cache entry still pointing at the removed container.
            if let Some(stale) = self
                .lifecycle
                .get_all_containers()
                .into_iter()
                .find(|info| info.id == container.id)
            {
                self.lifecycle.cache().remove(&stale.user_id);
            }
        }

        if cleaned > 0 {
            info!("Removed {} orphaned container(s)", cleaned);
        }
        Ok(cleaned)
    }

    /// Run both sweeps every `interval`, replacing any running timer.
    pub async fn start_cleanup_interval(&self, interval: Duration) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        info!(
            "Starting container cleanup (every {}s, idle timeout {}s)",
            interval.as_secs(),
            self.config.idle_timeout_secs
        );

        let this = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = this.sweep().await;
                if report.total > 0 {
                    info!(
                        "Cleanup sweep reclaimed {} container(s) ({} idle, {} orphaned)",
                        report.total, report.idle_containers, report.orphaned_containers
                    );
                } else {
                    debug!("Cleanup sweep found nothing to reclaim");
                }
            }
        }));
    }

    pub async fn stop_cleanup_interval(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            info!("Stopped container cleanup");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// One-shot run of both sweeps.
    pub async fn run_manual_cleanup(&self) -> LifecycleResult<CleanupReport> {
        let idle_containers = self
            .cleanup_idle_containers(self.config.idle_timeout())
            .await;
        let orphaned_containers = self.cleanup_orphaned_containers().await?;

        Ok(CleanupReport {
            idle_containers,
            orphaned_containers,
            total: idle_containers + orphaned_containers,
        })
    }

    /// Timer variant: an orphan listing failure is logged, not returned.
    async fn sweep(&self) -> CleanupReport {
        let idle_containers = self
            .cleanup_idle_containers(self.config.idle_timeout())
            .await;
        let orphaned_containers = match self.cleanup_orphaned_containers().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Orphan sweep failed: {}", e);
                0
            }
        };

        CleanupReport {
            idle_containers,
            orphaned_containers,
            total: idle_containers + orphaned_containers,
        }
    }
}
