//! Per-user container lifecycle.
//!
//! Resolution for a user goes cache → registry → daemon, creating a container
//! only when none of them yields a running one. The registry owns the
//! user ↔ container mapping; liveness is always asked of the daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::cache::ContainerCache;
use super::error::{LifecycleError, LifecycleResult};
use super::models::{ContainerInfo, ExecHandle, FleetConfig, RestoreReport, UserConfig};
use crate::container::{
    ConfigBuilder, ContainerBuildParams, ContainerRuntimeApi, ContainerStatus, ExecOptions,
    HealthMonitor, container_name_for, validate_user_id,
};
use crate::registry::{ContainerRegistry, RegistryStatus, is_missing_table};

type ProvisionFuture = Shared<BoxFuture<'static, Result<ContainerInfo, Arc<LifecycleError>>>>;

/// Owns the cache, the registry handle and the daemon client.
#[derive(Clone)]
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    registry: Arc<dyn ContainerRegistry>,
    cache: Arc<dyn ContainerCache>,
    health: HealthMonitor,
    config: Arc<FleetConfig>,
    /// One in-flight provisioning task per user.
    creating: Arc<Mutex<HashMap<String, ProvisionFuture>>>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        registry: Arc<dyn ContainerRegistry>,
        cache: Arc<dyn ContainerCache>,
        config: FleetConfig,
    ) -> Self {
        let health = HealthMonitor::new(runtime.clone(), config.health.clone());
        Self {
            runtime,
            registry,
            cache,
            health,
            config: Arc::new(config),
            creating: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<dyn ContainerRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<dyn ContainerCache> {
        &self.cache
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Host directory bind-mounted into the user's container.
    pub fn user_data_dir(&self, user_id: &str) -> PathBuf {
        self.config.data_root.join(user_id)
    }

    /// Return the user's running container, provisioning one if needed.
    ///
    /// Safe to call on every request. Concurrent callers for the same user
    /// share a single provisioning task and observe the same result.
    pub async fn get_or_create_container(
        &self,
        user_id: &str,
        user_config: &UserConfig,
    ) -> LifecycleResult<ContainerInfo> {
        validate_user_id(user_id)?;

        let in_flight = self.creating.lock().await.get(user_id).cloned();
        if let Some(task) = in_flight {
            debug!("Joining in-flight provisioning for user {}", user_id);
            return task.await.map_err(LifecycleError::from_shared);
        }

        if let Some(info) = self.cache.get(user_id) {
            match self.health.get_container_status(&info.id).await? {
                ContainerStatus::Running => return Ok(self.mark_active(info).await),
                status => {
                    debug!(
                        "Cached container {} for user {} is {}; evicting",
                        info.id, user_id, status
                    );
                    self.cache.remove(user_id);
                }
            }
        }

        let task = {
            let mut creating = self.creating.lock().await;
            match creating.get(user_id) {
                Some(task) => task.clone(),
                None => {
                    let task = self.spawn_provisioning(user_id, user_config);
                    creating.insert(user_id.to_string(), task.clone());
                    task
                }
            }
        };

        task.await.map_err(LifecycleError::from_shared)
    }

    /// Spawn the registry/daemon resolution as a detached task so that it
    /// completes (and clears its `creating` entry) even if every waiter drops.
    fn spawn_provisioning(&self, user_id: &str, user_config: &UserConfig) -> ProvisionFuture {
        let this = self.clone();
        let owner = user_id.to_string();
        let user_config = user_config.clone();

        let handle = tokio::spawn(async move {
            let result = this.resolve_or_create(&owner, &user_config).await;
            this.creating.lock().await.remove(&owner);
            result.map_err(Arc::new)
        });

        let user_id = user_id.to_string();
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(LifecycleError::Creation {
                    container_name: container_name_for(&user_id),
                    user_id,
                    reason: format!("provisioning task failed: {}", e),
                })),
            }
        }
        .boxed()
        .shared()
    }

    /// Registry and daemon steps of resolution, run inside the provisioning task.
    async fn resolve_or_create(
        &self,
        user_id: &str,
        user_config: &UserConfig,
    ) -> LifecycleResult<ContainerInfo> {
        if let Some(record) = self.registry.get_by_user_id(user_id).await? {
            match self.health.get_container_status(&record.container_id).await? {
                ContainerStatus::Running => {
                    let info = ContainerInfo::from(record);
                    self.cache.insert(info.clone());
                    return Ok(self.mark_active(info).await);
                }
                status => {
                    info!(
                        "Registry row for user {} points at {} container {}; replacing",
                        user_id, status, record.container_id
                    );
                    self.remove_daemon_container(&record.container_id).await?;
                    self.registry.delete(&record.container_id).await?;
                }
            }
        }

        let name = container_name_for(user_id);
        if let Some(existing) = self.runtime.inspect_container(&name).await? {
            warn!(
                "Removing unregistered container {} ({}) before provisioning user {}",
                name, existing.id, user_id
            );
            self.remove_daemon_container(&existing.id).await?;
        }

        self.create_container(user_id, user_config).await
    }

    /// Provision a fresh container: data directory, create, start, readiness
    /// wait, registry row, cache entry.
    ///
    /// Any failure is reported as [`LifecycleError::Creation`]. A container
    /// that never became ready is force-removed.
    pub async fn create_container(
        &self,
        user_id: &str,
        user_config: &UserConfig,
    ) -> LifecycleResult<ContainerInfo> {
        validate_user_id(user_id)?;

        let container_name = container_name_for(user_id);
        let creation_error = |reason: String| LifecycleError::Creation {
            user_id: user_id.to_string(),
            container_name: container_name.clone(),
            reason,
        };

        let data_dir = self.user_data_dir(user_id);
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            creation_error(format!(
                "creating data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let image = user_config
            .image
            .as_deref()
            .unwrap_or(&self.config.default_image);
        let spec = ConfigBuilder::container_spec(&ContainerBuildParams {
            user_id,
            tier: user_config.tier,
            data_dir: &data_dir,
            image,
            network: self.config.network.as_deref(),
            env: &user_config.env,
        })
        .map_err(|e| creation_error(e.to_string()))?;

        info!(
            "Creating container {} for user {} (tier {}, image {})",
            container_name, user_id, user_config.tier, image
        );
        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| creation_error(e.to_string()))?;

        let ready = match self.runtime.start_container(&container_id).await {
            Ok(()) => self.health.wait_for_container_ready(&container_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            warn!(
                "Container {} for user {} failed to start: {}",
                container_id, user_id, e
            );
            self.discard_container(&container_id).await;
            return Err(creation_error(e.to_string()));
        }

        let record = match self
            .registry
            .create(user_id, &container_id, &container_name)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.discard_container(&container_id).await;
                return Err(creation_error(format!("recording container: {:#}", e)));
            }
        };

        let info = ContainerInfo::from(record);
        self.cache.insert(info.clone());
        info!(
            "Container {} ({}) ready for user {}",
            container_name, container_id, user_id
        );
        Ok(info)
    }

    /// Start the user's cached container and wait until it is running.
    pub async fn start_container(&self, user_id: &str) -> LifecycleResult<ContainerInfo> {
        let info = self.cached(user_id)?;

        self.runtime.start_container(&info.id).await?;
        self.health.wait_for_container_ready(&info.id).await?;

        self.cache.set_status(user_id, RegistryStatus::Running);
        self.registry
            .update_status(&info.id, RegistryStatus::Running)
            .await?;
        info!("Started container {} for user {}", info.id, user_id);

        Ok(self.mark_active(info).await)
    }

    /// Stop the user's cached container; stopping a stopped container is a no-op.
    pub async fn stop_container(
        &self,
        user_id: &str,
        timeout_seconds: Option<u32>,
    ) -> LifecycleResult<()> {
        let info = self.cached(user_id)?;
        let timeout = timeout_seconds.unwrap_or(self.config.stop_timeout_secs);

        match self.runtime.stop_container(&info.id, Some(timeout)).await {
            Ok(()) => info!("Stopped container {} for user {}", info.id, user_id),
            Err(e) if e.is_not_running() => {
                debug!("Container {} was already stopped", info.id);
            }
            Err(e) => return Err(e.into()),
        }

        self.cache.set_status(user_id, RegistryStatus::Stopped);
        self.registry
            .update_status(&info.id, RegistryStatus::Stopped)
            .await?;
        Ok(())
    }

    /// Remove the user's container and its ownership records.
    ///
    /// The data directory is deleted only when `remove_volume` is set, and
    /// only after cache and registry are clean.
    pub async fn destroy_container(&self, user_id: &str, remove_volume: bool) -> LifecycleResult<()> {
        validate_user_id(user_id)?;

        let container_id = match self.cache.get(user_id) {
            Some(info) => info.id,
            None => match self.registry.get_by_user_id(user_id).await? {
                Some(record) => record.container_id,
                None => {
                    return Err(LifecycleError::NotFound {
                        user_id: user_id.to_string(),
                    });
                }
            },
        };

        match self
            .runtime
            .stop_container(&container_id, Some(self.config.stop_timeout_secs))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_running() || e.is_not_found() => {}
            Err(e) => warn!("Failed to stop container {}: {}", container_id, e),
        }
        self.remove_daemon_container(&container_id).await?;

        self.cache.remove(user_id);
        self.registry.delete(&container_id).await?;
        info!("Destroyed container {} for user {}", container_id, user_id);

        if remove_volume {
            let data_dir = self.user_data_dir(user_id);
            match tokio::fs::remove_dir_all(&data_dir).await {
                Ok(()) => info!("Removed data directory {}", data_dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(LifecycleError::DataDir {
                        path: data_dir,
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Run `command` through `bash -c` in the user's container, provisioning
    /// it if needed, and return the attached output stream.
    ///
    /// Execs are not serialized per user; pass an absolute working directory
    /// rather than relying on shared shell state.
    pub async fn exec_in_container(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        command: &str,
        options: &ExecOptions,
    ) -> LifecycleResult<ExecHandle> {
        let info = self.get_or_create_container(user_id, user_config).await?;
        let spec = ConfigBuilder::exec_spec(command, options)?;

        debug!("Exec in {} for user {}", info.id, user_id);
        let session = self.runtime.exec(&info.id, &spec).await?;

        Ok(ExecHandle {
            exec_id: session.exec_id,
            container_id: info.id,
            stream: session.output,
        })
    }

    /// Rebuild the cache from active registry rows. Run once at startup.
    pub async fn load_containers_from_database(&self) -> LifecycleResult<RestoreReport> {
        let records = match self.registry.list_active().await {
            Ok(records) => records,
            Err(e) if is_missing_table(&e) => {
                info!("Container registry not initialised yet; nothing to restore");
                return Ok(RestoreReport::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut report = RestoreReport::default();
        for record in records {
            let container_id = record.container_id.clone();
            match self.runtime.inspect_container(&container_id).await {
                Ok(Some(details)) if details.state.is_running() => {
                    debug!("Restored container {} for user {}", container_id, record.user_id);
                    self.cache.insert(ContainerInfo::from(record));
                    report.restored += 1;
                }
                Ok(Some(details)) => {
                    match self
                        .registry
                        .update_status(&container_id, RegistryStatus::Stopped)
                        .await
                    {
                        Ok(()) => {
                            debug!(
                                "Container {} for user {} is {}; marked stopped",
                                container_id, record.user_id, details.state
                            );
                            report.marked_stopped += 1;
                        }
                        Err(e) => {
                            warn!("Failed to mark container {} stopped: {:#}", container_id, e);
                            report.failed += 1;
                        }
                    }
                }
                Ok(None) => match self.registry.delete(&container_id).await {
                    Ok(()) => {
                        info!(
                            "Container {} for user {} no longer exists; dropped registry row",
                            container_id, record.user_id
                        );
                        report.removed += 1;
                    }
                    Err(e) => {
                        warn!("Failed to drop registry row for {}: {:#}", container_id, e);
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    warn!("Skipping container {} during restore: {}", container_id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Restored {} container(s) from registry ({} stopped, {} removed, {} failed)",
            report.restored, report.marked_stopped, report.removed, report.failed
        );
        Ok(report)
    }

    pub fn get_all_containers(&self) -> Vec<ContainerInfo> {
        self.cache.snapshot()
    }

    pub fn get_container_by_user_id(&self, user_id: &str) -> Option<ContainerInfo> {
        self.cache.get(user_id)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// True while a provisioning task for `user_id` is in flight. Its
    /// container may already exist without a registry row.
    pub(crate) async fn is_provisioning(&self, user_id: &str) -> bool {
        self.creating.lock().await.contains_key(user_id)
    }

    fn cached(&self, user_id: &str) -> LifecycleResult<ContainerInfo> {
        self.cache
            .get(user_id)
            .ok_or_else(|| LifecycleError::NotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Refresh `last_active` in cache and registry.
    async fn mark_active(&self, mut info: ContainerInfo) -> ContainerInfo {
        let now = Utc::now();
        info.last_active = now;
        self.cache.touch(&info.user_id, now);
        if let Err(e) = self.registry.update_last_active(&info.id).await {
            warn!("Failed to record activity for {}: {:#}", info.id, e);
        }
        info
    }

    /// Force-remove a daemon container; an absent container counts as removed.
    async fn remove_daemon_container(&self, container_id: &str) -> LifecycleResult<()> {
        match self.runtime.remove_container(container_id, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal of a container that failed provisioning.
    async fn discard_container(&self, container_id: &str) {
        if let Err(e) = self.remove_daemon_container(container_id).await {
            warn!(
                "Failed to remove unusable container {}: {}",
                container_id, e
            );
        }
    }
}
