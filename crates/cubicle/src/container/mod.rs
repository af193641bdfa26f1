//! Container runtime management module.
//!
//! Provides an async interface to the container daemon (Docker Engine API)
//! plus the pure spec builders, readiness polling and stats derivation built
//! on top of it.

pub mod builder;
mod container;
mod error;
pub mod health;
pub mod stats;

pub use builder::{
    ConfigBuilder, ContainerBuildParams, ExecOptions, TIER_LABEL, TierLimits, UserTier, WORKSPACE_DIR,
};
pub use container::{
    BlkioEntry, BlkioStats, CONTAINER_NAME_PREFIX, ContainerDetails, ContainerSpec,
    ContainerState, ContainerSummary, CpuStats, CpuUsage, ExecOutput, ExecSession, ExecSpec,
    ExecStream, MANAGED_LABEL, MemoryStats, NetworkStats, RawStats, USER_ID_LABEL, VolumeBind,
    container_name_for, managed_label_filter, validate_container_id_or_name, validate_user_id,
};
pub use error::{ContainerError, ContainerResult};
pub use health::{ContainerStatus, HealthConfig, HealthMonitor};
pub use stats::{
    ContainerStats, DiskIo, FleetStatsReport, InterfaceUsage, MemoryUsage, NetworkUsage,
    ResourceMonitor, StatsFailure,
};

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use futures::StreamExt;

/// Container daemon abstraction for testability.
///
/// Every per-container call reports a missing container as
/// [`ContainerError::ContainerNotFound`] except `inspect_container`, which
/// answers `Ok(None)`.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create (but do not start) a container; returns the daemon-assigned id.
    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    /// Stop a container. Stopping an already stopped container yields
    /// [`ContainerError::NotRunning`].
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn inspect_container(&self, id_or_name: &str)
    -> ContainerResult<Option<ContainerDetails>>;
    /// List all containers (running or not) carrying `label` (`key=value`).
    async fn list_containers_by_label(&self, label: &str)
    -> ContainerResult<Vec<ContainerSummary>>;
    /// Start an attached exec and return its live output stream.
    async fn exec(&self, container_id: &str, spec: &ExecSpec) -> ContainerResult<ExecSession>;
    /// Take one non-streaming stats snapshot.
    async fn stats(&self, container_id: &str) -> ContainerResult<RawStats>;
}

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Seconds before a daemon request is abandoned.
    const REQUEST_TIMEOUT_SECS: u64 = 120;

    /// Connect to the daemon, using `socket` when given and the platform
    /// defaults (`DOCKER_HOST`, `/var/run/docker.sock`) otherwise.
    pub fn connect(socket: Option<&str>) -> ContainerResult<Self> {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(
                path,
                Self::REQUEST_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ContainerError::Connection(e.to_string()))?;

        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.docker
            .ping()
            .await
            .map_err(|e| ContainerError::Connection(e.to_string()))
    }
}

/// Map a daemon error, turning 404 into `ContainerNotFound`.
fn map_daemon_error(operation: &str, target: &str, err: BollardError) -> ContainerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => ContainerError::ContainerNotFound(target.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if message.contains("is not running") => ContainerError::NotRunning(target.to_string()),
        other => ContainerError::daemon(operation, other.to_string()),
    }
}

impl From<LogOutput> for ExecOutput {
    fn from(output: LogOutput) -> Self {
        match output {
            LogOutput::StdOut { message } => ExecOutput::StdOut(message),
            LogOutput::StdErr { message } => ExecOutput::StdErr(message),
            LogOutput::StdIn { message } | LogOutput::Console { message } => {
                ExecOutput::Console(message)
            }
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        spec.validate()?;

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.iter().map(VolumeBind::to_bind_string).collect())
            },
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            pids_limit: spec.pids_limit,
            network_mode: spec.network_mode.clone(),
            cap_drop: if spec.cap_drop.is_empty() {
                None
            } else {
                Some(spec.cap_drop.clone())
            },
            security_opt: if spec.security_opt.is_empty() {
                None
            } else {
                Some(spec.security_opt.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect(),
            ),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ),
            hostname: spec.hostname.clone(),
            working_dir: spec.workdir.clone(),
            user: spec.user.clone(),
            tty: Some(spec.tty),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_daemon_error("create", &spec.name, e))?;

        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        match self
            .docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_daemon_error("start", container_id, e)),
        }
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let options = timeout_seconds.map(|t| StopContainerOptions { t: i64::from(t) });
        match self.docker.stop_container(container_id, options).await {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Err(ContainerError::NotRunning(container_id.to_string())),
            Err(e) => Err(map_daemon_error("stop", container_id, e)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_daemon_error("rm", container_id, e))
    }

    async fn inspect_container(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<ContainerDetails>> {
        validate_container_id_or_name(id_or_name)?;

        let response = match self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(map_daemon_error("inspect", id_or_name, e)),
        };

        let state = match response.state {
            Some(ref state) if state.running == Some(true) => ContainerState::Running,
            Some(ref state) => state
                .status
                .as_ref()
                .map(|status| ContainerState::parse(&status.to_string()))
                .unwrap_or_default(),
            None => ContainerState::Unknown,
        };

        Ok(Some(ContainerDetails {
            id: response.id.unwrap_or_else(|| id_or_name.to_string()),
            name: response
                .name
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            state,
            labels: response
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
        }))
    }

    async fn list_containers_by_label(
        &self,
        label: &str,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_daemon_error("ps", label, e))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                Some(ContainerSummary {
                    id: summary.id?,
                    names: summary.names.unwrap_or_default(),
                    state: summary
                        .state
                        .as_deref()
                        .map(ContainerState::parse)
                        .unwrap_or_default(),
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn exec(&self, container_id: &str, spec: &ExecSpec) -> ContainerResult<ExecSession> {
        validate_container_id_or_name(container_id)?;

        let created = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(spec.cmd.clone()),
                    env: Some(spec.env_pairs()),
                    working_dir: spec.working_dir.clone(),
                    user: spec.user.clone(),
                    tty: Some(spec.tty),
                    attach_stdin: Some(false),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_daemon_error("exec", container_id, e))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: spec.tty,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_daemon_error("exec", container_id, e))?;

        match started {
            StartExecResults::Attached { output, .. } => {
                let output = output
                    .map(|chunk| {
                        chunk
                            .map(ExecOutput::from)
                            .map_err(|e| ContainerError::daemon("exec", e.to_string()))
                    })
                    .boxed();
                Ok(ExecSession {
                    exec_id: created.id,
                    output,
                })
            }
            StartExecResults::Detached => Err(ContainerError::daemon(
                "exec",
                "daemon started the exec detached; no output stream available",
            )),
        }
    }

    async fn stats(&self, container_id: &str) -> ContainerResult<RawStats> {
        validate_container_id_or_name(container_id)?;

        let mut stream = Box::pin(self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        ));

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(map_daemon_error("stats", container_id, e)),
            None => {
                return Err(ContainerError::daemon(
                    "stats",
                    format!("daemon returned no stats for {}", container_id),
                ));
            }
        };

        let value =
            serde_json::to_value(&stats).map_err(|e| ContainerError::ParseError(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| ContainerError::ParseError(e.to_string()))
    }
}
