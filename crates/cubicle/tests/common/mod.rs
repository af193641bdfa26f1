//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cubicle::container::{
    ContainerDetails, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerSpec,
    ContainerState, ContainerSummary, ExecOutput, ExecSession, ExecSpec, HealthConfig,
    MANAGED_LABEL, RawStats, USER_ID_LABEL, container_name_for,
};
use cubicle::fleet::{FleetConfig, InMemoryContainerCache, LifecycleManager};
use cubicle::registry::{
    ContainerRecord, ContainerRegistry, InMemoryContainerRegistry, RegistryStatus,
};
use futures::StreamExt;
use tempfile::TempDir;

/// Daemon calls that can be made to fail for a given container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Inspect,
    Stop,
    Remove,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    pub spec: Option<ContainerSpec>,
}

/// In-memory daemon with call counters.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub exec_calls: AtomicUsize,
    /// Delay inside `create_container`, widening race windows.
    create_delay: Mutex<Duration>,
    /// When set, `create_container` fails with this message.
    create_failure: Mutex<Option<String>>,
    /// State a container enters when started.
    start_state: Mutex<Option<ContainerState>>,
    stats: Mutex<RawStats>,
    last_exec: Mutex<Option<ExecSpec>>,
    failures: Mutex<HashSet<(FakeOp, String)>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn fail_creates(&self, message: &str) {
        *self.create_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_start_state(&self, state: ContainerState) {
        *self.start_state.lock().unwrap() = Some(state);
    }

    pub fn set_stats(&self, stats: RawStats) {
        *self.stats.lock().unwrap() = stats;
    }

    /// Make `op` fail with a daemon error whenever it targets `id`.
    pub fn fail_on(&self, op: FakeOp, id: &str) {
        self.failures.lock().unwrap().insert((op, id.to_string()));
    }

    /// Add a container directly, as if created out-of-band.
    pub fn add_container(&self, name: &str, state: ContainerState, user_id: Option<&str>) -> String {
        let id = self.allocate_id();
        let mut labels = HashMap::new();
        if let Some(user_id) = user_id {
            labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
            labels.insert(USER_ID_LABEL.to_string(), user_id.to_string());
        }
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                state,
                labels,
                spec: None,
            },
        );
        id
    }

    /// Add a managed container for `user_id` with the standard name.
    pub fn add_user_container(&self, user_id: &str, state: ContainerState) -> String {
        self.add_container(&container_name_for(user_id), state, Some(user_id))
    }

    pub fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(id) {
            container.state = state;
        }
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn ids_named(&self, name: &str) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn last_exec(&self) -> Option<ExecSpec> {
        self.last_exec.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    fn injected(&self, op: FakeOp, id: &str) -> ContainerResult<()> {
        if self.failures.lock().unwrap().contains(&(op, id.to_string())) {
            return Err(ContainerError::Daemon {
                operation: format!("{op:?}").to_lowercase(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn allocate_id(&self) -> String {
        format!("fake{:04}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn find(&self, id_or_name: &str) -> Option<(String, FakeContainer)> {
        let containers = self.containers.lock().unwrap();
        containers
            .get(id_or_name)
            .map(|c| (id_or_name.to_string(), c.clone()))
            .or_else(|| {
                containers
                    .iter()
                    .find(|(_, c)| c.name == id_or_name)
                    .map(|(id, c)| (id.clone(), c.clone()))
            })
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.create_failure.lock().unwrap().clone() {
            return Err(ContainerError::Daemon {
                operation: "create".to_string(),
                message,
            });
        }

        let mut containers = self.containers.lock().unwrap();
        if containers.values().any(|c| c.name == spec.name) {
            return Err(ContainerError::Daemon {
                operation: "create".to_string(),
                message: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }

        let id = self.allocate_id();
        containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                state: ContainerState::Created,
                labels: spec.labels.clone().into_iter().collect(),
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.start_state.lock().unwrap().unwrap_or(ContainerState::Running);
        match self.containers.lock().unwrap().get_mut(container_id) {
            Some(container) => {
                container.state = state;
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.injected(FakeOp::Stop, container_id)?;
        match self.containers.lock().unwrap().get_mut(container_id) {
            Some(container) if container.state.is_running() => {
                container.state = ContainerState::Exited;
                Ok(())
            }
            Some(_) => Err(ContainerError::NotRunning(container_id.to_string())),
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.injected(FakeOp::Remove, container_id)?;
        let mut containers = self.containers.lock().unwrap();
        match containers.get(container_id) {
            Some(container) if container.state.is_running() && !force => {
                Err(ContainerError::Daemon {
                    operation: "rm".to_string(),
                    message: "container is running; stop it first".to_string(),
                })
            }
            Some(_) => {
                containers.remove(container_id);
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn inspect_container(&self, id_or_name: &str) -> ContainerResult<Option<ContainerDetails>> {
        self.injected(FakeOp::Inspect, id_or_name)?;
        Ok(self.find(id_or_name).map(|(id, c)| ContainerDetails {
            id,
            name: c.name,
            state: c.state,
            labels: c.labels,
        }))
    }

    async fn list_containers_by_label(&self, label: &str) -> ContainerResult<Vec<ContainerSummary>> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let mut summaries: Vec<_> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.labels.get(key).is_some_and(|v| value.is_empty() || v == value))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![format!("/{}", c.name)],
                state: c.state,
                labels: c.labels.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn exec(&self, container_id: &str, spec: &ExecSpec) -> ContainerResult<ExecSession> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        match self.find(container_id) {
            Some((_, c)) if c.state.is_running() => {}
            Some(_) => return Err(ContainerError::NotRunning(container_id.to_string())),
            None => return Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
        *self.last_exec.lock().unwrap() = Some(spec.clone());

        let command = spec.cmd.last().cloned().unwrap_or_default();
        let chunks = vec![
            Ok(ExecOutput::StdOut(Bytes::from(format!("ran: {command}\n")))),
            Ok(ExecOutput::StdErr(Bytes::from_static(b"warning\n"))),
        ];
        Ok(ExecSession {
            exec_id: format!("exec-{}", self.exec_calls.load(Ordering::SeqCst)),
            output: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn stats(&self, container_id: &str) -> ContainerResult<RawStats> {
        if self.find(container_id).is_none() {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        }
        Ok(self.stats.lock().unwrap().clone())
    }
}

/// Registry whose `update_status` and `delete` fail for chosen containers.
pub struct FailingWrites {
    inner: Arc<InMemoryContainerRegistry>,
    container_ids: HashSet<String>,
}

impl FailingWrites {
    pub fn new(inner: Arc<InMemoryContainerRegistry>, container_ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner,
            container_ids: container_ids.iter().map(|id| id.to_string()).collect(),
        })
    }

    fn check(&self, container_id: &str) -> anyhow::Result<()> {
        if self.container_ids.contains(container_id) {
            anyhow::bail!("registry write rejected for {container_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRegistry for FailingWrites {
    async fn create(
        &self,
        user_id: &str,
        container_id: &str,
        container_name: &str,
    ) -> anyhow::Result<ContainerRecord> {
        self.inner.create(user_id, container_id, container_name).await
    }

    async fn get_by_user_id(&self, user_id: &str) -> anyhow::Result<Option<ContainerRecord>> {
        self.inner.get_by_user_id(user_id).await
    }

    async fn get_by_id(&self, container_id: &str) -> anyhow::Result<Option<ContainerRecord>> {
        self.inner.get_by_id(container_id).await
    }

    async fn update_last_active(&self, container_id: &str) -> anyhow::Result<()> {
        self.inner.update_last_active(container_id).await
    }

    async fn update_status(
        &self,
        container_id: &str,
        status: RegistryStatus,
    ) -> anyhow::Result<()> {
        self.check(container_id)?;
        self.inner.update_status(container_id, status).await
    }

    async fn delete(&self, container_id: &str) -> anyhow::Result<()> {
        self.check(container_id)?;
        self.inner.delete(container_id).await
    }

    async fn list_active(&self) -> anyhow::Result<Vec<ContainerRecord>> {
        self.inner.list_active().await
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ContainerRecord>> {
        self.inner.list_all().await
    }
}

/// Lifecycle manager over fakes and a temporary data root.
pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<InMemoryContainerRegistry>,
    pub cache: Arc<InMemoryContainerCache>,
    pub lifecycle: LifecycleManager,
    pub data_root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(InMemoryContainerRegistry::new()))
    }

    pub fn with_registry(registry: Arc<InMemoryContainerRegistry>) -> Self {
        Self::build(registry, None)
    }

    /// Harness with a custom readiness budget.
    pub fn with_health(health: HealthConfig) -> Self {
        Self::build(Arc::new(InMemoryContainerRegistry::new()), Some(health))
    }

    fn build(registry: Arc<InMemoryContainerRegistry>, health: Option<HealthConfig>) -> Self {
        let runtime = FakeRuntime::new();
        let cache = Arc::new(InMemoryContainerCache::new());
        let data_root = tempfile::tempdir().unwrap();
        let mut config = fleet_config(&data_root);
        if let Some(health) = health {
            config.health = health;
        }
        let lifecycle = LifecycleManager::new(
            runtime.clone(),
            registry.clone(),
            cache.clone(),
            config,
        );

        Self {
            runtime,
            registry,
            cache,
            lifecycle,
            data_root,
        }
    }

    /// Manager over the same fakes but a different registry implementation.
    pub fn lifecycle_with(&self, registry: Arc<dyn ContainerRegistry>) -> LifecycleManager {
        LifecycleManager::new(
            self.runtime.clone(),
            registry,
            self.cache.clone(),
            fleet_config(&self.data_root),
        )
    }
}

pub fn fleet_config(data_root: &TempDir) -> FleetConfig {
    FleetConfig {
        data_root: data_root.path().to_path_buf(),
        default_image: "cubicle/agent:test".to_string(),
        network: None,
        stop_timeout_secs: 1,
        health: HealthConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        },
    }
}
