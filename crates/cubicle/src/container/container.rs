//! Container types and configuration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Label carried by every container this fleet manages.
pub const MANAGED_LABEL: &str = "cubicle.managed";

/// Label recording the owning user of a managed container.
pub const USER_ID_LABEL: &str = "cubicle.user_id";

/// Prefix of the deterministic per-user container name.
pub const CONTAINER_NAME_PREFIX: &str = "claude-user-";

/// Label filter (`key=value`) selecting managed containers.
pub fn managed_label_filter() -> String {
    format!("{}=true", MANAGED_LABEL)
}

/// Deterministic container name for a user.
pub fn container_name_for(user_id: &str) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, user_id)
}

/// Bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBind {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeBind {
    /// Render in the daemon's `host:container[:ro]` bind syntax.
    pub fn to_bind_string(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Container hostname.
    pub hostname: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run as PID 1.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Bind mounts.
    pub binds: Vec<VolumeBind>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// User (`uid:gid`) the main process runs as.
    pub user: Option<String>,
    /// Network mode (e.g., "bridge", "none", or a named network).
    pub network_mode: Option<String>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU quota in units of 1e-9 CPUs.
    pub nano_cpus: Option<i64>,
    /// Maximum number of processes.
    pub pids_limit: Option<i64>,
    /// Capabilities to drop.
    pub cap_drop: Vec<String>,
    /// Security options (e.g. `no-new-privileges:true`).
    pub security_opt: Vec<String>,
    /// Allocate a pseudo-TTY for the main process.
    pub tty: bool,
}

impl ContainerSpec {
    /// Create a new spec with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all fields before handing the spec to the daemon.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.name)?;

        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for bind in &self.binds {
            validate_bind_path(&bind.host_path)?;
            validate_bind_path(&bind.container_path)?;
            validate_container_path(&bind.container_path)?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        Ok(())
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn bind(mut self, host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.binds.push(VolumeBind {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        });
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }
}

/// Configuration for one command executed inside a running container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecSpec {
    /// Argument vector; the first element is the program.
    pub cmd: Vec<String>,
    /// Environment variables for this exec only.
    pub env: BTreeMap<String, String>,
    /// Absolute working directory.
    pub working_dir: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Allocate a pseudo-TTY (stdout and stderr are merged).
    pub tty: bool,
}

impl ExecSpec {
    /// Environment in the daemon's `KEY=value` form.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}

/// Container state as reported by the daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse a daemon state string, mapping anything unrecognised to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    /// States from which a container will not reach `running` on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Dead)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of inspecting a single container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Container entry from a list call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// First name without the leading `/` the daemon adds, or the id.
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .map(|name| name.trim_start_matches('/'))
            .unwrap_or(&self.id)
    }
}

/// One chunk of output from an exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    StdOut(Bytes),
    StdErr(Bytes),
    /// TTY output, where stdout and stderr are not separated.
    Console(Bytes),
}

impl ExecOutput {
    pub fn bytes(&self) -> &Bytes {
        match self {
            ExecOutput::StdOut(b) | ExecOutput::StdErr(b) | ExecOutput::Console(b) => b,
        }
    }
}

/// Raw output stream of an attached exec.
pub type ExecStream = Pin<Box<dyn Stream<Item = ContainerResult<ExecOutput>> + Send>>;

/// A started, attached exec.
pub struct ExecSession {
    pub exec_id: String,
    pub output: ExecStream,
}

impl fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSession")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Raw stats snapshot (daemon `/containers/{id}/stats` JSON shape)
// ============================================================================

/// Point-in-time stats snapshot. Fields absent from the daemon response
/// deserialize to zero/empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStats {
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
    pub networks: Option<BTreeMap<String, NetworkStats>>,
    pub blkio_stats: BlkioStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    pub total_usage: u64,
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub usage: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioStats {
    pub io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioEntry {
    pub op: String,
    pub value: u64,
}

fn invalid(message: impl Into<String>) -> ContainerError {
    ContainerError::InvalidInput(message.into())
}

/// Reject `value` when empty, longer than `max_len`, or containing a
/// character outside `allowed`.
fn check_token(
    what: &str,
    value: &str,
    max_len: usize,
    allowed: impl Fn(char) -> bool,
) -> ContainerResult<()> {
    if value.is_empty() || value.len() > max_len {
        return Err(invalid(format!(
            "{what} must be 1-{max_len} characters, got {}",
            value.len()
        )));
    }
    if let Some(bad) = value.chars().find(|c| !allowed(*c)) {
        return Err(invalid(format!("{what} '{value}' contains invalid character {bad:?}")));
    }
    Ok(())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// `[registry/][namespace/]name[:tag][@digest]`, without path traversal.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    check_token("image name", image, 256, |c| {
        is_name_char(c) || matches!(c, '.' | '/' | ':' | '@')
    })?;
    if image.contains("..") {
        return Err(invalid(format!("image name '{image}' contains '..'")));
    }
    Ok(())
}

pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    check_token("container name", name, 128, is_name_char)?;
    if name.starts_with('-') {
        return Err(invalid(format!("container name '{name}' starts with '-'")));
    }
    Ok(())
}

/// Guard for ids and names passed to per-container daemon calls.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    check_token("container id", id, 128, is_name_char)
}

/// User ids end up in container names and host paths.
pub fn validate_user_id(user_id: &str) -> ContainerResult<()> {
    check_token("user id", user_id, 64, is_name_char)
}

fn validate_hostname(hostname: &str) -> ContainerResult<()> {
    check_token("hostname", hostname, 253, |c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '.'
    })?;
    let well_formed = hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
    });
    if !well_formed {
        return Err(invalid(format!("hostname '{hostname}' has a malformed label")));
    }
    Ok(())
}

pub fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    check_token("environment variable", key, 256, |c| {
        c.is_ascii_alphanumeric() || c == '_'
    })?;
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid(format!(
            "environment variable '{key}' starts with a digit"
        )));
    }
    Ok(())
}

/// Bind paths are joined with ':' and may reach a shell; keep them plain.
fn validate_bind_path(path: &str) -> ContainerResult<()> {
    check_token("bind path", path, 4096, |c| {
        !c.is_control() && !":$`!&|;<>(){}[]*?\\\"'".contains(c)
    })
}

/// Paths inside the container must be absolute.
pub fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(invalid(format!(
            "container path '{}' must be absolute",
            path.escape_debug()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_container_name_for_user() {
        assert_eq!(container_name_for("7"), "claude-user-7");
        assert!(validate_container_name(&container_name_for("alice_01")).is_ok());
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("7").is_ok());
        assert!(validate_user_id("user-42_a").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("../etc").is_err());
        assert!(validate_user_id("a b").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_image_names() {
        for ok in ["ubuntu:24.04", "registry.local:5000/team/agent:v2", "agent@sha256:abc123"] {
            assert!(validate_image_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "agent;reboot", "../agent", "agent image"] {
            assert!(validate_image_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_container_names() {
        assert!(validate_container_name("claude-user-7").is_ok());
        assert!(validate_container_name("-leading").is_err());
        assert!(validate_container_name("a/b").is_err());
        assert!(validate_container_id_or_name("4f2c9a1b").is_ok());
        assert!(validate_container_id_or_name("").is_err());
    }

    #[test]
    fn test_hostnames_and_env_keys() {
        assert!(validate_hostname("claude-user-7").is_ok());
        assert!(validate_hostname("node.internal").is_ok());
        assert!(validate_hostname("-bad").is_err());
        assert!(validate_hostname("a..b").is_err());

        assert!(validate_env_var_key("AGENT_HOME").is_ok());
        assert!(validate_env_var_key("9LIVES").is_err());
        assert!(validate_env_var_key("AGENT-HOME").is_err());
    }

    #[test]
    fn test_bind_paths() {
        assert!(validate_bind_path("/srv/cubicle/users/7").is_ok());
        assert!(validate_bind_path("/srv/users:/etc").is_err());
        assert!(validate_bind_path("/srv/$(id)").is_err());
        assert!(validate_container_path("/workspace").is_ok());
        assert!(validate_container_path("workspace").is_err());
    }

    #[test]
    fn test_spec_validate() {
        let spec = ContainerSpec::new("claude-user-1", "ubuntu:24.04")
            .hostname("claude-user-1")
            .env("HOME", "/workspace")
            .bind("/srv/data/1", "/workspace")
            .workdir("/workspace");
        assert!(spec.validate().is_ok());

        let bad = ContainerSpec::new("claude-user-1", "invalid$(whoami)");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("EXITED"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("bogus"), ContainerState::Unknown);
        assert!(ContainerState::Dead.is_terminal());
        assert!(!ContainerState::Created.is_terminal());
    }

    #[test]
    fn test_summary_display_name_strips_slash() {
        let summary = ContainerSummary {
            id: "abc".to_string(),
            names: vec!["/claude-user-7".to_string()],
            state: ContainerState::Running,
            labels: HashMap::new(),
        };
        assert_eq!(summary.display_name(), "claude-user-7");
    }

    #[test]
    fn test_raw_stats_tolerates_missing_and_null_fields() {
        let raw: RawStats = serde_json::from_str(
            r#"{
                "cpu_stats": {"cpu_usage": {"total_usage": 10}},
                "memory_stats": {},
                "networks": null,
                "blkio_stats": {"io_service_bytes_recursive": null}
            }"#,
        )
        .unwrap();
        assert_eq!(raw.cpu_stats.cpu_usage.total_usage, 10);
        assert_eq!(raw.precpu_stats.cpu_usage.total_usage, 0);
        assert!(raw.networks.is_none());
        assert!(raw.memory_stats.limit.is_none());
    }
}
