//! Pure builders for container-creation and exec specs.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::container::{
    ContainerSpec, ExecSpec, MANAGED_LABEL, USER_ID_LABEL, container_name_for,
    validate_container_path, validate_env_var_key, validate_user_id,
};
use super::error::{ContainerError, ContainerResult};

/// Mount point of the per-user data directory inside every container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Label recording the tier a container was provisioned for.
pub const TIER_LABEL: &str = "cubicle.tier";

const GIB: i64 = 1024 * 1024 * 1024;
const NANO_CPUS_PER_CPU: i64 = 1_000_000_000;

/// Subscription tier controlling a container's resource limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl UserTier {
    pub fn limits(&self) -> TierLimits {
        match self {
            UserTier::Free => TierLimits {
                memory_bytes: GIB,
                nano_cpus: NANO_CPUS_PER_CPU,
                pids_limit: 256,
            },
            UserTier::Pro => TierLimits {
                memory_bytes: 4 * GIB,
                nano_cpus: 2 * NANO_CPUS_PER_CPU,
                pids_limit: 512,
            },
            UserTier::Enterprise => TierLimits {
                memory_bytes: 8 * GIB,
                nano_cpus: 4 * NANO_CPUS_PER_CPU,
                pids_limit: 1024,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Pro => "pro",
            UserTier::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for UserTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserTier {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(UserTier::Free),
            "pro" => Ok(UserTier::Pro),
            "enterprise" => Ok(UserTier::Enterprise),
            other => Err(ContainerError::InvalidInput(format!(
                "unknown tier '{}'; expected free, pro or enterprise",
                other
            ))),
        }
    }
}

/// Hard resource limits applied to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub memory_bytes: i64,
    /// CPU quota in units of 1e-9 CPUs.
    pub nano_cpus: i64,
    pub pids_limit: i64,
}

/// Inputs for one container-creation spec.
#[derive(Debug, Clone)]
pub struct ContainerBuildParams<'a> {
    pub user_id: &'a str,
    pub tier: UserTier,
    /// Host directory bind-mounted at [`WORKSPACE_DIR`].
    pub data_dir: &'a Path,
    pub image: &'a str,
    pub network: Option<&'a str>,
    /// Extra environment, applied over the defaults.
    pub env: &'a BTreeMap<String, String>,
}

/// Per-command options for an exec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    /// Absolute working directory; defaults to [`WORKSPACE_DIR`].
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
    pub tty: bool,
}

impl ExecOptions {
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

/// Stateless spec construction.
pub struct ConfigBuilder;

impl ConfigBuilder {
    /// Build the creation spec for a user's container.
    ///
    /// The container idles on `sleep infinity`; all work arrives via exec.
    pub fn container_spec(params: &ContainerBuildParams<'_>) -> ContainerResult<ContainerSpec> {
        validate_user_id(params.user_id)?;

        let data_dir = params.data_dir.to_str().ok_or_else(|| {
            ContainerError::InvalidInput(format!(
                "data directory is not valid UTF-8: {}",
                params.data_dir.display()
            ))
        })?;

        let name = container_name_for(params.user_id);
        let limits = params.tier.limits();

        let mut spec = ContainerSpec::new(name.clone(), params.image)
            .hostname(name)
            .command(vec!["sleep".to_string(), "infinity".to_string()])
            .env("HOME", WORKSPACE_DIR)
            .env("USER_ID", params.user_id)
            .env("TERM", "xterm-256color")
            .label(MANAGED_LABEL, "true")
            .label(USER_ID_LABEL, params.user_id)
            .label(TIER_LABEL, params.tier.as_str())
            .bind(data_dir, WORKSPACE_DIR)
            .workdir(WORKSPACE_DIR);

        for (key, value) in params.env {
            validate_env_var_key(key)?;
            spec.env.insert(key.clone(), value.clone());
        }

        if let Some(network) = params.network {
            spec = spec.network_mode(network);
        }

        spec.memory_bytes = Some(limits.memory_bytes);
        spec.nano_cpus = Some(limits.nano_cpus);
        spec.pids_limit = Some(limits.pids_limit);
        spec.security_opt = vec!["no-new-privileges:true".to_string()];

        spec.validate()?;
        Ok(spec)
    }

    /// Build an exec spec running `command` through `bash -c`.
    ///
    /// The command string is passed through untouched.
    pub fn exec_spec(command: &str, options: &ExecOptions) -> ContainerResult<ExecSpec> {
        if command.trim().is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec command cannot be empty".to_string(),
            ));
        }

        let working_dir = options
            .working_dir
            .clone()
            .unwrap_or_else(|| WORKSPACE_DIR.to_string());
        validate_container_path(&working_dir)?;

        for key in options.env.keys() {
            validate_env_var_key(key)?;
        }

        Ok(ExecSpec {
            cmd: vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                command.to_string(),
            ],
            env: options.env.clone(),
            working_dir: Some(working_dir),
            user: options.user.clone(),
            tty: options.tty,
        })
    }
}
