//! Layered application configuration.
//!
//! Built-in defaults, then the TOML config file, then `CUBICLE__*`
//! environment variables (`CUBICLE__DOCKER__DEFAULT_IMAGE=...`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::HealthConfig;
use crate::fleet::{CleanupConfig, FleetConfig};

pub const APP_NAME: &str = "cubicle";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub docker: DockerConfig,
    pub health: HealthConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl LoggingConfig {
    /// Open the configured log file for appending, creating its directory.
    pub fn open_file(&self) -> Result<Option<fs::File>> {
        let Some(ref file) = self.file else {
            return Ok(None);
        };
        let path = Path::new(file);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Some(handle))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
    /// Registry database file; `<state_dir>/cubicle.db` when unset.
    pub database: Option<String>,
    /// Parent of per-user data directories; `<data_dir>/users` when unset.
    pub user_data_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Daemon socket; `DOCKER_HOST` or the platform default when unset.
    pub socket: Option<String>,
    pub default_image: String,
    pub network: Option<String>,
    pub stop_timeout_secs: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            default_image: "cubicle/agent:latest".to_string(),
            network: None,
            stop_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Fleet settings with per-user directories under `user_data_root`.
    pub fn fleet_config(&self, user_data_root: PathBuf) -> FleetConfig {
        FleetConfig {
            data_root: user_data_root,
            default_image: self.docker.default_image.clone(),
            network: self.docker.network.clone(),
            stop_timeout_secs: self.docker.stop_timeout_secs,
            health: self.health.clone(),
        }
    }
}

/// Load the layered configuration, writing a default file first when
/// `create_missing` is set and none exists.
pub fn load_or_init_config(config_file: &Path, create_missing: bool) -> Result<AppConfig> {
    if create_missing && !config_file.exists() {
        write_default_config(config_file)?;
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("loading configuration from {}", config_file.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("parsing configuration")?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {}\n# File: {}\n\n",
        APP_NAME,
        path.display()
    )
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::state_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = load_or_init_config(&path, true).unwrap();
        assert!(path.exists());
        assert_eq!(config.docker.default_image, "cubicle/agent:latest");
        assert_eq!(config.health.max_attempts, 30);
        assert!(config.cleanup.enabled);

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for cubicle"));
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[docker]
default_image = "registry.local/agent:2"
network = "sandbox"

[cleanup]
idle_timeout_secs = 60
"#,
        )
        .unwrap();

        let config = load_or_init_config(&path, false).unwrap();
        assert_eq!(config.docker.default_image, "registry.local/agent:2");
        assert_eq!(config.docker.network.as_deref(), Some("sandbox"));
        assert_eq!(config.cleanup.idle_timeout_secs, 60);
        assert_eq!(config.cleanup.interval_secs, 300);
        assert_eq!(config.docker.stop_timeout_secs, 10);
    }

    #[test]
    fn test_missing_file_without_create_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let config = load_or_init_config(&path, false).unwrap();
        assert!(!path.exists());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_fleet_config_from_app_config() {
        let mut config = AppConfig::default();
        config.docker.network = Some("sandbox".to_string());
        let fleet = config.fleet_config(PathBuf::from("/srv/users"));
        assert_eq!(fleet.data_root, PathBuf::from("/srv/users"));
        assert_eq!(fleet.network.as_deref(), Some("sandbox"));
        assert_eq!(fleet.stop_timeout_secs, 10);
    }

    #[test]
    fn test_log_file_is_created_and_appended() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("cubicle.log");
        let logging = LoggingConfig {
            file: Some(path.display().to_string()),
            ..Default::default()
        };

        writeln!(logging.open_file().unwrap().unwrap(), "first").unwrap();
        writeln!(logging.open_file().unwrap().unwrap(), "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        assert!(LoggingConfig::default().open_file().unwrap().is_none());
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "CUBICLE");
    }
}
