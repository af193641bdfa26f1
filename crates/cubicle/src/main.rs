use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use futures::StreamExt;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use cubicle::container::{
    ContainerRuntimeApi, ContainerStatus, DockerRuntime, ExecOptions, ExecOutput,
    ResourceMonitor, UserTier,
};
use cubicle::db::Database;
use cubicle::fleet::{CleanupManager, InMemoryContainerCache, LifecycleManager, UserConfig};
use cubicle::registry::{ContainerRegistry, RegistryStatus, SqliteContainerRegistry};
use cubicle::settings::{
    self, APP_NAME, AppConfig, default_config_dir, default_data_dir, default_state_dir,
    expand_path, expand_str_path, write_default_config,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Serve(cmd) => handle_serve(&ctx, cmd).await,
        Command::Cleanup(cmd) => handle_cleanup(&ctx, cmd).await,
        Command::List => handle_list(&ctx).await,
        Command::Stats(cmd) => handle_stats(&ctx, cmd).await,
        Command::Exec(cmd) => handle_exec(&ctx, cmd).await,
        Command::Destroy(cmd) => handle_destroy(&ctx, cmd).await,
        Command::Init(_) | Command::Config { .. } | Command::Completions { .. } => {
            Err(anyhow!("command does not need the async runtime"))
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Cubicle - per-user sandbox container fleet manager.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Config file (or directory holding config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Silence logging
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// More log output; repeat for trace
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,
    /// Log at trace level
    #[arg(long, global = true)]
    trace: bool,
    /// Print results as JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Print results as YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Never colorize log output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// When to colorize log output
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Report destructive actions instead of performing them
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Answer yes to confirmations
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Include source locations in log lines
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Restore the fleet and run periodic cleanup until interrupted
    Serve(ServeCommand),
    /// Reclaim idle and orphaned containers once
    Cleanup(CleanupCommand),
    /// List registered containers with their live daemon status
    List,
    /// Show resource usage for one user or the whole fleet
    Stats(StatsCommand),
    /// Run a shell command in a user's container, provisioning it if needed
    Exec(ExecCommand),
    /// Remove a user's container and registry row
    Destroy(DestroyCommand),
    /// Write a default config file
    Init(InitCommand),
    /// Show or reset the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Disable the periodic cleanup sweep
    #[arg(long = "no-cleanup")]
    no_cleanup: bool,
    /// Override the sweep interval in seconds
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct CleanupCommand {
    /// Override the idle timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    idle_timeout: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct StatsCommand {
    /// User to sample; every registered container when omitted
    user_id: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ExecCommand {
    /// Owner of the container
    user_id: String,
    /// Tier used if the container has to be provisioned
    #[arg(long, default_value = "free")]
    tier: UserTier,
    /// Image override used if the container has to be provisioned
    #[arg(long)]
    image: Option<String>,
    /// Absolute working directory inside the container
    #[arg(short = 'w', long = "workdir", value_name = "PATH")]
    working_dir: Option<String>,
    /// Extra environment for the command (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    tty: bool,
    /// Command line, passed to `bash -c`
    #[arg(trailing_var_arg = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct DestroyCommand {
    /// Owner of the container
    user_id: String,
    /// Also delete the user's data directory
    #[arg(long = "remove-volume")]
    remove_volume: bool,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the merged configuration
    Show,
    /// Print the config file location
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        if common.dry_run && !paths.config_file.exists() {
            info!(
                "dry-run: no config at {}, using defaults",
                paths.config_file.display()
            );
        }
        let config = settings::load_or_init_config(&paths.config_file, !common.dry_run)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let log_file = self.config.logging.open_file()?.map(std::sync::Mutex::new);

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("cubicle={level},bollard=warn")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .with(log_file.map(|file| {
                    tracing_subscriber::fmt::layer().json().with_writer(file)
                }))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .with(log_file.map(|file| {
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                }))
                .try_init()
                .ok();
        }

        // The library logs through `log`.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.logging.level.as_str()),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: not creating {} or {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        fs::create_dir_all(&self.paths.user_data_dir).with_context(|| {
            format!(
                "creating user data directory {}",
                self.paths.user_data_dir.display()
            )
        })?;
        Ok(())
    }

    fn print<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            human()
        };
        println!("{output}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
    database: PathBuf,
    user_data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;

        Ok(Self {
            config_file,
            database: state_dir.join(format!("{APP_NAME}.db")),
            user_data_dir: data_dir.join("users"),
            data_dir,
            state_dir,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
            self.user_data_dir = self.data_dir.join("users");
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
            self.database = self.state_dir.join(format!("{APP_NAME}.db"));
        }
        if let Some(ref database) = cfg.paths.database {
            self.database = expand_str_path(database)?;
        }
        if let Some(ref users) = cfg.paths.user_data_path {
            self.user_data_dir = expand_str_path(users)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}, database: {}, users: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display(),
            self.database.display(),
            self.user_data_dir.display()
        )
    }
}

/// Daemon client, registry and managers wired together.
struct Fleet {
    registry: Arc<dyn ContainerRegistry>,
    lifecycle: LifecycleManager,
    cleanup: CleanupManager,
    resources: ResourceMonitor,
}

impl Fleet {
    async fn open(ctx: &RuntimeContext) -> Result<Self> {
        let docker = DockerRuntime::connect(ctx.config.docker.socket.as_deref())?;
        let version = docker
            .health_check()
            .await
            .context("container daemon is not reachable")?;
        debug!("container daemon answered ping: {}", version);
        let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(docker);

        let db = Database::new(&ctx.paths.database).await?;
        let registry: Arc<dyn ContainerRegistry> =
            Arc::new(SqliteContainerRegistry::new(db.pool().clone()));

        let lifecycle = LifecycleManager::new(
            runtime.clone(),
            registry.clone(),
            Arc::new(InMemoryContainerCache::new()),
            ctx.config.fleet_config(ctx.paths.user_data_dir.clone()),
        );
        lifecycle.load_containers_from_database().await?;

        let cleanup = CleanupManager::new(lifecycle.clone(), ctx.config.cleanup.clone());
        let resources = ResourceMonitor::new(runtime);

        Ok(Self {
            registry,
            lifecycle,
            cleanup,
            resources,
        })
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let fleet = Fleet::open(ctx).await?;
    info!(
        "Managing {} running container(s); image {}",
        fleet.lifecycle.cached_count(),
        ctx.config.docker.default_image
    );

    let sweep = ctx.config.cleanup.enabled && !cmd.no_cleanup;
    if sweep {
        let interval = cmd
            .interval
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or_else(|| ctx.config.cleanup.interval());
        fleet.cleanup.start_cleanup_interval(interval).await;
    } else {
        info!("Periodic cleanup disabled");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    if sweep {
        fleet.cleanup.stop_cleanup_interval().await;
    }
    Ok(())
}

async fn handle_cleanup(ctx: &RuntimeContext, cmd: CleanupCommand) -> Result<()> {
    if ctx.common.dry_run {
        info!("dry-run: would reclaim idle and orphaned containers");
        return Ok(());
    }

    let mut config = ctx.config.cleanup.clone();
    if let Some(secs) = cmd.idle_timeout {
        config.idle_timeout_secs = secs;
    }

    let fleet = Fleet::open(ctx).await?;
    let cleanup = CleanupManager::new(fleet.lifecycle.clone(), config);
    let report = cleanup.run_manual_cleanup().await?;

    ctx.print(&report, || {
        format!(
            "Reclaimed {} container(s): {} idle, {} orphaned",
            report.total, report.idle_containers, report.orphaned_containers
        )
    })
}

#[derive(Debug, Serialize)]
struct ListEntry {
    user_id: String,
    container_id: String,
    container_name: String,
    registry_status: RegistryStatus,
    daemon_status: Option<ContainerStatus>,
    last_active: chrono::DateTime<chrono::Utc>,
}

async fn handle_list(ctx: &RuntimeContext) -> Result<()> {
    let fleet = Fleet::open(ctx).await?;

    let mut entries = Vec::new();
    for record in fleet.registry.list_all().await? {
        let daemon_status = match fleet
            .lifecycle
            .health()
            .get_container_status(&record.container_id)
            .await
        {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to inspect {}: {}", record.container_id, e);
                None
            }
        };
        entries.push(ListEntry {
            user_id: record.user_id,
            container_id: record.container_id,
            container_name: record.container_name,
            registry_status: record.status,
            daemon_status,
            last_active: record.last_active,
        });
    }

    ctx.print(&entries, || {
        if entries.is_empty() {
            return "No containers registered".to_string();
        }
        let mut out = format!(
            "{:<24} {:<14} {:<10} {:<10} {}",
            "USER", "CONTAINER", "REGISTRY", "DAEMON", "LAST ACTIVE"
        );
        for entry in &entries {
            let short_id: String = entry.container_id.chars().take(12).collect();
            let daemon = entry
                .daemon_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            out.push_str(&format!(
                "\n{:<24} {:<14} {:<10} {:<10} {}",
                entry.user_id,
                short_id,
                entry.registry_status,
                daemon,
                entry.last_active.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        out
    })
}

async fn handle_stats(ctx: &RuntimeContext, cmd: StatsCommand) -> Result<()> {
    let fleet = Fleet::open(ctx).await?;

    let container_ids: Vec<String> = match cmd.user_id {
        Some(user_id) => {
            let record = fleet
                .registry
                .get_by_user_id(&user_id)
                .await?
                .ok_or_else(|| anyhow!("no container registered for user {user_id}"))?;
            vec![record.container_id]
        }
        None => fleet
            .registry
            .list_active()
            .await?
            .into_iter()
            .map(|record| record.container_id)
            .collect(),
    };

    let report = fleet.resources.collect_fleet_stats(&container_ids).await;

    ctx.print(&report, || {
        let mut out = format!(
            "{:<14} {:>7} {:>7} {:>12} {:>12} {:>12} {:>12}",
            "CONTAINER", "CPU %", "MEM %", "NET RX", "NET TX", "BLK READ", "BLK WRITE"
        );
        for stats in &report.stats {
            let short_id: String = stats.container_id.chars().take(12).collect();
            out.push_str(&format!(
                "\n{:<14} {:>7.2} {:>7.2} {:>12} {:>12} {:>12} {:>12}",
                short_id,
                stats.cpu_percent,
                stats.memory.percent,
                stats.network.rx_bytes,
                stats.network.tx_bytes,
                stats.disk_io.read_bytes,
                stats.disk_io.write_bytes
            ));
        }
        for failure in &report.errors {
            out.push_str(&format!(
                "\n{}: error: {}",
                failure.container_id, failure.error
            ));
        }
        out
    })
}

async fn handle_exec(ctx: &RuntimeContext, cmd: ExecCommand) -> Result<()> {
    let fleet = Fleet::open(ctx).await?;

    let mut options = ExecOptions {
        working_dir: cmd.working_dir,
        tty: cmd.tty,
        ..Default::default()
    };
    for pair in &cmd.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --env '{pair}', expected KEY=VALUE"))?;
        options.env.insert(key.to_string(), value.to_string());
    }

    let user_config = UserConfig {
        tier: cmd.tier,
        image: cmd.image,
        ..Default::default()
    };
    let command = cmd.command.join(" ");

    let mut handle = fleet
        .lifecycle
        .exec_in_container(&cmd.user_id, &user_config, &command, &options)
        .await?;
    debug!("exec {} started in {}", handle.exec_id, handle.container_id);

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    while let Some(chunk) = handle.stream.next().await {
        match chunk? {
            ExecOutput::StdErr(bytes) => stderr.write_all(&bytes).await?,
            other => stdout.write_all(other.bytes()).await?,
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;
    Ok(())
}

async fn handle_destroy(ctx: &RuntimeContext, cmd: DestroyCommand) -> Result<()> {
    if ctx.common.dry_run {
        info!(
            "dry-run: would destroy container for user {}{}",
            cmd.user_id,
            if cmd.remove_volume {
                " and its data directory"
            } else {
                ""
            }
        );
        return Ok(());
    }

    let fleet = Fleet::open(ctx).await?;
    fleet
        .lifecycle
        .destroy_container(&cmd.user_id, cmd.remove_volume)
        .await?;
    println!("Destroyed container for user {}", cmd.user_id);
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "{} exists; pass --force to overwrite it",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: not writing {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.print(&ctx.config, || format!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: leaving {} untouched",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
