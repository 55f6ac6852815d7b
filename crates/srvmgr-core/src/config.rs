use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
pub const DEFAULT_WOL_PORT: u16 = 9;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
pub const MAX_TASK_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_OFFLINE_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024; // per stream

/// Top-level config (srvmgr.toml + SRVMGR_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SrvmgrConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub wol: WolConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone used to evaluate cron expressions.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How often `serve` re-reads tasks changed through the CLI. 0 disables.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Upper bound on concurrently running commands across all tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Pause between retry attempts. 0 retries immediately.
    #[serde(default)]
    pub retry_delay_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// How long `serve` waits for in-flight executions on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            tick_interval_ms: default_tick_interval_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            max_workers: default_max_workers(),
            retry_delay_secs: 0,
            retention_days: default_retention_days(),
            prune_interval_secs: default_prune_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Parse `timezone` into a `chrono_tz::Tz`.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| CoreError::Config(format!("invalid timezone {:?}: {e}", self.timezone)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Run commands through a login shell (`-l`) so the user's profile is loaded.
    #[serde(default = "bool_true")]
    pub login_shell: bool,
    /// Working directory for commands. `None` means `$HOME`.
    pub working_dir: Option<String>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Time between SIGTERM and SIGKILL when a command times out.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            login_shell: true,
            working_dir: None,
            max_output_bytes: default_max_output_bytes(),
            kill_grace_secs: default_kill_grace_secs(),
            default_timeout_secs: default_task_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolConfig {
    #[serde(default = "default_wol_port")]
    pub port: u16,
    /// Broadcast target used when neither the request nor the device names one.
    pub default_target: Option<String>,
}

impl Default for WolConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_WOL_PORT,
            default_target: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    #[default]
    Tcp,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    #[serde(default)]
    pub method: ProbeMethod,
    /// Ports tried by the TCP probe. A refused connection still proves the host is up.
    #[serde(default = "default_tcp_ports")]
    pub tcp_ports: Vec<u16>,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    /// Consecutive failures before an online device is reported offline.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
    /// Background sweep cadence for `serve`. 0 disables the sweep.
    #[serde(default)]
    pub sweep_interval_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::default(),
            tcp_ports: default_tcp_ports(),
            timeout_secs: default_probe_timeout_secs(),
            offline_threshold: DEFAULT_OFFLINE_THRESHOLD,
            sweep_interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive. `RUST_LOG` wins when set.
    pub level: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.srvmgr/srvmgr.db", home)
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_sync_interval_secs() -> u64 {
    5
}
fn default_max_workers() -> usize {
    4
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_prune_interval_secs() -> u64 {
    3_600
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_task_timeout_secs() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}
fn default_wol_port() -> u16 {
    DEFAULT_WOL_PORT
}
fn default_tcp_ports() -> Vec<u16> {
    vec![22, 80, 443, 445, 3389]
}
fn default_offline_threshold() -> u32 {
    DEFAULT_OFFLINE_THRESHOLD
}
fn default_probe_timeout_secs() -> u64 {
    3
}

impl SrvmgrConfig {
    /// Load config from a TOML file with SRVMGR_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `SRVMGR_CONFIG`
    ///   3. ~/.srvmgr/srvmgr.toml
    ///
    /// A missing file is not an error; defaults apply. Nested keys use a
    /// double underscore, e.g. `SRVMGR_SCHEDULER__MAX_WORKERS=8`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("SRVMGR_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
            .and_then(|config: SrvmgrConfig| {
                config.validate()?;
                Ok(config)
            })
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(SrvmgrConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SRVMGR_").ignore(&["config"]).split("__"))
    }

    /// Reject values that would make the daemon misbehave rather than fail fast.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.tz()?;
        if self.scheduler.max_workers == 0 {
            return Err(CoreError::Config("scheduler.max_workers must be > 0".into()));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(CoreError::Config(
                "scheduler.tick_interval_ms must be > 0".into(),
            ));
        }
        if !(1..=MAX_TASK_TIMEOUT_SECS).contains(&self.executor.default_timeout_secs) {
            return Err(CoreError::Config(format!(
                "executor.default_timeout_secs must be within 1..={MAX_TASK_TIMEOUT_SECS}"
            )));
        }
        if self.reachability.offline_threshold == 0 {
            return Err(CoreError::Config(
                "reachability.offline_threshold must be > 0".into(),
            ));
        }
        if self.reachability.method == ProbeMethod::Tcp && self.reachability.tcp_ports.is_empty() {
            return Err(CoreError::Config(
                "reachability.tcp_ports must not be empty for the tcp probe".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.srvmgr/srvmgr.toml", home)
}
