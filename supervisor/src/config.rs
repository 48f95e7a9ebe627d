use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::process::WorkerCommand;

/// Lifecycle policy handed to the supervisor actor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long the worker may go without activity before it is stopped
    pub inactivity_timeout: Duration,
    /// Probe cadence; also the cadence of the inactivity check
    pub health_check_interval: Duration,
    /// Window after spawn in which the first successful probe must land
    pub startup_grace: Duration,
    /// Startup failures tolerated before the supervisor gives up
    pub max_restart_attempts: u32,
    /// Consecutive failed probes that force a restart of a running worker
    pub unhealthy_threshold: u32,
    /// Bounded wait between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Number of probe results kept for diagnostics
    pub health_history_len: usize,
}

impl SupervisorSettings {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_millis(900_000),
            health_check_interval: Duration::from_millis(2_000),
            startup_grace: Duration::from_millis(30_000),
            max_restart_attempts: 5,
            unhealthy_threshold: 3,
            stop_grace: Duration::from_millis(5_000),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(30_000),
            health_history_len: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the control API listens on
    pub port: u16,
    /// Command line and environment of the supervised worker
    pub worker: WorkerCommand,
    /// Readiness endpoint of the worker
    pub worker_health_url: String,
    /// Per-probe request timeout
    pub health_check_timeout: Duration,
    /// Window in which identical activity triggers are collapsed
    pub activity_debounce: Duration,
    /// Where the diagnostic status snapshot is written
    pub status_file: PathBuf,
    pub status_persist_interval: Duration,
    pub supervisor: SupervisorSettings,
}

/// Optional TOML overlay named by `SUPERVISOR_CONFIG`. Environment variables win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub inactivity_timeout_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub health_check_timeout_ms: Option<u64>,
    pub startup_grace_ms: Option<u64>,
    pub max_restart_attempts: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    pub stop_grace_ms: Option<u64>,
    pub restart_backoff_base_ms: Option<u64>,
    pub restart_backoff_max_ms: Option<u64>,
    pub worker_command: Option<String>,
    pub worker_env: Option<BTreeMap<String, String>>,
    pub worker_port: Option<u16>,
    pub worker_health_url: Option<String>,
    pub activity_debounce_ms: Option<u64>,
    pub health_history_len: Option<usize>,
    pub status_file: Option<PathBuf>,
    pub status_persist_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {e}", path.display()))
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let file = match std::env::var("SUPERVISOR_CONFIG") {
            Ok(path) => FileConfig::load(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge env (via `lookup`), file values and defaults, in that order.
    pub fn resolve(
        file: FileConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let defaults = SupervisorSettings::default();
        let ms = |key: &str, file_val: Option<u64>, default: Duration| -> anyhow::Result<Duration> {
            setting(&lookup, key, file_val, default.as_millis() as u64).map(Duration::from_millis)
        };

        let worker_port = setting(&lookup, "WORKER_PORT", file.worker_port, 8787)?;
        let worker_health_url = lookup("WORKER_HEALTH_URL")
            .or(file.worker_health_url)
            .unwrap_or_else(|| format!("http://127.0.0.1:{worker_port}/health"));

        let command_line = lookup("WORKER_COMMAND")
            .or(file.worker_command)
            .unwrap_or_else(default_worker_binary);
        let mut env: Vec<(String, String)> = match lookup("WORKER_ENV") {
            Some(raw) => parse_env_pairs(&raw)?,
            None => file.worker_env.unwrap_or_default().into_iter().collect(),
        };
        env.push(("PORT".to_string(), worker_port.to_string()));
        let worker = WorkerCommand::parse(&command_line, env)?;

        let supervisor = SupervisorSettings {
            inactivity_timeout: ms(
                "INACTIVITY_TIMEOUT_MS",
                file.inactivity_timeout_ms,
                defaults.inactivity_timeout,
            )?,
            health_check_interval: ms(
                "HEALTH_CHECK_INTERVAL_MS",
                file.health_check_interval_ms,
                defaults.health_check_interval,
            )?,
            startup_grace: ms("STARTUP_GRACE_MS", file.startup_grace_ms, defaults.startup_grace)?,
            max_restart_attempts: setting(
                &lookup,
                "MAX_RESTART_ATTEMPTS",
                file.max_restart_attempts,
                defaults.max_restart_attempts,
            )?,
            unhealthy_threshold: setting(
                &lookup,
                "UNHEALTHY_THRESHOLD",
                file.unhealthy_threshold,
                defaults.unhealthy_threshold,
            )?,
            stop_grace: ms("STOP_GRACE_MS", file.stop_grace_ms, defaults.stop_grace)?,
            backoff_base: ms(
                "RESTART_BACKOFF_BASE_MS",
                file.restart_backoff_base_ms,
                defaults.backoff_base,
            )?,
            backoff_max: ms(
                "RESTART_BACKOFF_MAX_MS",
                file.restart_backoff_max_ms,
                defaults.backoff_max,
            )?,
            health_history_len: setting(
                &lookup,
                "HEALTH_HISTORY_LEN",
                file.health_history_len,
                defaults.health_history_len,
            )?,
        };

        let config = Self {
            port: setting(&lookup, "SUPERVISOR_PORT", file.port, 9191)?,
            worker,
            worker_health_url,
            health_check_timeout: ms(
                "HEALTH_CHECK_TIMEOUT_MS",
                file.health_check_timeout_ms,
                Duration::from_millis(1_000),
            )?,
            activity_debounce: ms(
                "ACTIVITY_DEBOUNCE_MS",
                file.activity_debounce_ms,
                Duration::from_millis(250),
            )?,
            status_file: lookup("STATUS_FILE")
                .map(PathBuf::from)
                .or(file.status_file)
                .unwrap_or_else(|| PathBuf::from("./data/supervisor-status.json")),
            status_persist_interval: ms(
                "STATUS_PERSIST_INTERVAL_MS",
                file.status_persist_interval_ms,
                Duration::from_millis(5_000),
            )?,
            supervisor,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let s = &self.supervisor;
        for (name, value) in [
            ("INACTIVITY_TIMEOUT_MS", s.inactivity_timeout),
            ("HEALTH_CHECK_INTERVAL_MS", s.health_check_interval),
            ("HEALTH_CHECK_TIMEOUT_MS", self.health_check_timeout),
            ("STARTUP_GRACE_MS", s.startup_grace),
            ("STATUS_PERSIST_INTERVAL_MS", self.status_persist_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if s.max_restart_attempts == 0 {
            anyhow::bail!("MAX_RESTART_ATTEMPTS must be at least 1");
        }
        if s.unhealthy_threshold == 0 {
            anyhow::bail!("UNHEALTHY_THRESHOLD must be at least 1");
        }
        if s.health_history_len == 0 {
            anyhow::bail!("HEALTH_HISTORY_LEN must be at least 1");
        }
        Ok(())
    }
}

fn setting<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    file_val: Option<T>,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        None => Ok(file_val.unwrap_or(default)),
    }
}

fn parse_env_pairs(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Invalid WORKER_ENV entry '{pair}'. Expected KEY=VALUE"))?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Default worker: the `stub-worker` binary next to this workspace's debug build.
fn default_worker_binary() -> String {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    workspace_root
        .join("target/debug/stub-worker")
        .to_string_lossy()
        .to_string()
}
