//! # Runtime configuration.
//!
//! [`Config`] is loaded from a TOML file, then overridden by environment
//! variables, then by CLI flags (in `main`). Every section has defaults, so an
//! empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [supervisor]
//! workers = 4                 # 0 = one per CPU
//! heartbeat_timeout_ms = 60000
//! grace_ms = 30000
//!
//! [supervisor.respawn]
//! first_delay_ms = 0          # 0 = respawn in the same tick
//! max_restarts = 0            # 0 = unlimited
//!
//! [worker]
//! batch_size = 100
//! flush_interval_ms = 1000
//! categories = ["tick", "depth"]
//!
//! [substrate]
//! namespace = "procvisor"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! ## Sentinel values
//! - `supervisor.workers = 0` → CPU count (capped at [`MAX_WORKERS`])
//! - `supervisor.respawn.first_delay_ms = 0` → immediate respawn
//! - `supervisor.respawn.max_restarts = 0` → unlimited
//!
//! Prefer the accessor methods over reading `*_ms` fields directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policies::{BackoffPolicy, JitterPolicy, RespawnPolicy};
use crate::substrate::{ChannelOptions, SubstrateOptions};

/// Hard ceiling on the number of worker slots.
pub const MAX_WORKERS: u32 = 64;

/// Environment variable overriding `supervisor.workers`.
pub const ENV_WORKERS: &str = "PROCVISOR_WORKERS";
/// Environment variable overriding `logging.level`.
pub const ENV_LOG: &str = "PROCVISOR_LOG";
/// Environment variable overriding `substrate.runtime_dir`.
pub const ENV_RUNTIME_DIR: &str = "PROCVISOR_RUNTIME_DIR";
/// Environment variable overriding `substrate.namespace`.
pub const ENV_NAMESPACE: &str = "PROCVISOR_NAMESPACE";

/// Complete configuration of supervisor and workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub substrate: SubstrateConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reads and parses a TOML file. Does not apply env overrides or validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (or defaults) → environment overrides → validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup(ENV_WORKERS) {
            self.supervisor.workers = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("supervisor.workers", format!("{ENV_WORKERS}={v:?} is not a number")))?;
        }
        if let Some(v) = lookup(ENV_LOG) {
            self.logging.level = v;
        }
        if let Some(v) = lookup(ENV_RUNTIME_DIR) {
            self.substrate.runtime_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_NAMESPACE) {
            self.substrate.namespace = v;
        }
        Ok(())
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if s.workers > MAX_WORKERS {
            return Err(ConfigError::invalid(
                "supervisor.workers",
                format!("{} exceeds the maximum of {MAX_WORKERS}", s.workers),
            ));
        }
        non_zero("supervisor.tick_ms", s.tick_ms)?;
        non_zero("supervisor.heartbeat_timeout_ms", s.heartbeat_timeout_ms)?;
        non_zero("supervisor.stats_interval_ms", s.stats_interval_ms)?;
        if s.respawn.factor < 1.0 || !s.respawn.factor.is_finite() {
            return Err(ConfigError::invalid(
                "supervisor.respawn.factor",
                format!("{} must be a finite number >= 1.0", s.respawn.factor),
            ));
        }

        let w = &self.worker;
        non_zero("worker.tick_ms", w.tick_ms)?;
        non_zero("worker.heartbeat_interval_ms", w.heartbeat_interval_ms)?;
        non_zero("worker.stats_interval_ms", w.stats_interval_ms)?;
        non_zero("worker.flush_interval_ms", w.flush_interval_ms)?;
        non_zero("worker.reconnect_interval_ms", w.reconnect_interval_ms)?;
        non_zero("worker.connect_timeout_ms", w.connect_timeout_ms)?;
        non_zero("worker.call_timeout_ms", w.call_timeout_ms)?;
        non_zero("worker.feed_interval_ms", w.feed_interval_ms)?;
        non_zero("worker.batch_size", w.batch_size as u64)?;
        if w.categories.is_empty() {
            return Err(ConfigError::invalid("worker.categories", "at least one category is required"));
        }
        if w.heartbeat_interval_ms >= s.heartbeat_timeout_ms {
            tracing::warn!(
                heartbeat_interval_ms = w.heartbeat_interval_ms,
                heartbeat_timeout_ms = s.heartbeat_timeout_ms,
                "worker heartbeat interval is not shorter than the supervisor timeout; healthy workers will be killed"
            );
        }

        let sub = &self.substrate;
        non_zero("substrate.channel_capacity", sub.channel_capacity as u64)?;
        if sub.max_message_bytes < 256 {
            return Err(ConfigError::invalid(
                "substrate.max_message_bytes",
                format!("{} is below the minimum of 256", sub.max_message_bytes),
            ));
        }
        let ns_ok = !sub.namespace.is_empty()
            && sub.namespace.len() <= 200
            && sub
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !ns_ok {
            return Err(ConfigError::invalid(
                "substrate.namespace",
                format!("{:?} must be 1-200 chars of [A-Za-z0-9._-]", sub.namespace),
            ));
        }
        Ok(())
    }
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

/// `[supervisor]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Number of worker slots; `0` = CPU count.
    pub workers: u32,
    /// Monitoring loop period.
    pub tick_ms: u64,
    /// A `Running` worker silent for longer than this is terminated.
    pub heartbeat_timeout_ms: u64,
    /// How long shutdown waits for workers after SIGTERM.
    pub grace_ms: u64,
    /// How long to wait for SIGKILLed workers to be reaped (also the escalation
    /// delay after a heartbeat-timeout SIGTERM).
    pub kill_grace_ms: u64,
    /// Period of the summary log line.
    pub stats_interval_ms: u64,
    /// Capacity of the in-process event bus.
    pub bus_capacity: usize,
    pub respawn: RespawnConfig,
}

impl Default for SupervisorConfig {
    /// - `workers = 0` (CPU count)
    /// - `tick = 100ms`, `heartbeat_timeout = 60s`
    /// - `grace = 30s`, `kill_grace = 2s`
    /// - `stats_interval = 60s`, `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            workers: 0,
            tick_ms: 100,
            heartbeat_timeout_ms: 60_000,
            grace_ms: 30_000,
            kill_grace_ms: 2_000,
            stats_interval_ms: 60_000,
            bus_capacity: 1024,
            respawn: RespawnConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Effective slot count: explicit, or the CPU count capped at [`MAX_WORKERS`].
    pub fn effective_workers(&self) -> u32 {
        if self.workers > 0 {
            return self.workers.min(MAX_WORKERS);
        }
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
            .clamp(1, MAX_WORKERS)
    }

    #[inline]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    #[inline]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    #[inline]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    #[inline]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    #[inline]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

/// `[supervisor.respawn]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RespawnConfig {
    /// Delay after the first crash; `0` disables backoff.
    pub first_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter: JitterPolicy,
    /// Restarts allowed per slot; `0` = unlimited.
    pub max_restarts: u32,
}

impl Default for RespawnConfig {
    fn default() -> Self {
        Self {
            first_delay_ms: 0,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: JitterPolicy::None,
            max_restarts: 0,
        }
    }
}

impl RespawnConfig {
    pub fn policy(&self) -> RespawnPolicy {
        RespawnPolicy {
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.first_delay_ms),
                max: Duration::from_millis(self.max_delay_ms),
                factor: self.factor,
                jitter: self.jitter,
            },
            max_restarts: self.max_restarts,
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Main loop period (control drain, flush check, reconnect check).
    pub tick_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stats_interval_ms: u64,
    /// Records per category that trigger an immediate flush.
    pub batch_size: usize,
    /// Maximum age of the oldest buffered record before a flush.
    pub flush_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bound on each other unit call (subscribe, unsubscribe, disconnect) and
    /// each sink batch.
    pub call_timeout_ms: u64,
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval_ms: u64,
    /// Consecutive failed reconnects before the worker enters `Error`.
    pub max_reconnect_attempts: u32,
    /// Data categories subscribed on the business unit.
    pub categories: Vec<String>,
    /// Period of the built-in synthetic feed.
    pub feed_interval_ms: u64,
    /// Capacity of the unit → runtime event queue.
    pub event_queue: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            heartbeat_interval_ms: 30_000,
            stats_interval_ms: 60_000,
            batch_size: 100,
            flush_interval_ms: 1_000,
            connect_timeout_ms: 30_000,
            call_timeout_ms: 10_000,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 5,
            categories: vec!["tick".to_owned()],
            feed_interval_ms: 100,
            event_queue: 4096,
        }
    }
}

impl WorkerConfig {
    #[inline]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[inline]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    #[inline]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[inline]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    #[inline]
    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }
}

/// `[substrate]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubstrateConfig {
    pub runtime_dir: PathBuf,
    pub namespace: String,
    /// Messages per queue (Linux caps unprivileged queues at `fs.mqueue.msg_max`, 10 by default).
    pub channel_capacity: usize,
    pub max_message_bytes: usize,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir().join("procvisor"),
            namespace: "procvisor".to_owned(),
            channel_capacity: 10,
            max_message_bytes: 1024,
        }
    }
}

impl SubstrateConfig {
    pub fn options(&self) -> SubstrateOptions {
        SubstrateOptions {
            runtime_dir: self.runtime_dir.clone(),
            namespace: self.namespace.clone(),
            channel: ChannelOptions {
                capacity: self.channel_capacity,
                max_message_bytes: self.max_message_bytes,
            },
        }
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `procvisor=debug,warn`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Pretty,
        }
    }
}
