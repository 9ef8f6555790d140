//! Error types used by the procvisor supervisor, workers and substrate.
//!
//! This module defines one enum per layer:
//!
//! - [`SubstrateError`] — failures of the shared-state region, its lock or the control channel.
//! - [`UnitError`] / [`SinkError`] — failures of the business unit and its batch sink.
//! - [`RuntimeError`] — errors raised by the supervisor itself.
//! - [`WorkerError`] — errors that end a worker process.
//! - [`ConfigError`] — configuration loading and validation.
//!
//! All of them provide `as_label` for logs. Substrate failures are fatal to the
//! process that observes them; unit and sink failures never are.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the coordination substrate.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SubstrateError {
    /// An OS resource could not be created, opened or removed.
    #[error("substrate resource {resource} unavailable: {source}")]
    Resource {
        /// Name of the resource (file path or queue name).
        resource: String,
        #[source]
        source: io::Error,
    },

    /// `attach` was called but the resource does not exist.
    #[error("substrate resource {resource} not found (is the supervisor running?)")]
    NotFound {
        /// Name of the missing resource.
        resource: String,
    },

    /// The mutual-exclusion primitive could not be acquired.
    #[error("failed to lock {path}: {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The shared-state region holds bytes that do not decode.
    #[error("shared state at {path} is corrupt: {source}")]
    Corrupt {
        /// State file path.
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The process table has no free slot.
    #[error("process table full (capacity {capacity})")]
    TableFull {
        /// Table capacity.
        capacity: usize,
    },

    /// `receive` was called on a handle that owns no inbox.
    #[error("this substrate handle has no inbox")]
    NoInbox,

    /// A control-channel operation failed for a reason other than a full queue.
    #[error("control channel {queue} failed: {source}")]
    Channel {
        /// Queue name.
        queue: String,
        #[source]
        source: io::Error,
    },
}

impl SubstrateError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use procvisor::SubstrateError;
    ///
    /// let err = SubstrateError::TableFull { capacity: 4 };
    /// assert_eq!(err.as_label(), "substrate_table_full");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            SubstrateError::Resource { .. } => "substrate_resource",
            SubstrateError::NotFound { .. } => "substrate_not_found",
            SubstrateError::Lock { .. } => "substrate_lock",
            SubstrateError::Corrupt { .. } => "substrate_corrupt",
            SubstrateError::TableFull { .. } => "substrate_table_full",
            SubstrateError::NoInbox => "substrate_no_inbox",
            SubstrateError::Channel { .. } => "substrate_channel",
        }
    }

    /// True when the error means "nothing to attach to" rather than a broken resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SubstrateError::NotFound { .. })
    }
}

/// # Errors raised by a business unit.
///
/// All variants are transient from the worker's point of view: they are counted,
/// reported to the supervisor and drive reconnection, never process exit.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum UnitError {
    /// Connecting to the upstream source failed.
    #[error("connect failed: {reason}")]
    Connect { reason: String },

    /// Connecting did not finish within the configured timeout.
    #[error("connect timed out after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    /// Subscription request was rejected.
    #[error("subscribe to {category} failed: {reason}")]
    Subscribe { category: String, reason: String },

    /// The upstream connection dropped or reported an error.
    #[error("upstream error: {reason}")]
    Upstream { reason: String },

    /// A unit call other than connect did not return in time.
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
}

impl UnitError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            UnitError::Connect { .. } => "unit_connect",
            UnitError::ConnectTimeout { .. } => "unit_connect_timeout",
            UnitError::Subscribe { .. } => "unit_subscribe",
            UnitError::Upstream { .. } => "unit_upstream",
            UnitError::Timeout { .. } => "unit_timeout",
        }
    }
}

/// # Errors raised by a batch sink.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink rejected or failed to persist the batch.
    #[error("failed to save {count} records of {category}: {reason}")]
    Save {
        category: String,
        count: usize,
        reason: String,
    },

    #[error("sink i/o error: {0}")]
    Io(#[from] io::Error),

    /// Saving did not finish within the configured timeout.
    #[error("save of {category} timed out after {timeout:?}")]
    Timeout { category: String, timeout: Duration },
}

impl SinkError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SinkError::Save { .. } => "sink_save",
            SinkError::Io(_) => "sink_io",
            SinkError::Timeout { .. } => "sink_timeout",
        }
    }
}

/// # Errors produced by the supervisor runtime.
///
/// Worker crashes and heartbeat timeouts are not errors; they are published as
/// events and handled by respawning.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// Launching a worker process failed.
    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: u32,
        #[source]
        source: io::Error,
    },

    /// OS signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use procvisor::RuntimeError;
    ///
    /// let err = RuntimeError::Spawn { worker_id: 2, source: std::io::ErrorKind::NotFound.into() };
    /// assert_eq!(err.as_label(), "runtime_spawn");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Substrate(e) => e.as_label(),
            RuntimeError::Spawn { .. } => "runtime_spawn",
            RuntimeError::Signal(_) => "runtime_signal",
            RuntimeError::Config(e) => e.as_label(),
        }
    }
}

/// # Errors that end a worker process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// The unit could not be connected and subscribed during startup.
    #[error("worker {worker_id} failed to start: {source}")]
    Startup {
        worker_id: u32,
        #[source]
        source: UnitError,
    },

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Substrate(e) => e.as_label(),
            WorkerError::Startup { .. } => "worker_startup",
            WorkerError::Signal(_) => "worker_signal",
            WorkerError::Config(e) => e.as_label(),
        }
    }
}

/// # Configuration errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A field holds a value the runtime cannot work with.
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read",
            ConfigError::Parse { .. } => "config_parse",
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
